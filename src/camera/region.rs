//! Motion regions: optionally rotated rectangles in motion-frame pixels.
//!
//! A point belongs to a region iff, after rotating the frame coordinate
//! system by `-angle_deg` about the region centre, it lies inside the
//! axis-aligned rectangle. With `angle_deg == 0` this degenerates to plain
//! rectangle containment. Zero regions on a camera means "analyse the whole
//! frame"; that rule lives in the analyser, not here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionRegion {
    pub id: u32,
    pub rect: RegionRect,
    pub angle_deg: f32,
}

impl MotionRegion {
    pub fn new(id: u32, rect: RegionRect, angle_deg: f32) -> MotionRegion {
        MotionRegion { id, rect, angle_deg }
    }

    fn center(&self) -> (f32, f32) {
        (
            self.rect.x as f32 + self.rect.w as f32 / 2.0,
            self.rect.y as f32 + self.rect.h as f32 / 2.0,
        )
    }

    /// Closed containment test in frame coordinates.
    pub fn contains(&self, px: f32, py: f32) -> bool {
        let (cx, cy) = self.center();
        // Rotate the point by -angle about the centre, then test the
        // axis-aligned bounds. Exact for angle 0 (sin=0, cos=1).
        let rad = -self.angle_deg.to_radians();
        let (sin, cos) = rad.sin_cos();
        let dx = px - cx;
        let dy = py - cy;
        let rx = dx * cos - dy * sin;
        let ry = dx * sin + dy * cos;
        rx.abs() <= self.rect.w as f32 / 2.0 && ry.abs() <= self.rect.h as f32 / 2.0
    }

    /// The rectangle's corners after rotation about its centre, in drawing
    /// order (adjacent corners are joined by edges).
    pub fn corners(&self) -> [(f32, f32); 4] {
        let (cx, cy) = self.center();
        let hw = self.rect.w as f32 / 2.0;
        let hh = self.rect.h as f32 / 2.0;
        let rad = self.angle_deg.to_radians();
        let (sin, cos) = rad.sin_cos();
        let rotate = |dx: f32, dy: f32| (cx + dx * cos - dy * sin, cy + dx * sin + dy * cos);
        [
            rotate(-hw, -hh),
            rotate(hw, -hh),
            rotate(hw, hh),
            rotate(-hw, hh),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: i32, y: i32, w: i32, h: i32, angle: f32) -> MotionRegion {
        MotionRegion::new(1, RegionRect { x, y, w, h }, angle)
    }

    /// With angle 0, containment is plain rectangle containment.
    #[test]
    fn axis_aligned_matches_rect() {
        let r = region(0, 0, 10, 10, 0.0);
        assert!(r.contains(5.0, 5.0));
        assert!(r.contains(0.0, 0.0));
        assert!(r.contains(10.0, 10.0));
        assert!(!r.contains(10.1, 5.0));
        assert!(!r.contains(50.0, 50.0));
    }

    /// A 10x4 rect rotated by 90 degrees covers roughly the 4x10 band
    /// centred at (5, 2).
    #[test]
    fn rotated_band() {
        let r = region(0, 0, 10, 4, 90.0);
        assert!(r.contains(3.0, 5.0));
        assert!(r.contains(5.0, -3.0));
        assert!(!r.contains(0.0, 0.0));
        assert!(!r.contains(9.0, 2.0));
    }

    /// Containment agrees with the convex hull of the rotated corners.
    #[test]
    fn corners_agree_with_containment() {
        let r = region(2, 3, 8, 6, 37.0);
        let corners = r.corners();
        // Hull test: the point is inside iff it is on the same side of all
        // four (directed) edges.
        let inside_hull = |px: f32, py: f32| {
            let mut sign = 0.0f32;
            for i in 0..4 {
                let (ax, ay) = corners[i];
                let (bx, by) = corners[(i + 1) % 4];
                let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
                if cross.abs() < 1e-4 {
                    continue;
                }
                if sign == 0.0 {
                    sign = cross.signum();
                } else if cross.signum() != sign {
                    return false;
                }
            }
            true
        };
        for (px, py) in [(6.0, 6.0), (2.0, 3.0), (12.0, 2.0), (-3.0, 9.0), (6.0, -2.0)] {
            assert_eq!(r.contains(px, py), inside_hull(px, py), "point ({px},{py})");
        }
    }

    #[test]
    fn full_rotation_is_identity() {
        let r0 = region(0, 0, 10, 4, 0.0);
        let r360 = region(0, 0, 10, 4, 360.0);
        // Stay clear of the exact edges; a 360-degree rotation is identity
        // only up to float rounding.
        for (px, py) in [(0.1, 0.1), (5.0, 2.0), (9.9, 3.9), (11.0, 2.0), (5.0, 4.5)] {
            assert_eq!(r0.contains(px, py), r360.contains(px, py), "point ({px},{py})");
        }
    }
}
