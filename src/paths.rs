//! Filesystem layout and name handling.
//!
//! All per-camera output lives under `<media>/<sanitised-name>/`:
//!
//! ```text
//! <media>/<name>/tmp/segment-%03d.<ext>   rolling ring written by the muxer
//! <media>/<name>/tmp/saved/<ts>.<ext>     segments retained by motion
//! <media>/<name>/motion-<ts>.<ext>        exported clips
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{NvrError, NvrResult};

/// Directory containing the running executable; the default root for
/// `cameras.json`, `settings.json` and `media/`.
pub fn executable_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Camera names become path and mount components after dropping everything
/// outside `[A-Za-z0-9_-]`.
pub fn sanitize_camera_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// A camera name is accepted when it is non-empty and made of
/// `[A-Za-z0-9._-]` only.
pub fn is_valid_camera_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

pub fn ensure_dir(path: &Path) -> NvrResult<()> {
    fs::create_dir_all(path).map_err(|e| NvrError::io(format!("create {}", path.display()), e))
}

/// Per-camera media directory (`<media>/<sanitised>`), created on demand
/// together with its `tmp/` segment directory.
pub fn camera_media_dir(media_root: &Path, name: &str) -> NvrResult<PathBuf> {
    let dir = media_root.join(sanitize_camera_name(name));
    ensure_dir(&dir)?;
    ensure_dir(&dir.join("tmp"))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_hazards() {
        assert_eq!(sanitize_camera_name("front door"), "frontdoor");
        assert_eq!(sanitize_camera_name("../../etc"), "etc");
        assert_eq!(sanitize_camera_name("cam_1-a"), "cam_1-a");
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_camera_name("front.door_1-a"));
        assert!(!is_valid_camera_name(""));
        assert!(!is_valid_camera_name("front door"));
        assert!(!is_valid_camera_name("cam/1"));
    }

    #[test]
    fn media_dir_layout() {
        let root = tempfile::tempdir().unwrap();
        let dir = camera_media_dir(root.path(), "front").unwrap();
        assert!(dir.ends_with("front"));
        assert!(dir.join("tmp").is_dir());
    }
}
