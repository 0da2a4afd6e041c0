//! The `cameras.json` document contract: pretty-printed `{"cameras": [..]}`
//! where each entry loads independently, so one bad entry cannot take the
//! rest of the registry down with it.

use nvrd::{CameraDefinition, SettingsData};
use serde_json::json;

#[test]
fn document_round_trips_per_entry() {
    let settings = SettingsData::default();
    let mut front = CameraDefinition::from_settings("front", "rtsp://10.0.0.5/stream", &settings);
    front.segment = true;
    front.motion_frame = true;
    let yard = CameraDefinition::from_settings("yard", "rtsp://10.0.0.6/stream", &settings);

    let doc = serde_json::to_string_pretty(&json!({ "cameras": [front, yard] })).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&doc).unwrap();
    let entries = parsed["cameras"].as_array().unwrap();
    assert_eq!(entries.len(), 2);

    let restored: Vec<CameraDefinition> = entries
        .iter()
        .filter_map(|e| serde_json::from_value(e.clone()).ok())
        .collect();
    assert_eq!(restored.len(), 2);
    assert!(restored[0].segment && restored[0].motion_frame);
    assert_eq!(restored[1].name, "yard");
}

#[test]
fn malformed_entry_fails_alone() {
    let doc = json!({
        "cameras": [
            { "name": "good", "uri": "rtsp://10.0.0.5/stream" },
            { "name": "no-uri-here" },
            { "name": "also-good", "uri": "rtsp://10.0.0.6/stream", "segment": true },
        ]
    });

    let restored: Vec<CameraDefinition> = doc["cameras"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| serde_json::from_value(e.clone()).ok())
        .collect();

    // The middle entry is unloadable; its neighbours survive.
    assert_eq!(restored.len(), 2);
    assert_eq!(restored[0].name, "good");
    assert!(restored[1].segment);
}
