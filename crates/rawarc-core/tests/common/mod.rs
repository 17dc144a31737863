pub mod segment_server;

use std::sync::Arc;

use rawarc_core::freg::FregJson;

pub fn sample_freg() -> Arc<FregJson> {
    let json = r#"{
        "video": { "299": "https://example.com/v" },
        "audio": { "140": "https://example.com/a" },
        "metadata": {
            "title": "Integration Stream",
            "id": "testid",
            "channelName": "chan",
            "channelURL": "https://www.youtube.com/channel/UCtest",
            "startTimestamp": "2021-06-05T12:30:00Z"
        },
        "createTime": "2021-06-05T15:00:00Z"
    }"#;
    Arc::new(serde_json::from_str(json).unwrap())
}
