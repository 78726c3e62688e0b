use serde::{Deserialize, Serialize};

/// Signaling frames exchanged with browsers over the `/websocket` endpoint.
///
/// The wire format is `{"event": "...", "data": "..."}` where `data` is an
/// opaque string whose interpretation depends on the event: JSON-encoded SDP
/// for `offer`/`answer`, a JSON-encoded ICE candidate init for `candidate`,
/// a video name for `publish`, a track id for `remove`, and a human-readable
/// message for the server-emitted `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum SignalFrame {
    /// SDP offer, server → client
    Offer(String),
    /// SDP answer, client → server
    Answer(String),
    /// Trickle ICE candidate, either direction
    Candidate(String),
    /// Request to publish a stored video, client → server
    Publish(String),
    /// Request to remove a published track by id, client → server
    Remove(String),
    /// Failure report, server → client
    Error(String),
}

impl SignalFrame {
    /// Event name as it appears on the wire, for logging.
    pub fn event(&self) -> &'static str {
        match self {
            SignalFrame::Offer(_) => "offer",
            SignalFrame::Answer(_) => "answer",
            SignalFrame::Candidate(_) => "candidate",
            SignalFrame::Publish(_) => "publish",
            SignalFrame::Remove(_) => "remove",
            SignalFrame::Error(_) => "error",
        }
    }
}

/// Result of storing an uploaded video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadInfo {
    /// Name the blob was stored under.
    pub key: String,
    /// Stored size in bytes.
    pub size: u64,
}

/// JSON envelope returned by the upload/delete endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// HTTP-style status code, duplicated in the body for script clients.
    pub status: u16,
    #[serde(default)]
    pub is_converting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadResponse {
    /// Upload stored as-is, no conversion required.
    pub fn stored(info: UploadInfo) -> Self {
        Self {
            status: 200,
            is_converting: false,
            result: serde_json::to_value(info).ok(),
            error: None,
        }
    }

    /// Upload accepted, background conversion in progress.
    pub fn converting() -> Self {
        Self {
            status: 200,
            is_converting: true,
            result: Some(serde_json::Value::String(
                "video uploaded successfully".to_string(),
            )),
            error: None,
        }
    }

    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            status: 200,
            is_converting: false,
            result: Some(serde_json::Value::String(result.into())),
            error: None,
        }
    }

    pub fn failure(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            is_converting: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_frame_wire_format() {
        let frame = SignalFrame::Offer(r#"{"type":"offer","sdp":"v=0\r\n"}"#.to_string());
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""event":"offer""#));
        assert!(json.contains(r#""data":"#));

        let parsed: SignalFrame = serde_json::from_str(&json).unwrap();
        match parsed {
            SignalFrame::Offer(data) => assert!(data.contains("v=0")),
            other => panic!("expected offer, got {}", other.event()),
        }
    }

    #[test]
    fn publish_frame_from_browser() {
        // Browsers JSON.stringify the video name, so the payload arrives quoted.
        let raw = r#"{"event":"publish","data":"\"clip.mp4\""}"#;
        let frame: SignalFrame = serde_json::from_str(raw).unwrap();
        match frame {
            SignalFrame::Publish(data) => assert_eq!(data, "\"clip.mp4\""),
            other => panic!("expected publish, got {}", other.event()),
        }
    }

    #[test]
    fn candidate_frame_roundtrip() {
        let frame = SignalFrame::Candidate(
            r#"{"candidate":"candidate:1 1 UDP 2130706431 10.0.0.1 50000 typ host"}"#.to_string(),
        );
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""event":"candidate""#));
        let _: SignalFrame = serde_json::from_str(&json).unwrap();
    }

    #[test]
    fn remove_frame_carries_track_id() {
        let raw = r#"{"event":"remove","data":"8f7a1c2e-1111-2222-3333-444455556666"}"#;
        let frame: SignalFrame = serde_json::from_str(raw).unwrap();
        match frame {
            SignalFrame::Remove(id) => assert!(id.starts_with("8f7a1c2e")),
            other => panic!("expected remove, got {}", other.event()),
        }
    }

    #[test]
    fn unknown_event_rejected() {
        let raw = r#"{"event":"subscribe","data":"x"}"#;
        assert!(serde_json::from_str::<SignalFrame>(raw).is_err());
    }

    #[test]
    fn stored_response_envelope() {
        let resp = UploadResponse::stored(UploadInfo {
            key: "clip.mp4".to_string(),
            size: 1024,
        });
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""status":200"#));
        assert!(json.contains(r#""isConverting":false"#));
        assert!(json.contains(r#""key":"clip.mp4""#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn converting_response_envelope() {
        let resp = UploadResponse::converting();
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""isConverting":true"#));
        assert!(json.contains("video uploaded successfully"));
    }

    #[test]
    fn failure_response_envelope() {
        let resp = UploadResponse::failure(400, "missing multipart field 'video'");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""status":400"#));
        assert!(json.contains("missing multipart field"));
        assert!(!json.contains("result"));
    }
}
