use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::models::ResponseMetadata;
use crate::stream::patch::Patch;

pub const SSE_DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

/// One unit of the inbound delta stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Stream handshake, no effect on the document.
    Connected,
    /// Terminal signal; nothing follows.
    Done,
    /// Out-of-band information about the response.
    Metadata(ResponseMetadata),
    /// A change to apply to the current document.
    Patch(Patch),
}

impl Envelope {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Decode one line of the stream.
    ///
    /// Blank lines and JSON frames of no known shape yield `Ok(None)`.
    /// Unparseable JSON and malformed deltas are errors the caller is expected
    /// to log and skip.
    pub fn decode_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return Ok(None);
        }

        let payload = line.strip_prefix(SSE_DATA_PREFIX).unwrap_or(line);
        if payload.trim() == DONE_SENTINEL {
            return Ok(Some(Self::Done));
        }

        let frame: Value = serde_json::from_str(payload)?;
        Self::from_frame(&frame)
    }

    fn from_frame(frame: &Value) -> Result<Option<Self>> {
        let Some(object) = frame.as_object() else {
            return Ok(None);
        };

        match object.get("type").and_then(Value::as_str) {
            Some("connected") => return Ok(Some(Self::Connected)),
            Some("done") => return Ok(Some(Self::Done)),
            _ => {}
        }

        if object.get("object").is_some_and(Value::is_string) {
            let metadata: ResponseMetadata = serde_json::from_value(frame.clone())?;
            return Ok(Some(Self::Metadata(metadata)));
        }

        match object.get("delta") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
            Some(delta) => Patch::from_value(delta)
                .map(|patch| Some(Self::Patch(patch)))
                .map_err(|e| RelayError::from(e).with_details(delta.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::stream::patch::PathSegment;

    #[test]
    fn test_control_frames() {
        assert_eq!(
            Envelope::decode_line(r#"{"type":"connected"}"#).unwrap(),
            Some(Envelope::Connected)
        );
        assert_eq!(
            Envelope::decode_line(r#"data: {"type":"done"}"#).unwrap(),
            Some(Envelope::Done)
        );
        assert_eq!(Envelope::decode_line("data: [DONE]").unwrap(), Some(Envelope::Done));
        assert_eq!(Envelope::decode_line("[DONE]").unwrap(), Some(Envelope::Done));
    }

    #[test]
    fn test_blank_and_unknown_frames_are_ignored() {
        assert_eq!(Envelope::decode_line("").unwrap(), None);
        assert_eq!(Envelope::decode_line("   \r").unwrap(), None);
        assert_eq!(Envelope::decode_line(r#"{"type":"ping"}"#).unwrap(), None);
        assert_eq!(Envelope::decode_line(r#"{"delta":null}"#).unwrap(), None);
        assert_eq!(Envelope::decode_line("17").unwrap(), None);
    }

    #[test]
    fn test_metadata_frame() {
        let env = Envelope::decode_line(
            r#"data: {"object":"chat","id":"abc","webUrl":"https://example.test/chat/abc"}"#,
        )
        .unwrap();
        match env {
            Some(Envelope::Metadata(meta)) => {
                assert_eq!(meta.object, "chat");
                assert_eq!(meta.id.as_deref(), Some("abc"));
                assert_eq!(meta.web_url.as_deref(), Some("https://example.test/chat/abc"));
            }
            other => panic!("expected metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_patch_frame() {
        let env = Envelope::decode_line(r#"data: {"delta":[[0,1,"!"],9,9]}"#).unwrap();
        assert_eq!(
            env,
            Some(Envelope::Patch(Patch::Append {
                path: vec![PathSegment::Index(0), PathSegment::Index(1)],
                text: "!".to_string()
            }))
        );
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        let err = Envelope::decode_line(r#"data: {"delta": [[0,"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::Decode);
    }

    #[test]
    fn test_malformed_delta_is_patch_error() {
        let err = Envelope::decode_line(r#"{"delta": [1, 2, 3, 4]}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::Patch);
        assert!(err.details.is_some());
    }
}
