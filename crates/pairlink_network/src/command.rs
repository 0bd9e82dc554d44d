//! Command protocol: the closed set of tagged commands carried on the
//! reliable channel, and their wire codec.
//!
//! Wire form is a JSON object whose `"type"` field names the variant, with
//! the variant's fields alongside it:
//!
//! ```json
//! {"type":"batch_item_starting","file_name":"IMG_0001.jpg","index":1,"total":3}
//! ```
//!
//! Decoding never runs application logic. A well-formed object carrying a
//! tag this build does not know is reported as [`DecodeError::UnknownCommand`]
//! so newer peers can add variants without older ones misreading them.

use serde::{Deserialize, Serialize};

/// One unit of the application protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    // ── Text entry ──────────────────────────────────────────────────
    /// Live preview of the text being composed; never typed.
    Preview { text: String },
    /// Type the text at the cursor.
    Insert { text: String },
    /// Type the text, then press return.
    InsertAndSubmit { text: String },
    /// Press return.
    Submit,

    // ── Editing keys ────────────────────────────────────────────────
    ClearField,
    Paste,
    DeleteChar,
    SelectAll,
    Copy,
    Cut,

    // ── Settings sync ───────────────────────────────────────────────
    /// Ask the receiver to click at the stored position before typing.
    SetPrePositionClick { enabled: bool },
    /// Receiver's report of its current pre-position-click setting.
    PrePositionClickState { enabled: bool },

    // ── Photo batches ───────────────────────────────────────────────
    /// Announces the file names of a batch before any bytes are sent.
    BatchAnnounce { file_names: Vec<String> },
    /// Item `index` (1-based) of `total` is about to stream.
    BatchItemStarting {
        file_name: String,
        index: u32,
        total: u32,
    },
    /// Every item of the batch has reached a terminal outcome.
    BatchComplete,
}

impl Command {
    /// Every wire tag this build understands.
    pub const TAGS: [&'static str; 15] = [
        "preview",
        "insert",
        "insert_and_submit",
        "submit",
        "clear_field",
        "paste",
        "delete_char",
        "select_all",
        "copy",
        "cut",
        "set_pre_position_click",
        "pre_position_click_state",
        "batch_announce",
        "batch_item_starting",
        "batch_complete",
    ];

    /// The wire tag of this command.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Preview { .. } => "preview",
            Self::Insert { .. } => "insert",
            Self::InsertAndSubmit { .. } => "insert_and_submit",
            Self::Submit => "submit",
            Self::ClearField => "clear_field",
            Self::Paste => "paste",
            Self::DeleteChar => "delete_char",
            Self::SelectAll => "select_all",
            Self::Copy => "copy",
            Self::Cut => "cut",
            Self::SetPrePositionClick { .. } => "set_pre_position_click",
            Self::PrePositionClickState { .. } => "pre_position_click_state",
            Self::BatchAnnounce { .. } => "batch_announce",
            Self::BatchItemStarting { .. } => "batch_item_starting",
            Self::BatchComplete => "batch_complete",
        }
    }

    /// Whether this command brackets or sequences a photo batch.
    pub fn is_batch_control(&self) -> bool {
        matches!(
            self,
            Self::BatchAnnounce { .. } | Self::BatchItemStarting { .. } | Self::BatchComplete
        )
    }

    /// Serialize the command for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode(self)
    }

    /// Reconstruct a command from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }
}

/// Encoding failures. Only reachable when a value breaks a protocol
/// invariant; every valid command encodes.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("batch item index {index} outside 1..={total}")]
    InvalidBatchIndex { index: u32, total: u32 },

    #[error("command serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Decoding failures. A failed decode never yields a partial command.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed command: {0}")]
    Malformed(String),

    #[error("unknown command type: {0}")]
    UnknownCommand(String),
}

/// Serialize a command to bytes.
pub fn encode(command: &Command) -> Result<Vec<u8>, EncodeError> {
    if let Command::BatchItemStarting { index, total, .. } = command {
        check_batch_index(*index, *total)
            .map_err(|_| EncodeError::InvalidBatchIndex { index: *index, total: *total })?;
    }
    Ok(serde_json::to_vec(command)?)
}

/// Deserialize a command from bytes.
pub fn decode(bytes: &[u8]) -> Result<Command, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let tag = value
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("expected a JSON object".to_string()))?
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| DecodeError::Malformed("missing \"type\" tag".to_string()))?;

    if !Command::TAGS.contains(&tag) {
        return Err(DecodeError::UnknownCommand(tag.to_string()));
    }

    let command: Command =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    if let Command::BatchItemStarting { index, total, .. } = &command {
        check_batch_index(*index, *total).map_err(DecodeError::Malformed)?;
    }

    Ok(command)
}

fn check_batch_index(index: u32, total: u32) -> Result<(), String> {
    if index == 0 || index > total {
        Err(format!("batch item index {index} outside 1..={total}"))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn every_variant() -> Vec<Command> {
        vec![
            Command::Preview { text: "hel".to_string() },
            Command::Insert { text: "hello".to_string() },
            Command::InsertAndSubmit { text: "ls -la\n".to_string() },
            Command::Submit,
            Command::ClearField,
            Command::Paste,
            Command::DeleteChar,
            Command::SelectAll,
            Command::Copy,
            Command::Cut,
            Command::SetPrePositionClick { enabled: true },
            Command::PrePositionClickState { enabled: false },
            Command::BatchAnnounce {
                file_names: vec!["IMG_0001.jpg".to_string(), "IMG_0002.jpg".to_string()],
            },
            Command::BatchItemStarting {
                file_name: "IMG_0002.jpg".to_string(),
                index: 2,
                total: 2,
            },
            Command::BatchComplete,
        ]
    }

    #[test]
    fn test_every_variant_roundtrips() {
        for command in every_variant() {
            let bytes = encode(&command).unwrap();
            assert_eq!(decode(&bytes).unwrap(), command);
        }
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        let variants = every_variant();
        assert_eq!(variants.len(), Command::TAGS.len());
        for command in variants {
            let value: serde_json::Value =
                serde_json::from_slice(&command.encode().unwrap()).unwrap();
            assert_eq!(value["type"], command.kind());
            assert!(Command::TAGS.contains(&command.kind()));
        }
    }

    #[test]
    fn test_wire_shape_is_self_describing() {
        let bytes = encode(&Command::BatchItemStarting {
            file_name: "a.jpg".to_string(),
            index: 1,
            total: 3,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "batch_item_starting",
                "file_name": "a.jpg",
                "index": 1,
                "total": 3
            })
        );

        let unit = encode(&Command::Submit).unwrap();
        assert_eq!(unit, br#"{"type":"submit"}"#);
    }

    #[test]
    fn test_unknown_tag_is_detected() {
        match decode(br#"{"type":"rotate_screen","degrees":90}"#) {
            Err(DecodeError::UnknownCommand(tag)) => assert_eq!(tag, "rotate_screen"),
            other => panic!("Expected UnknownCommand, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_inputs_fail() {
        let inputs: [&[u8]; 13] = [
            b"",
            b"\xff\xfe\x00",
            b"not json",
            b"[1,2,3]",
            b"\"insert\"",
            br#"{"text":"no tag"}"#,
            br#"{"type":42}"#,
            br#"{"type":"insert"}"#,
            br#"{"type":"insert","text":7}"#,
            br#"{"type":"batch_announce","file_names":"a.jpg"}"#,
            br#"{"type":"set_pre_position_click","enabled":"yes"}"#,
            br#"{"type":"batch_item_starting","file_name":"a.jpg","index":1}"#,
            br#"{"type":"insert","text":"trunc"#,
        ];

        for input in inputs {
            assert!(
                matches!(decode(input), Err(DecodeError::Malformed(_))),
                "input {:?} should be malformed",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn test_batch_index_bounds() {
        let zero = Command::BatchItemStarting {
            file_name: "a.jpg".to_string(),
            index: 0,
            total: 2,
        };
        assert!(matches!(
            encode(&zero),
            Err(EncodeError::InvalidBatchIndex { index: 0, total: 2 })
        ));

        let past_end = br#"{"type":"batch_item_starting","file_name":"a.jpg","index":3,"total":2}"#;
        assert!(matches!(decode(past_end), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let bytes = br#"{"type":"insert","text":"hi","sent_at":"2024-01-01"}"#;
        assert_eq!(
            decode(bytes).unwrap(),
            Command::Insert { text: "hi".to_string() }
        );
    }

    #[test]
    fn test_batch_control_classification() {
        assert!(Command::BatchComplete.is_batch_control());
        assert!(Command::BatchAnnounce { file_names: vec![] }.is_batch_control());
        assert!(!Command::Paste.is_batch_control());
        assert!(!Command::Preview { text: String::new() }.is_batch_control());
    }
}
