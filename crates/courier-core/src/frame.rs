//! Wire-level frame model shared by the server and its handlers.
//!
//! Every message on a connection is one JSON-encoded [`Frame`]. The frame
//! type is a small integer on the wire; `ack_time` and `err_count` are
//! server-local bookkeeping and never serialized.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Kind of frame, encoded as a small integer under the `frameType` key.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FrameType {
    /// Payload to route to a handler.
    #[default]
    Data,
    /// Liveness probe, answered with an immediate Ping reply.
    Ping,
    /// Carries an acknowledgment of a prior Data frame.
    Ack,
    /// Client opt-out: bypasses acknowledgment tracking entirely.
    NoAck,
    /// Carries a stringified failure for client display.
    Err,
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> u8 {
        match t {
            FrameType::Data => 0x0,
            FrameType::Ping => 0x1,
            FrameType::Ack => 0x2,
            FrameType::NoAck => 0x3,
            FrameType::Err => 0x9,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown frame type {0}")]
pub struct UnknownFrameType(pub u8);

impl TryFrom<u8> for FrameType {
    type Error = UnknownFrameType;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x0 => Ok(FrameType::Data),
            0x1 => Ok(FrameType::Ping),
            0x2 => Ok(FrameType::Ack),
            0x3 => Ok(FrameType::NoAck),
            0x9 => Ok(FrameType::Err),
            other => Err(UnknownFrameType(other)),
        }
    }
}

/// Reliability tier applied to inbound Data frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Forward every frame to processing immediately, no bookkeeping.
    #[default]
    Disabled,
    /// Reply with an Ack and forward on the same pass, no round trip.
    Single,
    /// Two-phase: request an Ack, forward only once the client confirms.
    Rigorous,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Disabled => "disabled",
            AckMode::Single => "single",
            AckMode::Rigorous => "rigorous",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown ack mode {0:?} (expected disabled, single or rigorous)")]
pub struct AckModeParseError(String);

impl FromStr for AckMode {
    type Err = AckModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" | "none" => Ok(AckMode::Disabled),
            "single" => Ok(AckMode::Single),
            "rigorous" | "rigor" => Ok(AckMode::Rigorous),
            other => Err(AckModeParseError(other.to_string())),
        }
    }
}

/// The envelope for all traffic on a connection.
///
/// `id` correlates a Data frame with the Ack frames that confirm it;
/// `ack_seq` is the per-id acknowledgment counter and never decreases
/// across observed frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub frame_type: FrameType,
    #[serde(default)]
    pub ack_seq: u64,
    /// When the server last requested an Ack for this frame. Server-local.
    #[serde(skip)]
    pub ack_time: Option<Instant>,
    /// Reserved retry counter. Server-local.
    #[serde(skip)]
    pub err_count: u32,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub form_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            id: String::new(),
            frame_type: FrameType::Data,
            ack_seq: 0,
            ack_time: None,
            err_count: 0,
            method: String::new(),
            form_id: String::new(),
            data: serde_json::Value::Null,
        }
    }
}

impl Frame {
    /// A Data frame carrying an opaque payload for the given conversation.
    pub fn data(form_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            frame_type: FrameType::Data,
            form_id: form_id.into(),
            data,
            ..Self::default()
        }
    }

    /// An Err frame carrying a stringified failure for the client.
    pub fn error(err: impl fmt::Display) -> Self {
        Self {
            frame_type: FrameType::Err,
            data: serde_json::Value::String(err.to_string()),
            ..Self::default()
        }
    }

    pub fn ping() -> Self {
        Self {
            frame_type: FrameType::Ping,
            ..Self::default()
        }
    }

    /// An Ack frame confirming (or requesting confirmation of) `id`.
    pub fn ack(id: impl Into<String>, ack_seq: u64) -> Self {
        Self {
            frame_type: FrameType::Ack,
            id: id.into(),
            ack_seq,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_wire_codes() {
        assert_eq!(u8::from(FrameType::Data), 0x0);
        assert_eq!(u8::from(FrameType::Ping), 0x1);
        assert_eq!(u8::from(FrameType::Ack), 0x2);
        assert_eq!(u8::from(FrameType::NoAck), 0x3);
        assert_eq!(u8::from(FrameType::Err), 0x9);
    }

    #[test]
    fn frame_type_rejects_unknown_code() {
        assert!(FrameType::try_from(0x4).is_err());
        assert!(FrameType::try_from(0xff).is_err());
    }

    #[test]
    fn serializes_camel_case_with_integer_type() {
        let frame = Frame::data("form_1", serde_json::json!({"text": "hi"}));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["frameType"], 0);
        assert_eq!(json["formId"], "form_1");
        assert_eq!(json["ackSeq"], 0);
        assert_eq!(json["data"]["text"], "hi");
    }

    #[test]
    fn server_local_fields_not_serialized() {
        let mut frame = Frame::data("f", serde_json::Value::Null);
        frame.ack_time = Some(Instant::now());
        frame.err_count = 3;
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("ackTime").is_none());
        assert!(json.get("errCount").is_none());
        assert!(json.get("ack_time").is_none());
    }

    #[test]
    fn decodes_client_frame() {
        let raw = r#"{"id":"m1","frameType":0,"ackSeq":0,"method":"chat.send","formId":"f1","data":{"text":"hello"}}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.id, "m1");
        assert_eq!(frame.frame_type, FrameType::Data);
        assert_eq!(frame.method, "chat.send");
        assert!(frame.ack_time.is_none());
    }

    #[test]
    fn decodes_sparse_frame_with_defaults() {
        let frame: Frame = serde_json::from_str(r#"{"frameType":1}"#).unwrap();
        assert_eq!(frame.frame_type, FrameType::Ping);
        assert_eq!(frame.id, "");
        assert_eq!(frame.ack_seq, 0);
        assert!(frame.data.is_null());
    }

    #[test]
    fn decode_rejects_unknown_frame_type() {
        assert!(serde_json::from_str::<Frame>(r#"{"frameType":7}"#).is_err());
    }

    #[test]
    fn ack_constructor_carries_id_and_seq() {
        let frame = Frame::ack("m1", 2);
        assert_eq!(frame.frame_type, FrameType::Ack);
        assert_eq!(frame.id, "m1");
        assert_eq!(frame.ack_seq, 2);
    }

    #[test]
    fn error_constructor_stringifies() {
        let frame = Frame::error("token expired");
        assert_eq!(frame.frame_type, FrameType::Err);
        assert_eq!(frame.data, serde_json::json!("token expired"));
    }

    #[test]
    fn ack_mode_parses_and_displays() {
        assert_eq!("disabled".parse::<AckMode>().unwrap(), AckMode::Disabled);
        assert_eq!("single".parse::<AckMode>().unwrap(), AckMode::Single);
        assert_eq!("rigorous".parse::<AckMode>().unwrap(), AckMode::Rigorous);
        assert!("bogus".parse::<AckMode>().is_err());
        assert_eq!(AckMode::Rigorous.to_string(), "rigorous");
        assert_eq!(AckMode::default(), AckMode::Disabled);
    }
}
