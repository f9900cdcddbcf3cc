//! Wire protocol for transfer sessions.
//!
//! Every frame is a UTF-8 JSON object carrying an integer `type` tag and the
//! `transferId` of the session it belongs to:
//!
//! | type | message          |
//! |------|------------------|
//! | 0    | TransferRequest  |
//! | 1    | TransferResponse |
//! | 2    | FileData         |
//! | 3    | TransferComplete |
//! | 4    | TransferCancel   |
//!
//! `FileData.data` is the binary chunk body encoded as a base64 string.
//! Field names on the wire are camelCase.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

/// A transfer request: "may I send you this file?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub transfer_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub file_name: String,
    pub file_size: u64,
    /// SHA-256 of the plaintext file, lowercase hex. Empty when unknown.
    pub file_hash: String,
}

/// The receiver's accept/reject decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub transfer_id: String,
    pub accepted: bool,
    pub receiver_id: String,
    pub receiver_name: String,
    /// Destination path on the receiver, informational only.
    pub file_path: String,
}

/// One chunk of the (possibly encrypted) file body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// End-of-transfer notice; each side sends one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferComplete {
    pub transfer_id: String,
    pub success: bool,
    /// SHA-256 of the plaintext file for verification. Empty when unknown.
    pub file_hash: String,
}

/// Abort notice, sent by either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCancel {
    pub transfer_id: String,
    pub reason: String,
}

/// All protocol messages, routed by the numeric `type` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    TransferRequest(TransferRequest),
    TransferResponse(TransferResponse),
    FileData(FileData),
    TransferComplete(TransferComplete),
    TransferCancel(TransferCancel),
}

impl Message {
    pub fn transfer_id(&self) -> &str {
        match self {
            Message::TransferRequest(m) => &m.transfer_id,
            Message::TransferResponse(m) => &m.transfer_id,
            Message::FileData(m) => &m.transfer_id,
            Message::TransferComplete(m) => &m.transfer_id,
            Message::TransferCancel(m) => &m.transfer_id,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Message::TransferRequest(_) => 0,
            Message::TransferResponse(_) => 1,
            Message::FileData(_) => 2,
            Message::TransferComplete(_) => 3,
            Message::TransferCancel(_) => 4,
        }
    }

    /// Encode as a JSON frame body (without transport framing).
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut value = match self {
            Message::TransferRequest(m) => serde_json::to_value(m),
            Message::TransferResponse(m) => serde_json::to_value(m),
            Message::FileData(m) => serde_json::to_value(m),
            Message::TransferComplete(m) => serde_json::to_value(m),
            Message::TransferCancel(m) => serde_json::to_value(m),
        }
        .context("failed to encode message body")?;

        let obj = value
            .as_object_mut()
            .ok_or_else(|| anyhow!("message body did not encode as an object"))?;
        obj.insert("type".to_string(), self.kind().into());

        serde_json::to_vec(&value).context("failed to encode message frame")
    }

    /// Decode a JSON frame body.
    pub fn deserialize(bytes: &[u8]) -> Result<Message> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).context("malformed message JSON")?;

        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| anyhow!("message missing integer `type` tag"))?;

        // Unknown sibling fields (the tag itself included) are ignored by serde.
        Ok(match kind {
            0 => Message::TransferRequest(serde_json::from_value(value)?),
            1 => Message::TransferResponse(serde_json::from_value(value)?),
            2 => Message::FileData(serde_json::from_value(value)?),
            3 => Message::TransferComplete(serde_json::from_value(value)?),
            4 => Message::TransferCancel(serde_json::from_value(value)?),
            other => bail!("unknown message type {other}"),
        })
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Message {
        let bytes = msg.serialize().unwrap();
        Message::deserialize(&bytes).unwrap()
    }

    #[test]
    fn request_round_trip() {
        let msg = Message::TransferRequest(TransferRequest {
            transfer_id: "t-1".into(),
            sender_id: "peer-a".into(),
            sender_name: "Alice".into(),
            file_name: "notes.txt".into(),
            file_size: 1234,
            file_hash: "abcd".into(),
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn response_round_trip() {
        let msg = Message::TransferResponse(TransferResponse {
            transfer_id: "t-1".into(),
            accepted: false,
            receiver_id: "peer-b".into(),
            receiver_name: "Bob".into(),
            file_path: "/downloads/notes.txt".into(),
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn file_data_round_trip() {
        let msg = Message::FileData(FileData {
            transfer_id: "t-1".into(),
            chunk_index: 7,
            total_chunks: 9,
            data: vec![0, 1, 2, 255, 254, 253],
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn empty_chunk_round_trip() {
        let msg = Message::FileData(FileData {
            transfer_id: "t-0".into(),
            chunk_index: 0,
            total_chunks: 1,
            data: Vec::new(),
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn complete_and_cancel_round_trip() {
        let complete = Message::TransferComplete(TransferComplete {
            transfer_id: "t-1".into(),
            success: true,
            file_hash: "ff00".into(),
        });
        assert_eq!(round_trip(complete.clone()), complete);

        let cancel = Message::TransferCancel(TransferCancel {
            transfer_id: "t-1".into(),
            reason: "Canceled by user".into(),
        });
        assert_eq!(round_trip(cancel.clone()), cancel);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let msg = Message::FileData(FileData {
            transfer_id: "t-1".into(),
            chunk_index: 0,
            total_chunks: 1,
            data: vec![1, 2, 3],
        });
        let text = String::from_utf8(msg.serialize().unwrap()).unwrap();
        assert!(text.contains("\"transferId\""), "{text}");
        assert!(text.contains("\"chunkIndex\""), "{text}");
        assert!(text.contains("\"totalChunks\""), "{text}");
        assert!(text.contains("\"type\":2"), "{text}");
    }

    #[test]
    fn unknown_type_rejected() {
        let err = Message::deserialize(br#"{"type":9,"transferId":"t"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown message type"), "{err}");
    }

    #[test]
    fn missing_tag_rejected() {
        assert!(Message::deserialize(br#"{"transferId":"t"}"#).is_err());
        assert!(Message::deserialize(b"not json").is_err());
    }
}
