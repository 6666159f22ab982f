//! Structured frame payloads and their builders.

use serde_bytes;
use serde_cbor;

use common::id::BlobHash;
use errors::Result;
use thunk::Thunk;

use super::{frame, OpCode};

/// Blob transfer, either direction. The coordinator pushes dependencies
/// with it; workers upload outputs with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct PutMsg {
    pub hash: BlobHash,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// One produced output inside an `Executed` response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct OutputMsg {
    /// Output tag as named by the thunk.
    pub tag: String,
    /// Content hash of the produced blob.
    pub hash: BlobHash,
    /// Small outputs travel inline, base64-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub data: Option<String>,
}

/// Worker's report that a thunk finished. `outputs` is never empty; the
/// first entry is the primary output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct ExecutedMsg {
    pub thunk_hash: BlobHash,
    pub outputs: Vec<OutputMsg>,
}

pub fn hey_frame(greeting: &str) -> Vec<u8> {
    frame(OpCode::Hey, greeting.as_bytes())
}

pub fn put_frame(hash: &str, data: &[u8]) -> Result<Vec<u8>> {
    let msg = PutMsg {
        hash: hash.to_string(),
        data: data.to_vec(),
    };
    Ok(frame(OpCode::Put, &serde_cbor::to_vec(&msg)?))
}

pub fn execute_frame(thunk: &Thunk) -> Result<Vec<u8>> {
    Ok(frame(OpCode::Execute, &serde_cbor::to_vec(thunk)?))
}

pub fn executed_frame(msg: &ExecutedMsg) -> Result<Vec<u8>> {
    Ok(frame(OpCode::Executed, &serde_cbor::to_vec(msg)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::MessageParser;

    #[test]
    fn put_frame_carries_hash_and_bytes() {
        let mut parser = MessageParser::new();
        parser
            .parse(&put_frame("abc123", b"payload bytes").unwrap())
            .unwrap();
        let message = parser.pop().unwrap();
        assert_eq!(message.opcode, OpCode::Put);
        let decoded: PutMsg = serde_cbor::from_slice(&message.payload).unwrap();
        assert_eq!(decoded.hash, "abc123");
        assert_eq!(decoded.data, b"payload bytes");
    }

    #[test]
    fn executed_round_trip_keeps_output_order() {
        let msg = ExecutedMsg {
            thunk_hash: "t0".to_string(),
            outputs: vec![
                OutputMsg {
                    tag: "out".to_string(),
                    hash: "h0".to_string(),
                    data: None,
                },
                OutputMsg {
                    tag: "aux".to_string(),
                    hash: "h1".to_string(),
                    data: Some("aGVsbG8=".to_string()),
                },
            ],
        };
        let mut parser = MessageParser::new();
        parser.parse(&executed_frame(&msg).unwrap()).unwrap();
        let decoded: ExecutedMsg =
            serde_cbor::from_slice(&parser.pop().unwrap().payload).unwrap();
        assert_eq!(decoded, msg);
    }
}
