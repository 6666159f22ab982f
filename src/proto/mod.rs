//! Worker wire protocol: length-prefixed frames with a leading opcode
//! byte, payloads encoded as CBOR where they are structured at all.

pub mod messages;

use std::collections::VecDeque;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BytesMut};

use errors::Result;

pub use self::messages::{ExecutedMsg, OutputMsg, PutMsg};

/// Hard cap on a single frame, both directions. Dependency pushes carry
/// whole blobs, so this sits above the dispatch payload ceiling.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Hey = 0x01,
    Put = 0x02,
    Execute = 0x03,
    Executed = 0x04,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Result<OpCode> {
        match byte {
            0x01 => Ok(OpCode::Hey),
            0x02 => Ok(OpCode::Put),
            0x03 => Ok(OpCode::Execute),
            0x04 => Ok(OpCode::Executed),
            byte => bail!("unknown opcode byte 0x{:02x}", byte),
        }
    }
}

/// One fully-framed protocol message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// Stateful frame parser. `parse` appends raw bytes; completed messages
/// are exposed through `front`/`pop`. Partial frames stay buffered until
/// the rest arrives.
pub struct MessageParser {
    buffer: BytesMut,
    completed: VecDeque<Message>,
}

impl MessageParser {
    pub fn new() -> Self {
        MessageParser {
            buffer: BytesMut::new(),
            completed: VecDeque::new(),
        }
    }

    pub fn parse(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        loop {
            if self.buffer.len() < LENGTH_PREFIX {
                return Ok(());
            }
            let length = LittleEndian::read_u32(&self.buffer[..LENGTH_PREFIX]) as usize;
            if length == 0 {
                bail!("zero-length frame");
            }
            if length > MAX_MESSAGE_SIZE {
                bail!(
                    "frame too long ({} bytes of {} allowed)",
                    length,
                    MAX_MESSAGE_SIZE
                );
            }
            if self.buffer.len() < LENGTH_PREFIX + length {
                return Ok(());
            }
            self.buffer.advance(LENGTH_PREFIX);
            let frame = self.buffer.split_to(length);
            self.completed.push_back(Message {
                opcode: OpCode::from_u8(frame[0])?,
                payload: frame[1..].to_vec(),
            });
        }
    }

    pub fn front(&self) -> Option<&Message> {
        self.completed.front()
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.completed.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

/// Serialize one frame: u32-LE length prefix, opcode byte, payload.
pub fn frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() + 1;
    assert!(length <= MAX_MESSAGE_SIZE, "outgoing frame too long");
    let mut out = Vec::with_capacity(LENGTH_PREFIX + length);
    let mut prefix = [0u8; LENGTH_PREFIX];
    LittleEndian::write_u32(&mut prefix, length as u32);
    out.extend_from_slice(&prefix);
    out.push(opcode as u8);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> (Vec<u8>, Vec<Message>) {
        let messages = vec![
            Message {
                opcode: OpCode::Hey,
                payload: b"hello there".to_vec(),
            },
            Message {
                opcode: OpCode::Put,
                payload: vec![0u8; 300],
            },
            Message {
                opcode: OpCode::Executed,
                payload: b"\xa1\x61a\x01".to_vec(),
            },
        ];
        let mut stream = Vec::new();
        for m in &messages {
            stream.extend_from_slice(&frame(m.opcode, &m.payload));
        }
        (stream, messages)
    }

    fn drain(parser: &mut MessageParser) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(m) = parser.pop() {
            out.push(m);
        }
        out
    }

    #[test]
    fn parses_whole_stream() {
        let (stream, expected) = sample_frames();
        let mut parser = MessageParser::new();
        parser.parse(&stream).unwrap();
        assert_eq!(drain(&mut parser), expected);
        assert!(parser.is_empty());
    }

    // Any split of the byte stream must yield the same message sequence.
    #[test]
    fn parses_under_any_split() {
        let (stream, expected) = sample_frames();
        for split in 0..stream.len() {
            let mut parser = MessageParser::new();
            parser.parse(&stream[..split]).unwrap();
            parser.parse(&stream[split..]).unwrap();
            assert_eq!(drain(&mut parser), expected, "split at {}", split);
        }
    }

    #[test]
    fn parses_byte_at_a_time() {
        let (stream, expected) = sample_frames();
        let mut parser = MessageParser::new();
        for byte in &stream {
            parser.parse(&[*byte]).unwrap();
        }
        assert_eq!(drain(&mut parser), expected);
    }

    #[test]
    fn front_peeks_without_consuming() {
        let (stream, expected) = sample_frames();
        let mut parser = MessageParser::new();
        parser.parse(&stream).unwrap();
        assert_eq!(parser.front(), Some(&expected[0]));
        assert_eq!(parser.pop(), Some(expected[0].clone()));
        assert_eq!(parser.front(), Some(&expected[1]));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut parser = MessageParser::new();
        let mut bad = frame(OpCode::Hey, b"x");
        bad[4] = 0x7f;
        assert!(parser.parse(&bad).is_err());
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut parser = MessageParser::new();
        let mut prefix = [0u8; 4];
        LittleEndian::write_u32(&mut prefix, (MAX_MESSAGE_SIZE + 1) as u32);
        assert!(parser.parse(&prefix).is_err());
    }

    #[test]
    fn rejects_zero_length_frame() {
        let mut parser = MessageParser::new();
        assert!(parser.parse(&[0, 0, 0, 0]).is_err());
    }
}
