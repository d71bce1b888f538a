//! Protocol codec for encoding/decoding messages
//!
//! Handles serialization of single messages and line framing of TCP streams.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::Command;

/// Maximum length of one framed line on a stream (64 KiB)
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Message terminator
const LINE_TERMINATOR: u8 = b'\n';

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Line too long: {0} bytes (max: {1})")]
    LineTooLong(usize, usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A decoded wire message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    /// Raw JSON payload, possibly followed by the terminator
    pub payload: Bytes,
}

impl Message {
    /// Deserialize the payload. Trailing whitespace, including the
    /// terminator kept by datagram framing, is accepted.
    pub fn parse<T: DeserializeOwned>(&self) -> CodecResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Encode a command and its payload into wire bytes
pub fn encode<T: Serialize + ?Sized>(command: Command, payload: &T) -> CodecResult<Bytes> {
    let json = serde_json::to_vec(payload)?;

    let mut buf = BytesMut::with_capacity(json.len() + 2);
    buf.put_u8(command.type_id());
    buf.put_slice(&json);
    buf.put_u8(LINE_TERMINATOR);

    Ok(buf.freeze())
}

/// Decode one message. The first byte is the command tag and everything
/// after it is payload. Empty input yields a zero-tag message.
pub fn decode(frame: &[u8]) -> Message {
    match frame.split_first() {
        Some((tag, payload)) => Message {
            command: Command::from(*tag),
            payload: Bytes::copy_from_slice(payload),
        },
        None => Message::default(),
    }
}

/// Splits a byte stream into `\n` terminated lines
pub struct LineFramer {
    /// Bytes of the buffer already searched for a terminator
    scanned: usize,
    max_line_length: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_line_length: usize) -> Self {
        Self {
            scanned: 0,
            max_line_length,
        }
    }

    /// Attempt to take the next line from the buffer, without its
    /// terminator (a trailing `\r` is dropped as well).
    /// Returns Ok(None) if more data is needed
    pub fn next_line(&mut self, buf: &mut BytesMut) -> CodecResult<Option<BytesMut>> {
        let start = self.scanned.min(buf.len());

        match buf[start..].iter().position(|b| *b == LINE_TERMINATOR) {
            Some(offset) => {
                let end = start + offset;
                self.scanned = 0;

                if end > self.max_line_length {
                    return Err(CodecError::LineTooLong(end, self.max_line_length));
                }

                let mut line = buf.split_to(end + 1);
                line.truncate(end);
                strip_carriage_return(&mut line);
                Ok(Some(line))
            }
            None => {
                if buf.len() > self.max_line_length {
                    return Err(CodecError::LineTooLong(buf.len(), self.max_line_length));
                }
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }

    /// Take whatever is left once the stream has ended. An unterminated
    /// final line still counts as a line.
    pub fn finish(&mut self, buf: &mut BytesMut) -> Option<BytesMut> {
        self.scanned = 0;
        if buf.is_empty() {
            return None;
        }

        let mut line = buf.split();
        strip_carriage_return(&mut line);
        Some(line)
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_carriage_return(line: &mut BytesMut) {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HeartbeatRequest, LoginRequest, StatusChangeNotification};

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_encode_wire_bytes() {
        let login = LoginRequest {
            user_id: 1,
            friends: vec![2],
        };
        let encoded = encode(Command::Login, &login).unwrap();
        assert_eq!(
            hex(&encoded),
            "017b22757365725f6964223a312c22667269656e6473223a5b325d7d0a"
        );

        let encoded = encode(Command::Heartbeat, &HeartbeatRequest { user_id: 1 }).unwrap();
        assert_eq!(hex(&encoded), "027b22757365725f6964223a317d0a");

        let status = StatusChangeNotification {
            user_id: 1,
            online: true,
        };
        let encoded = encode(Command::StatusChange, &status).unwrap();
        assert_eq!(
            hex(&encoded),
            "037b22757365725f6964223a312c226f6e6c696e65223a747275657d0a"
        );
    }

    #[test]
    fn test_decode_keeps_terminator_in_payload() {
        let encoded = encode(Command::Heartbeat, &HeartbeatRequest { user_id: 1 }).unwrap();
        let message = decode(&encoded);

        assert_eq!(message.command, Command::Heartbeat);
        assert_eq!(&message.payload[..], b"{\"user_id\":1}\n");

        let req: HeartbeatRequest = message.parse().unwrap();
        assert_eq!(req.user_id, 1);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let login = LoginRequest {
            user_id: 42,
            friends: vec![2, 3, 4],
        };
        let message = decode(&encode(Command::Login, &login).unwrap());
        assert_eq!(message.command, Command::Login);
        assert_eq!(message.parse::<LoginRequest>().unwrap(), login);

        let status = StatusChangeNotification {
            user_id: 9,
            online: false,
        };
        let message = decode(&encode(Command::StatusChange, &status).unwrap());
        assert_eq!(message.command, Command::StatusChange);
        assert_eq!(message.parse::<StatusChangeNotification>().unwrap(), status);
    }

    #[test]
    fn test_decode_empty() {
        let message = decode(&[]);
        assert_eq!(message.command, Command::Unknown(0));
        assert!(message.payload.is_empty());
    }

    #[test]
    fn test_decode_unknown_tag() {
        let message = decode(b"\x2a{}\n");
        assert_eq!(message.command, Command::Unknown(0x2a));
        assert_eq!(&message.payload[..], b"{}\n");
    }

    #[test]
    fn test_parse_malformed_payload() {
        let message = decode(b"\x01not json\n");
        assert!(matches!(
            message.parse::<LoginRequest>(),
            Err(CodecError::Serialization(_))
        ));
    }

    #[test]
    fn test_json_never_contains_newline() {
        #[derive(serde::Serialize)]
        struct Text<'a> {
            text: &'a str,
        }

        let encoded = encode(Command::Unknown(9), &Text { text: "a\nb" }).unwrap();
        let newlines = encoded.iter().filter(|b| **b == b'\n').count();
        assert_eq!(newlines, 1);
        assert_eq!(encoded.last(), Some(&b'\n'));
    }

    #[test]
    fn test_framer_multiple_messages() {
        let mut framer = LineFramer::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&encode(Command::Heartbeat, &HeartbeatRequest { user_id: 1 }).unwrap());
        buf.extend_from_slice(&encode(Command::Heartbeat, &HeartbeatRequest { user_id: 2 }).unwrap());

        for expected in [1, 2] {
            let line = framer.next_line(&mut buf).unwrap().unwrap();
            let message = decode(&line);
            assert_eq!(message.command, Command::Heartbeat);
            assert_eq!(message.parse::<HeartbeatRequest>().unwrap().user_id, expected);
        }
        assert!(framer.next_line(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_framer_partial_line() {
        let mut framer = LineFramer::new();
        let mut buf = BytesMut::from(&b"\x02{\"user_"[..]);

        assert!(framer.next_line(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"id\":5}\r\n\x02");
        let line = framer.next_line(&mut buf).unwrap().unwrap();
        assert_eq!(&line[..], b"\x02{\"user_id\":5}");
        assert_eq!(&buf[..], b"\x02");
    }

    #[test]
    fn test_framer_finish_returns_unterminated_line() {
        let mut framer = LineFramer::new();
        let mut buf = BytesMut::from(&b"\x02{\"user_id\":5}"[..]);

        assert!(framer.next_line(&mut buf).unwrap().is_none());
        let line = framer.finish(&mut buf).unwrap();
        assert_eq!(decode(&line).command, Command::Heartbeat);
        assert!(framer.finish(&mut buf).is_none());
    }

    #[test]
    fn test_framer_line_too_long() {
        let mut framer = LineFramer::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);

        assert!(matches!(
            framer.next_line(&mut buf),
            Err(CodecError::LineTooLong(10, 8))
        ));
    }
}
