// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wire codec: fixed binary frame headers followed by a JSON payload.
//
//   request:  u32 sequence | u16 command | u16 length | payload
//   response: u32 sequence | u32 length               | payload
//
// All integers are little-endian. Pure functions, no I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub const REQUEST_HEADER_LEN: usize = 8;
pub const RESPONSE_HEADER_LEN: usize = 8;
/// The request header's `u16` length field caps every request payload.
pub const MAX_REQUEST_PAYLOAD: usize = u16::MAX as usize;

/// Request commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Alive = 0x00,
    Register = 0x01,
    Unregister = 0x02,
    Call = 0x03,
    OneWay = 0x04,
    ChainCall = 0x05,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::Alive,
        Command::Register,
        Command::Unregister,
        Command::Call,
        Command::OneWay,
        Command::ChainCall,
    ];

    /// Whether the daemon answers this command.
    pub fn expects_reply(self) -> bool {
        !matches!(self, Command::OneWay | Command::Unregister)
    }
}

impl TryFrom<u16> for Command {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self> {
        Command::ALL
            .into_iter()
            .find(|c| *c as u16 == raw)
            .ok_or_else(|| Error::protocol(format!("unknown command {raw:#06x}")))
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub sequence: u32,
    pub command: Command,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub sequence: u32,
    pub payload: Vec<u8>,
}

/// Reject payloads that would not fit a region of `capacity` bytes.
pub fn check_capacity(size: usize, capacity: usize) -> Result<()> {
    if size > capacity {
        return Err(Error::FrameTooLarge { size, capacity });
    }
    Ok(())
}

impl RequestFrame {
    pub fn encoded_len(&self) -> usize {
        REQUEST_HEADER_LEN + self.payload.len()
    }

    /// Write header and payload into `buf`, returning the bytes written.
    /// `capacity` bounds the payload; nothing is written if it is exceeded.
    pub fn encode_into(&self, buf: &mut [u8], capacity: usize) -> Result<usize> {
        let size = self.payload.len();
        check_capacity(size, capacity.min(MAX_REQUEST_PAYLOAD))?;
        let total = self.encoded_len();
        if buf.len() < total {
            return Err(Error::FrameTooLarge {
                size,
                capacity: buf.len().saturating_sub(REQUEST_HEADER_LEN),
            });
        }
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..6].copy_from_slice(&(self.command as u16).to_le_bytes());
        buf[6..8].copy_from_slice(&(size as u16).to_le_bytes());
        buf[REQUEST_HEADER_LEN..total].copy_from_slice(&self.payload);
        Ok(total)
    }

    pub fn encode(&self, capacity: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.encoded_len()];
        self.encode_into(&mut buf, capacity)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < REQUEST_HEADER_LEN {
            return Err(Error::protocol("truncated request header"));
        }
        let sequence = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let command = Command::try_from(u16::from_le_bytes([buf[4], buf[5]]))?;
        let len = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        let payload = buf
            .get(REQUEST_HEADER_LEN..REQUEST_HEADER_LEN + len)
            .ok_or_else(|| Error::protocol(format!("request payload truncated (declared {len} bytes)")))?;
        Ok(Self {
            sequence,
            command,
            payload: payload.to_vec(),
        })
    }
}

impl ResponseFrame {
    pub fn encoded_len(&self) -> usize {
        RESPONSE_HEADER_LEN + self.payload.len()
    }

    pub fn encode_into(&self, buf: &mut [u8], capacity: usize) -> Result<usize> {
        let size = self.payload.len();
        check_capacity(size, capacity.min(u32::MAX as usize))?;
        let total = self.encoded_len();
        if buf.len() < total {
            return Err(Error::FrameTooLarge {
                size,
                capacity: buf.len().saturating_sub(RESPONSE_HEADER_LEN),
            });
        }
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..8].copy_from_slice(&(size as u32).to_le_bytes());
        buf[RESPONSE_HEADER_LEN..total].copy_from_slice(&self.payload);
        Ok(total)
    }

    pub fn encode(&self, capacity: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.encoded_len()];
        self.encode_into(&mut buf, capacity)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RESPONSE_HEADER_LEN {
            return Err(Error::protocol("truncated response header"));
        }
        let sequence = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let payload = buf
            .get(RESPONSE_HEADER_LEN..RESPONSE_HEADER_LEN + len)
            .ok_or_else(|| Error::protocol(format!("response payload truncated (declared {len} bytes)")))?;
        Ok(Self {
            sequence,
            payload: payload.to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Payload schemas
// ---------------------------------------------------------------------------

/// `REGISTER{name}` and `UNREGISTER{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamePayload {
    pub name: String,
}

/// `CALL` and `ONE_WAY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub signature: String,
    pub method: String,
    pub args: Vec<Value>,
}

/// One `[signature, method, args]` row of a `CHAIN_CALL` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRow(pub String, pub String, pub Vec<Value>);

/// `CHAIN_CALL{table}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainPayload {
    pub table: Vec<ChainRow>,
}

/// Envelope of every response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply {
    Ok(Value),
    Err(String),
}

impl Reply {
    pub fn into_result(self) -> Result<Value> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Err(msg) => Err(Error::RemoteError(msg)),
        }
    }
}

impl From<std::result::Result<Value, String>> for Reply {
    fn from(r: std::result::Result<Value, String>) -> Self {
        match r {
            Ok(v) => Reply::Ok(v),
            Err(e) => Reply::Err(e),
        }
    }
}

/// Serialize a payload. `ALIVE` carries an empty body.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::protocol(format!("bad payload: {e}")))
}

pub fn decode_reply(bytes: &[u8]) -> Result<Value> {
    decode_payload::<Reply>(bytes)?.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_header_layout() {
        let f = RequestFrame {
            sequence: 0x0102_0304,
            command: Command::Call,
            payload: b"{}".to_vec(),
        };
        let buf = f.encode(1024).unwrap();
        assert_eq!(&buf[..8], &[0x04, 0x03, 0x02, 0x01, 0x03, 0x00, 0x02, 0x00]);
        assert_eq!(&buf[8..], b"{}");
    }

    #[test]
    fn response_header_layout() {
        let f = ResponseFrame {
            sequence: 7,
            payload: b"[]".to_vec(),
        };
        let buf = f.encode(1024).unwrap();
        assert_eq!(&buf[..8], &[7, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn frames_survive_encode_decode() {
        for (seq, cmd, body) in [
            (1u32, Command::Alive, &b""[..]),
            (u32::MAX, Command::ChainCall, &br#"{"table":[]}"#[..]),
            (42, Command::Register, &br#"{"name":"x11-manager"}"#[..]),
        ] {
            let req = RequestFrame {
                sequence: seq,
                command: cmd,
                payload: body.to_vec(),
            };
            assert_eq!(RequestFrame::decode(&req.encode(10 * 1024).unwrap()).unwrap(), req);
            let res = ResponseFrame {
                sequence: seq,
                payload: body.to_vec(),
            };
            assert_eq!(ResponseFrame::decode(&res.encode(1 << 20).unwrap()).unwrap(), res);
        }
    }

    #[test]
    fn oversize_payload_is_rejected_not_truncated() {
        let f = RequestFrame {
            sequence: 1,
            command: Command::Call,
            payload: vec![b'a'; 11],
        };
        let mut buf = [0u8; 64];
        match f.encode_into(&mut buf, 10) {
            Err(Error::FrameTooLarge { size: 11, capacity: 10 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn unknown_command_is_protocol_error() {
        let mut buf = RequestFrame {
            sequence: 1,
            command: Command::Alive,
            payload: vec![],
        }
        .encode(16)
        .unwrap();
        buf[4] = 9;
        assert!(matches!(RequestFrame::decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn truncated_payload_is_protocol_error() {
        let mut buf = ResponseFrame {
            sequence: 1,
            payload: b"abc".to_vec(),
        }
        .encode(16)
        .unwrap();
        buf.truncate(9);
        assert!(matches!(ResponseFrame::decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn only_one_way_and_unregister_skip_replies() {
        let silent: Vec<_> = Command::ALL.into_iter().filter(|c| !c.expects_reply()).collect();
        assert_eq!(silent, vec![Command::Unregister, Command::OneWay]);
    }

    #[test]
    fn payload_shapes() {
        let call = CallPayload {
            signature: "sig".into(),
            method: "get_windows_by_pid".into(),
            args: vec![json!(1234)],
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"signature": "sig", "method": "get_windows_by_pid", "args": [1234]})
        );
        let chain = ChainPayload {
            table: vec![ChainRow("s".into(), "m".into(), vec![json!({"$ref": 0})])],
        };
        assert_eq!(
            serde_json::to_value(&chain).unwrap(),
            json!({"table": [["s", "m", [{"$ref": 0}]]]})
        );
    }

    #[test]
    fn reply_envelope() {
        assert_eq!(decode_reply(br#"{"ok":[]}"#).unwrap(), json!([]));
        match decode_reply(br#"{"err":"no such window"}"#) {
            Err(Error::RemoteError(msg)) => assert_eq!(msg, "no such window"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(decode_reply(b"garbage"), Err(Error::Protocol(_))));
    }
}
