//! Wire framing (component D, `SPEC_FULL.md` §4.4): the HELLO/DENIED
//! handshake envelope, and the Normal/Error envelope used for all
//! traffic after a connection's protocol version has been negotiated.
//!
//! Every message is carried inside one length-delimited outer frame (a
//! 4-byte little-endian length prefix, via `tokio_util`'s
//! `LengthDelimitedCodec`) -- the TCP-native equivalent of the
//! multi-frame messages a message-oriented transport would hand us for
//! free. Integer byte order inside a frame is little-endian, except the
//! pub/sub topic prefix (`pubsub_frame`), which is big-endian so that
//! lexicographic prefix matching equals numeric ordering.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::{CoreError, ProtocolError, SystemError};

/// 64 MiB; generous enough for any structured body this protocol
/// carries, small enough to reject obviously-corrupt length prefixes.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HELLO_MAGIC: [u8; 6] = [0x01, 0x00, b'D', b'S', b'C', b'P'];

fn length_delimited() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// The one-time HELLO/DENIED exchange that opens every control
/// connection (§4.2).
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeFrame {
    Hello { version: u16, body: Option<Bytes> },
    Denied { reason: String },
}

pub struct HandshakeCodec {
    inner: LengthDelimitedCodec,
}

impl Default for HandshakeCodec {
    fn default() -> Self {
        Self {
            inner: length_delimited(),
        }
    }
}

impl Decoder for HandshakeCodec {
    type Item = HandshakeFrame;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HandshakeFrame>, CoreError> {
        let Some(mut frame) = self
            .inner
            .decode(src)
            .map_err(|e| CoreError::from(SystemError::Io(e)))?
        else {
            return Ok(None);
        };
        if frame.len() >= 6 && frame[0..6] == HELLO_MAGIC {
            if frame.len() < 8 {
                return Err(ProtocolError::Violation("truncated HELLO frame".into()).into());
            }
            frame.advance(6);
            let version = frame.get_u16_le();
            let body = if frame.is_empty() {
                None
            } else {
                Some(frame.freeze())
            };
            Ok(Some(HandshakeFrame::Hello { version, body }))
        } else if frame.len() >= 2 && frame[0] == 0 && frame[1] == 0 {
            frame.advance(2);
            let reason = String::from_utf8(frame.to_vec())
                .map_err(|e| ProtocolError::Violation(format!("invalid DENIED reason: {e}")))?;
            Ok(Some(HandshakeFrame::Denied { reason }))
        } else {
            Err(ProtocolError::Violation("unrecognised handshake frame".into()).into())
        }
    }
}

impl Encoder<HandshakeFrame> for HandshakeCodec {
    type Error = CoreError;

    fn encode(&mut self, item: HandshakeFrame, dst: &mut BytesMut) -> Result<(), CoreError> {
        let mut payload = BytesMut::new();
        match item {
            HandshakeFrame::Hello { version, body } => {
                payload.put_slice(&HELLO_MAGIC);
                payload.put_u16_le(version);
                if let Some(b) = body {
                    payload.put_slice(&b);
                }
            }
            HandshakeFrame::Denied { reason } => {
                payload.put_u16(0);
                payload.put_slice(reason.as_bytes());
            }
        }
        self.inner
            .encode(payload.freeze(), dst)
            .map_err(|e| SystemError::Io(e).into())
    }
}

/// A message on an already-negotiated connection: a 2-byte
/// little-endian message-type code plus an optional structured body.
/// `ERROR` is represented the same way, with `msg_type ==
/// msg_type::ERROR` and a body decodable as `ErrorBody`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalFrame {
    pub msg_type: u16,
    pub body: Option<Bytes>,
}

impl NormalFrame {
    pub fn empty(msg_type: u16) -> Self {
        Self {
            msg_type,
            body: None,
        }
    }

    pub fn with_body(msg_type: u16, body: impl prost::Message) -> Self {
        let mut buf = BytesMut::new();
        // `prost::Message::encode` only fails on insufficient capacity,
        // which `BytesMut`'s growable buffer never hits.
        body.encode(&mut buf).expect("encoding into a BytesMut cannot fail");
        Self {
            msg_type,
            body: Some(buf.freeze()),
        }
    }

    pub fn decode_body<T: prost::Message + Default>(&self) -> Result<T, CoreError> {
        let body = self
            .body
            .as_deref()
            .ok_or_else(|| ProtocolError::Violation("expected a message body".into()))?;
        T::decode(body).map_err(|e| ProtocolError::Violation(format!("malformed body: {e}")).into())
    }
}

pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self {
            inner: length_delimited(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = NormalFrame;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<NormalFrame>, CoreError> {
        let Some(mut frame) = self
            .inner
            .decode(src)
            .map_err(|e| CoreError::from(SystemError::Io(e)))?
        else {
            return Ok(None);
        };
        if frame.len() < 2 {
            return Err(ProtocolError::Violation("frame shorter than message-type header".into()).into());
        }
        let msg_type = frame.get_u16_le();
        let body = if frame.is_empty() {
            None
        } else {
            Some(frame.freeze())
        };
        Ok(Some(NormalFrame { msg_type, body }))
    }
}

impl Encoder<NormalFrame> for MessageCodec {
    type Error = CoreError;

    fn encode(&mut self, item: NormalFrame, dst: &mut BytesMut) -> Result<(), CoreError> {
        let mut payload = BytesMut::with_capacity(2 + item.body.as_ref().map_or(0, |b| b.len()));
        payload.put_u16_le(item.msg_type);
        if let Some(b) = item.body {
            payload.put_slice(&b);
        }
        self.inner
            .encode(payload.freeze(), dst)
            .map_err(|e| SystemError::Io(e).into())
    }
}

/// Message-type codes for the execution protocol (master <-> slave
/// agent). Numeric values must be preserved byte-for-byte (§6.1, §9).
pub mod msg_type {
    pub const HELLO_OK: u16 = 0;
    pub const DENIED: u16 = 1;
    pub const ERROR: u16 = 2;
    pub const TERMINATE: u16 = 3;
    pub const DESCRIBE: u16 = 4;
    pub const DESCRIPTION: u16 = 5;
    pub const SETUP: u16 = 6;
    pub const SET_VARS: u16 = 7;
    pub const SET_PEERS: u16 = 8;
    pub const RESEND_VARS: u16 = 9;
    pub const STEP: u16 = 10;
    pub const STEP_OK: u16 = 11;
    pub const STEP_FAILED: u16 = 12;
    pub const ACCEPT_STEP: u16 = 13;
    pub const READY: u16 = 14;
    pub const SET_VARS_RESULT: u16 = 15;
}

/// Message-type codes for the slave-provider protocol. Unlike
/// `msg_type`, the spec does not pin exact numeric values for this
/// registry, only the three named operations.
pub mod provider_msg_type {
    pub const OK: u16 = 0;
    pub const DENIED: u16 = 1;
    pub const ERROR: u16 = 2;
    pub const GET_SLAVE_TYPE_COUNT: u16 = 10;
    pub const SLAVE_TYPE_COUNT: u16 = 11;
    pub const GET_SLAVE_TYPE: u16 = 12;
    pub const SLAVE_TYPE: u16 = 13;
    pub const INSTANTIATE_SLAVE: u16 = 14;
    pub const SLAVE_LOCATOR: u16 = 15;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips() {
        let mut codec = HandshakeCodec::default();
        let mut buf = BytesMut::new();
        let frame = HandshakeFrame::Hello {
            version: 3,
            body: None,
        };
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn denied_round_trips() {
        let mut codec = HandshakeCodec::default();
        let mut buf = BytesMut::new();
        let frame = HandshakeFrame::Denied {
            reason: "nope".into(),
        };
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn normal_frame_round_trips_with_body() {
        use crate::wire::messages::StepBody;

        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        let body = StepBody {
            step_id: 4,
            current_time: 1.0,
            step_size: 0.5,
        };
        let frame = NormalFrame::with_body(msg_type::STEP, body.clone());
        codec.encode(frame, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_type, msg_type::STEP);
        let decoded_body: StepBody = decoded.decode_body().unwrap();
        assert_eq!(decoded_body, body);
    }

    #[test]
    fn partial_frame_returns_none_until_complete() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(NormalFrame::empty(msg_type::READY), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
