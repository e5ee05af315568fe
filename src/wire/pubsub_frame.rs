//! Wire format for the variable pub/sub fabric (component C, §4.3 and
//! §6.1 "Pub/sub wire format"):
//!
//! ```text
//! topic prefix: 2-byte big-endian slaveID || 4-byte big-endian variableID
//! payload frame: length-delimited { stepID: int32, value: ScalarValue }
//! ```
//!
//! Big-endian is used here (unlike the little-endian in-band protocol
//! integers of §4.4) specifically so that lexicographic prefix matching
//! on the topic bytes coincides with numeric `(slaveID, variableID)`
//! ordering.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CoreError, ProtocolError};
use crate::model::{ScalarValue, SlaveID, StepID, Variable, VariableID};
use crate::wire::messages::ScalarValueProto;

pub const TOPIC_LEN: usize = 6;

/// Encodes the 6-byte topic prefix for `v`. Ordering is strictly
/// numeric in `(slave, id)`, matching big-endian byte order.
pub fn encode_topic(v: Variable) -> [u8; TOPIC_LEN] {
    let mut out = [0u8; TOPIC_LEN];
    out[0..2].copy_from_slice(&v.slave.0.to_be_bytes());
    out[2..6].copy_from_slice(&v.id.0.to_be_bytes());
    out
}

pub fn decode_topic(bytes: &[u8]) -> Result<Variable, CoreError> {
    if bytes.len() < TOPIC_LEN {
        return Err(ProtocolError::Violation("topic prefix too short".into()).into());
    }
    let slave = u16::from_be_bytes([bytes[0], bytes[1]]);
    let id = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    Ok(Variable::new(SlaveID(slave), VariableID(id)))
}

#[derive(Clone, PartialEq, prost::Message)]
struct ValueFrameProto {
    #[prost(int32, tag = "1")]
    step_id: i32,
    #[prost(message, optional, tag = "2")]
    value: Option<ScalarValueProto>,
}

/// A full pub/sub wire message: the topic prefix followed by the
/// length-delimited `{stepID, value}` payload frame.
pub fn encode_message(variable: Variable, step: StepID, value: &ScalarValue) -> Bytes {
    let proto = ValueFrameProto {
        step_id: step.0,
        value: Some(ScalarValueProto::from(value)),
    };
    let mut payload = BytesMut::new();
    proto.encode(&mut payload).expect("encoding into BytesMut cannot fail");

    let mut out = BytesMut::with_capacity(TOPIC_LEN + 4 + payload.len());
    out.put_slice(&encode_topic(variable));
    out.put_u32(payload.len() as u32);
    out.put_slice(&payload);
    out.freeze()
}

/// Decodes a full pub/sub wire message produced by `encode_message`.
pub fn decode_message(mut bytes: Bytes) -> Result<(Variable, StepID, ScalarValue), CoreError> {
    if bytes.len() < TOPIC_LEN + 4 {
        return Err(ProtocolError::Violation("pub/sub message too short".into()).into());
    }
    let variable = decode_topic(&bytes[0..TOPIC_LEN])?;
    bytes.advance(TOPIC_LEN);
    let payload_len = bytes.get_u32() as usize;
    if bytes.len() < payload_len {
        return Err(ProtocolError::Violation("truncated pub/sub payload".into()).into());
    }
    let proto = ValueFrameProto::decode(&bytes[0..payload_len])
        .map_err(|e| ProtocolError::Violation(format!("malformed pub/sub payload: {e}")))?;
    let value = ScalarValue::try_from(
        proto
            .value
            .ok_or_else(|| ProtocolError::Violation("pub/sub message missing value".into()))?,
    )?;
    Ok((variable, StepID(proto.step_id), value))
}

/// A `Decoder`/`Encoder` over a raw byte stream of concatenated pub/sub
/// messages (no further outer framing -- each message is already
/// self-delimiting via its own length field).
#[derive(Default)]
pub struct PubSubFrameCodec;

impl Decoder for PubSubFrameCodec {
    type Item = (Variable, StepID, ScalarValue);
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, CoreError> {
        if src.len() < TOPIC_LEN + 4 {
            return Ok(None);
        }
        let payload_len = u32::from_be_bytes([
            src[TOPIC_LEN],
            src[TOPIC_LEN + 1],
            src[TOPIC_LEN + 2],
            src[TOPIC_LEN + 3],
        ]) as usize;
        let total = TOPIC_LEN + 4 + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total).freeze();
        decode_message(frame).map(Some)
    }
}

impl Encoder<(Variable, StepID, ScalarValue)> for PubSubFrameCodec {
    type Error = CoreError;

    fn encode(
        &mut self,
        item: (Variable, StepID, ScalarValue),
        dst: &mut BytesMut,
    ) -> Result<(), CoreError> {
        let (variable, step, value) = item;
        dst.put(encode_message(variable, step, &value));
        Ok(())
    }
}
