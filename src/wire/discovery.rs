//! Wire format for UDP service-discovery datagrams (§6.1 "Discovery UDP
//! format"), used by the `Beacon`/`Tracker` pair (components K) to
//! advertise and find slave providers on a shared subnet.
//!
//! ```text
//! magic(4)="COBE" | partition_id(uint32 LE) | service_type_len(uint8) | service_type(ASCII)
//!   | service_id_len(uint8) | service_id(ASCII) | payload_len(uint16 LE) | payload(bytes)
//! ```
//!
//! Unlike the in-band protocol envelopes, this format is a flat byte
//! layout rather than a `prost` message: it has to fit in one UDP
//! datagram and be trivially greppable off the wire by anything
//! listening on the broadcast port, protobuf runtime or not.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, ProtocolError};

const MAGIC: [u8; 4] = *b"COBE";

/// One decoded service announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub partition_id: u32,
    pub service_type: String,
    pub service_id: String,
    pub payload: Bytes,
}

pub fn encode(announcement: &Announcement) -> Result<Bytes, CoreError> {
    if announcement.service_type.len() > u8::MAX as usize {
        return Err(ProtocolError::Violation("service_type longer than 255 bytes".into()).into());
    }
    if announcement.service_id.len() > u8::MAX as usize {
        return Err(ProtocolError::Violation("service_id longer than 255 bytes".into()).into());
    }
    if announcement.payload.len() > u16::MAX as usize {
        return Err(ProtocolError::Violation("discovery payload longer than 65535 bytes".into()).into());
    }

    let mut out = BytesMut::with_capacity(
        4 + 4 + 1 + announcement.service_type.len() + 1 + announcement.service_id.len() + 2 + announcement.payload.len(),
    );
    out.put_slice(&MAGIC);
    out.put_u32_le(announcement.partition_id);
    out.put_u8(announcement.service_type.len() as u8);
    out.put_slice(announcement.service_type.as_bytes());
    out.put_u8(announcement.service_id.len() as u8);
    out.put_slice(announcement.service_id.as_bytes());
    out.put_u16_le(announcement.payload.len() as u16);
    out.put_slice(&announcement.payload);
    Ok(out.freeze())
}

pub fn decode(mut bytes: Bytes) -> Result<Announcement, CoreError> {
    if bytes.len() < 9 || bytes[0..4] != MAGIC {
        return Err(ProtocolError::Violation("not a discovery datagram".into()).into());
    }
    bytes.advance(4);
    let partition_id = bytes.get_u32_le();

    let service_type_len = bytes.get_u8() as usize;
    if bytes.len() < service_type_len {
        return Err(ProtocolError::Violation("truncated discovery service_type".into()).into());
    }
    let service_type = String::from_utf8(bytes.split_to(service_type_len).to_vec())
        .map_err(|e| ProtocolError::Violation(format!("invalid discovery service_type: {e}")))?;

    if bytes.is_empty() {
        return Err(ProtocolError::Violation("truncated discovery datagram".into()).into());
    }
    let service_id_len = bytes.get_u8() as usize;
    if bytes.len() < service_id_len {
        return Err(ProtocolError::Violation("truncated discovery service_id".into()).into());
    }
    let service_id = String::from_utf8(bytes.split_to(service_id_len).to_vec())
        .map_err(|e| ProtocolError::Violation(format!("invalid discovery service_id: {e}")))?;

    if bytes.len() < 2 {
        return Err(ProtocolError::Violation("truncated discovery payload length".into()).into());
    }
    let payload_len = bytes.get_u16_le() as usize;
    if bytes.len() < payload_len {
        return Err(ProtocolError::Violation("truncated discovery payload".into()).into());
    }
    let payload = bytes.split_to(payload_len);

    Ok(Announcement {
        partition_id,
        service_type,
        service_id,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_round_trips() {
        let a = Announcement {
            partition_id: 7,
            service_type: "slave_provider".into(),
            service_id: "provider-1".into(),
            payload: Bytes::from_static(b"10274"),
        };
        let encoded = encode(&a).unwrap();
        assert!(encoded.len() <= 1024);
        let decoded = decode(encoded).unwrap();
        assert_eq!(a, decoded);
    }

    #[test]
    fn rejects_datagram_with_wrong_magic() {
        let err = decode(Bytes::from_static(b"XXXX12345678")).unwrap_err();
        assert!(matches!(err, CoreError::Protocol(ProtocolError::Violation(_))));
    }
}
