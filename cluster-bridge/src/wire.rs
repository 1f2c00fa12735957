//! Length-prefixed, self-describing wire records for cluster replication.
//!
//! Layout after the `u32` big-endian length prefix:
//!
//! ```text
//! | type: u8 | hlc: 12 bytes | node_len: u16 | source_node: utf8 | payload: cbor |
//! ```

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use vsm_types::{CoreError, CoreResult, Event, Hlc, NodeId};

/// Upper bound on a single frame; anything larger is rejected on both
/// sides.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Event = 1,
    Heartbeat = 2,
}

impl RecordKind {
    fn from_u8(byte: u8) -> CoreResult<Self> {
        match byte {
            1 => Ok(Self::Event),
            2 => Ok(Self::Heartbeat),
            other => Err(CoreError::InvalidInput(format!(
                "unknown wire record type: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WireRecord {
    pub kind: RecordKind,
    pub hlc: Hlc,
    pub source_node: NodeId,
    pub payload: Vec<u8>,
}

impl WireRecord {
    pub fn event(event: &Event, source_node: NodeId) -> CoreResult<Self> {
        let payload = cbor4ii::serde::to_vec(Vec::new(), event)
            .map_err(|err| CoreError::Internal(format!("cbor encode: {err}")))?;
        Ok(Self {
            kind: RecordKind::Event,
            hlc: event.hlc.clone(),
            source_node,
            payload,
        })
    }

    pub fn heartbeat(hlc: Hlc, source_node: NodeId) -> Self {
        Self {
            kind: RecordKind::Heartbeat,
            hlc,
            source_node,
            payload: vec![],
        }
    }

    pub fn decode_event(&self) -> CoreResult<Event> {
        if self.kind != RecordKind::Event {
            return Err(CoreError::InvalidInput(
                "record does not carry an event".into(),
            ));
        }
        cbor4ii::serde::from_slice(&self.payload)
            .map_err(|err| CoreError::InvalidInput(format!("cbor decode: {err}")))
    }

    /// Serialize with the length prefix.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let node = self.source_node.as_str().as_bytes();
        if node.len() > u16::MAX as usize {
            return Err(CoreError::InvalidInput("node id too long".into()));
        }
        let body_len = 1 + Hlc::WIRE_LEN + 2 + node.len() + self.payload.len();
        if body_len > MAX_FRAME_LEN {
            return Err(CoreError::InvalidInput(format!(
                "frame of {body_len} bytes exceeds cap"
            )));
        }
        let mut buf = Vec::with_capacity(4 + body_len);
        buf.write_u32::<BigEndian>(body_len as u32)
            .map_err(CoreError::internal)?;
        buf.write_u8(self.kind as u8).map_err(CoreError::internal)?;
        buf.write_all(&self.hlc.to_wire()).map_err(CoreError::internal)?;
        buf.write_u16::<BigEndian>(node.len() as u16)
            .map_err(CoreError::internal)?;
        buf.write_all(node).map_err(CoreError::internal)?;
        buf.write_all(&self.payload).map_err(CoreError::internal)?;
        Ok(buf)
    }

    /// Parse one frame. Returns the record and the bytes consumed, so a
    /// stream of frames can be walked.
    pub fn decode(bytes: &[u8]) -> CoreResult<(Self, usize)> {
        let mut cursor = Cursor::new(bytes);
        let body_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| CoreError::InvalidInput("truncated frame header".into()))?
            as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(CoreError::InvalidInput(format!(
                "frame of {body_len} bytes exceeds cap"
            )));
        }
        if bytes.len() < 4 + body_len {
            return Err(CoreError::InvalidInput("truncated frame body".into()));
        }

        let kind = RecordKind::from_u8(
            cursor
                .read_u8()
                .map_err(|_| CoreError::InvalidInput("truncated record type".into()))?,
        )?;
        let mut hlc_bytes = [0u8; Hlc::WIRE_LEN];
        cursor
            .read_exact(&mut hlc_bytes)
            .map_err(|_| CoreError::InvalidInput("truncated hlc".into()))?;
        let node_len = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| CoreError::InvalidInput("truncated node length".into()))?
            as usize;
        let mut node_bytes = vec![0u8; node_len];
        cursor
            .read_exact(&mut node_bytes)
            .map_err(|_| CoreError::InvalidInput("truncated node id".into()))?;
        let source_node = NodeId::new(
            String::from_utf8(node_bytes)
                .map_err(|_| CoreError::InvalidInput("node id is not utf8".into()))?,
        );
        let hlc = Hlc::from_wire(hlc_bytes, source_node.clone());

        let consumed_header = cursor.position() as usize;
        let payload = bytes[consumed_header..4 + body_len].to_vec();
        Ok((
            Self {
                kind,
                hlc,
                source_node,
                payload,
            },
            4 + body_len,
        ))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use vsm_types::{EventMetadata, Severity, Topic};

    use super::*;

    fn sample_event() -> Event {
        Event::new(
            Topic::S1Operations,
            json!({"unit": "unit-1", "magnitude": 0.4}),
            Hlc::new(1_700_000_000_000, 3, "node-a"),
        )
        .with_metadata(EventMetadata::algedonic("monitor", Severity::High))
    }

    #[test]
    fn test_event_record_round_trip() {
        let event = sample_event();
        let record = WireRecord::event(&event, NodeId::from("node-a")).unwrap();
        let encoded = record.encode().unwrap();
        let (decoded, consumed) = WireRecord::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, record);
        assert_eq!(decoded.decode_event().unwrap(), event);
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let record = WireRecord::heartbeat(Hlc::new(5, 0, "node-b"), NodeId::from("node-b"));
        let encoded = record.encode().unwrap();
        let (decoded, _) = WireRecord::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, RecordKind::Heartbeat);
        assert!(decoded.payload.is_empty());
        assert!(decoded.decode_event().is_err());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let a = WireRecord::heartbeat(Hlc::new(1, 0, "n"), NodeId::from("n"))
            .encode()
            .unwrap();
        let b = WireRecord::event(&sample_event(), NodeId::from("node-a"))
            .unwrap()
            .encode()
            .unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let (first, consumed) = WireRecord::decode(&stream).unwrap();
        assert_eq!(first.kind, RecordKind::Heartbeat);
        let (second, _) = WireRecord::decode(&stream[consumed..]).unwrap();
        assert_eq!(second.kind, RecordKind::Event);
    }

    #[test]
    fn test_truncated_and_garbage_frames_are_rejected() {
        let encoded = WireRecord::event(&sample_event(), NodeId::from("node-a"))
            .unwrap()
            .encode()
            .unwrap();
        assert!(WireRecord::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(WireRecord::decode(&[0, 0]).is_err());

        let mut wrong_kind = encoded;
        wrong_kind[4] = 99;
        assert!(WireRecord::decode(&wrong_kind).is_err());
    }
}
