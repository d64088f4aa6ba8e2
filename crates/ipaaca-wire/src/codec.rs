//! Binary record codec
//!
//! Layout after the two-byte prefix (kind, flags):
//! - Snapshot: uid, revision, category, payload type, owner, access mode,
//!   payload map, link map
//! - Payload update: uid, revision, writer, payload type, new items,
//!   keys to remove
//! - Link update: uid, revision, writer, new links, links to remove
//! - Terminal: uid, revision, writer
//! - Resend request: uid, hidden scope name
//!
//! Strings are `u16` length-prefixed UTF-8, counts and revisions are `u32`,
//! values are `u32` length-prefixed text in the payload type's encoding.

use std::collections::BTreeSet;

use bytes::{BufMut, Bytes, BytesMut};
use ipaaca_core::{
    AccessMode, DocumentMap, DocumentValue, IpaacaError, IpaacaResult, LinkMap, PayloadType,
};

use crate::{
    LinkUpdate, PayloadUpdate, RecordFlags, RecordKind, ResendRequest, TerminalKind,
    TerminalRecord, UnitSnapshot, WireRecord,
};

/// Size of the kind + flags prefix
pub const RECORD_PREFIX_SIZE: usize = 2;

/// Size of an RPC response body
pub const RESPONSE_SIZE: usize = 4;

/// Encode a record into a frame
pub fn encode(record: &WireRecord) -> IpaacaResult<Bytes> {
    let mut out = BytesMut::with_capacity(64);
    out.put_u8(record.kind().to_byte());
    match record {
        WireRecord::Unit(snapshot) | WireRecord::Message(snapshot) => {
            let flags = RecordFlags::NONE
                .with(RecordFlags::COMMITTED, snapshot.committed)
                .with(RecordFlags::RETRACTED, snapshot.retracted)
                .with(RecordFlags::READ_ONLY, snapshot.read_only);
            out.put_u8(flags.0);
            put_str(&mut out, &snapshot.uid)?;
            out.put_u32_le(snapshot.revision);
            put_str(&mut out, &snapshot.category)?;
            out.put_u8(snapshot.payload_type.to_byte());
            put_str(&mut out, &snapshot.owner_name)?;
            out.put_u8(snapshot.access_mode.to_byte());
            put_items(&mut out, &snapshot.payload, snapshot.payload_type)?;
            put_links(&mut out, &snapshot.links)?;
        }
        WireRecord::Payload(update) => {
            out.put_u8(RecordFlags::NONE.with(RecordFlags::DELTA, update.is_delta).0);
            put_str(&mut out, &update.uid)?;
            out.put_u32_le(update.revision);
            put_str(&mut out, &update.writer_name)?;
            out.put_u8(update.payload_type.to_byte());
            put_items(&mut out, &update.new_items, update.payload_type)?;
            put_count(&mut out, update.keys_to_remove.len())?;
            for key in &update.keys_to_remove {
                put_str(&mut out, key)?;
            }
        }
        WireRecord::Links(update) => {
            out.put_u8(RecordFlags::NONE.with(RecordFlags::DELTA, update.is_delta).0);
            put_str(&mut out, &update.uid)?;
            out.put_u32_le(update.revision);
            put_str(&mut out, &update.writer_name)?;
            put_links(&mut out, &update.new_links)?;
            put_links(&mut out, &update.links_to_remove)?;
        }
        WireRecord::Terminal(terminal) => {
            out.put_u8(RecordFlags::NONE.0);
            put_str(&mut out, &terminal.uid)?;
            out.put_u32_le(terminal.revision);
            put_str(&mut out, &terminal.writer_name)?;
        }
        WireRecord::Resend(request) => {
            out.put_u8(RecordFlags::NONE.0);
            put_str(&mut out, &request.uid)?;
            put_str(&mut out, &request.hidden_scope_name)?;
        }
    }
    Ok(out.freeze())
}

/// Decode a frame into a record
pub fn decode(buf: &[u8]) -> IpaacaResult<WireRecord> {
    let mut r = Reader::new(buf);
    let kind_byte = r.u8()?;
    let kind = RecordKind::from_byte(kind_byte).ok_or(IpaacaError::UnknownRecordKind(kind_byte))?;
    let flags = RecordFlags::new(r.u8()?);
    if flags.has_undefined_bits() {
        return Err(IpaacaError::InvalidWireFormat(format!(
            "undefined flag bits {:#04x}",
            flags.0
        )));
    }

    let record = match kind {
        RecordKind::UnitSnapshot | RecordKind::MessageSnapshot => {
            let uid = r.string()?;
            let revision = r.u32()?;
            let category = r.string()?;
            let payload_type = r.payload_type()?;
            let owner_name = r.string()?;
            let mode = r.u8()?;
            let access_mode = AccessMode::from_byte(mode).ok_or_else(|| {
                IpaacaError::InvalidWireFormat(format!("unknown access mode {}", mode))
            })?;
            let payload = r.items(payload_type)?;
            let links = r.links()?;
            let snapshot = UnitSnapshot {
                uid,
                revision,
                category,
                payload_type,
                owner_name,
                committed: flags.is_committed(),
                retracted: flags.is_retracted(),
                read_only: flags.is_read_only(),
                access_mode,
                payload,
                links,
            };
            if kind == RecordKind::UnitSnapshot {
                WireRecord::Unit(snapshot)
            } else {
                WireRecord::Message(snapshot)
            }
        }
        RecordKind::PayloadUpdate => {
            let uid = r.string()?;
            let revision = r.u32()?;
            let writer_name = r.string()?;
            let payload_type = r.payload_type()?;
            let new_items = r.items(payload_type)?;
            let count = r.count()?;
            let mut keys_to_remove = BTreeSet::new();
            for _ in 0..count {
                keys_to_remove.insert(r.string()?);
            }
            WireRecord::Payload(PayloadUpdate {
                uid,
                revision,
                writer_name,
                is_delta: flags.is_delta(),
                new_items,
                keys_to_remove,
                payload_type,
            })
        }
        RecordKind::LinkUpdate => WireRecord::Links(LinkUpdate {
            uid: r.string()?,
            revision: r.u32()?,
            writer_name: r.string()?,
            is_delta: flags.is_delta(),
            new_links: r.links()?,
            links_to_remove: r.links()?,
        }),
        RecordKind::Commission | RecordKind::Retraction | RecordKind::Deletion => {
            let terminal_kind = match kind {
                RecordKind::Commission => TerminalKind::Commission,
                RecordKind::Retraction => TerminalKind::Retraction,
                _ => TerminalKind::Deletion,
            };
            WireRecord::Terminal(TerminalRecord {
                uid: r.string()?,
                revision: r.u32()?,
                writer_name: r.string()?,
                kind: terminal_kind,
            })
        }
        RecordKind::ResendRequest => WireRecord::Resend(ResendRequest {
            uid: r.string()?,
            hidden_scope_name: r.string()?,
        }),
    };

    if r.remaining() != 0 {
        return Err(IpaacaError::InvalidWireFormat(format!(
            "{} trailing bytes after {:?}",
            r.remaining(),
            kind
        )));
    }
    Ok(record)
}

/// Encode an RPC response (`0` = rejected)
pub fn encode_response(revision: u32) -> Bytes {
    Bytes::copy_from_slice(&revision.to_le_bytes())
}

/// Decode an RPC response
pub fn decode_response(buf: &[u8]) -> IpaacaResult<u32> {
    if buf.len() != RESPONSE_SIZE {
        return Err(IpaacaError::BufferTooShort {
            expected: RESPONSE_SIZE,
            actual: buf.len(),
        });
    }
    Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// Encode one payload value in the given payload type's representation
pub fn encode_value(value: &DocumentValue, payload_type: PayloadType) -> IpaacaResult<String> {
    match payload_type {
        PayloadType::Json => value.to_json_string(),
        PayloadType::Str => Ok(value.to_text()),
        PayloadType::Map => {
            if value.is_container() {
                Err(IpaacaError::TypeConversion(format!(
                    "MAP payloads cannot carry a {}",
                    value.kind_name()
                )))
            } else {
                Ok(value.to_text())
            }
        }
    }
}

/// Decode one payload value from the given payload type's representation
pub fn decode_value(text: &str, payload_type: PayloadType) -> IpaacaResult<DocumentValue> {
    match payload_type {
        PayloadType::Json => DocumentValue::from_json_str(text),
        PayloadType::Str | PayloadType::Map => Ok(DocumentValue::String(text.to_string())),
    }
}

fn put_str(out: &mut BytesMut, s: &str) -> IpaacaResult<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        IpaacaError::InvalidWireFormat(format!("string of {} bytes exceeds u16 prefix", s.len()))
    })?;
    out.put_u16_le(len);
    out.put_slice(s.as_bytes());
    Ok(())
}

fn put_count(out: &mut BytesMut, n: usize) -> IpaacaResult<()> {
    let n = u32::try_from(n)
        .map_err(|_| IpaacaError::InvalidWireFormat(format!("count {} exceeds u32", n)))?;
    out.put_u32_le(n);
    Ok(())
}

fn put_items(out: &mut BytesMut, items: &DocumentMap, payload_type: PayloadType) -> IpaacaResult<()> {
    put_count(out, items.len())?;
    for (key, value) in items {
        put_str(out, key)?;
        let text = encode_value(value, payload_type)?;
        put_count(out, text.len())?;
        out.put_slice(text.as_bytes());
    }
    Ok(())
}

fn put_links(out: &mut BytesMut, links: &LinkMap) -> IpaacaResult<()> {
    put_count(out, links.len())?;
    for (link_type, targets) in links {
        put_str(out, link_type)?;
        put_count(out, targets.len())?;
        for target in targets {
            put_str(out, target)?;
        }
    }
    Ok(())
}

/// Bounds-checked cursor over a frame
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> IpaacaResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(IpaacaError::BufferTooShort {
                expected: self.pos + n,
                actual: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> IpaacaResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> IpaacaResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> IpaacaResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn count(&mut self) -> IpaacaResult<usize> {
        Ok(self.u32()? as usize)
    }

    fn utf8(&mut self, len: usize) -> IpaacaResult<String> {
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| IpaacaError::InvalidWireFormat(format!("invalid UTF-8: {}", e)))
    }

    fn string(&mut self) -> IpaacaResult<String> {
        let len = self.u16()? as usize;
        self.utf8(len)
    }

    fn payload_type(&mut self) -> IpaacaResult<PayloadType> {
        let b = self.u8()?;
        PayloadType::from_byte(b)
            .ok_or_else(|| IpaacaError::InvalidWireFormat(format!("unknown payload type {}", b)))
    }

    fn items(&mut self, payload_type: PayloadType) -> IpaacaResult<DocumentMap> {
        let count = self.count()?;
        let mut items = DocumentMap::new();
        for _ in 0..count {
            let key = self.string()?;
            let len = self.count()?;
            let text = self.utf8(len)?;
            items.insert(key, decode_value(&text, payload_type)?);
        }
        Ok(items)
    }

    fn links(&mut self) -> IpaacaResult<LinkMap> {
        let count = self.count()?;
        let mut links = LinkMap::new();
        for _ in 0..count {
            let link_type = self.string()?;
            let n = self.count()?;
            let mut targets = BTreeSet::new();
            for _ in 0..n {
                targets.insert(self.string()?);
            }
            links.insert(link_type, targets);
        }
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipaaca_core::link_map;
    use proptest::prelude::*;

    fn payload_update(payload_type: PayloadType, items: DocumentMap) -> PayloadUpdate {
        PayloadUpdate {
            uid: "uid-1".into(),
            revision: 4,
            writer_name: "/ipaaca/component/AID00000000/OB".into(),
            is_delta: true,
            new_items: items,
            keys_to_remove: ["gone".to_string()].into_iter().collect(),
            payload_type,
        }
    }

    #[test]
    fn test_nested_json_payload_roundtrip() {
        let nested = DocumentValue::from_json_str(r#"["old", ["str", null], 3, {"key1": "value1"}]"#)
            .unwrap();
        let mut items = DocumentMap::new();
        items.insert("a".into(), nested.clone());
        items.insert("b".into(), DocumentValue::Float(12.5));
        let record = WireRecord::Payload(payload_update(PayloadType::Json, items));

        let bytes = encode(&record).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        match decoded {
            WireRecord::Payload(p) => assert_eq!(p.new_items["a"], nested),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_json_floats_survive_the_wire() {
        let mut items = DocumentMap::new();
        items.insert(
            "f".into(),
            DocumentValue::List(vec![
                DocumentValue::Float(-915384901.6932595),
                DocumentValue::Float(0.30000000000000004),
            ]),
        );
        let record = WireRecord::Payload(payload_update(PayloadType::Json, items));
        assert_eq!(decode(&encode(&record).unwrap()).unwrap(), record);
    }

    #[test]
    fn test_json_payload_rejects_nan() {
        let mut items = DocumentMap::new();
        items.insert("f".into(), DocumentValue::Float(f64::NAN));
        let err = encode(&WireRecord::Payload(payload_update(PayloadType::Json, items))).unwrap_err();
        assert!(matches!(err, IpaacaError::TypeConversion(_)));
    }

    #[test]
    fn test_str_payload_forces_text() {
        let mut items = DocumentMap::new();
        items.insert("n".into(), DocumentValue::Integer(100));
        items.insert("l".into(), DocumentValue::from(vec![1, 2]));
        let bytes = encode(&WireRecord::Payload(payload_update(PayloadType::Str, items))).unwrap();
        match decode(&bytes).unwrap() {
            WireRecord::Payload(p) => {
                assert_eq!(p.new_items["n"], DocumentValue::from("100"));
                assert_eq!(p.new_items["l"], DocumentValue::from("[1,2]"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_map_payload_rejects_containers() {
        let mut items = DocumentMap::new();
        items.insert("l".into(), DocumentValue::from(vec![1]));
        let err = encode(&WireRecord::Payload(payload_update(PayloadType::Map, items))).unwrap_err();
        assert!(matches!(err, IpaacaError::TypeConversion(_)));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut payload = DocumentMap::new();
        payload.insert("k".into(), DocumentValue::from("v"));
        let snapshot = UnitSnapshot {
            uid: "u".into(),
            revision: 1,
            category: "demo".into(),
            payload_type: PayloadType::Json,
            owner_name: "owner".into(),
            committed: false,
            retracted: true,
            read_only: true,
            access_mode: AccessMode::Push,
            payload,
            links: link_map("grin", ["x", "y"]),
        };
        let record = WireRecord::Unit(snapshot.clone());
        assert_eq!(decode(&encode(&record).unwrap()).unwrap(), record);

        let message = WireRecord::Message(UnitSnapshot {
            access_mode: AccessMode::Message,
            ..snapshot
        });
        assert_eq!(decode(&encode(&message).unwrap()).unwrap(), message);
    }

    #[test]
    fn test_link_and_terminal_records() {
        let links = WireRecord::Links(LinkUpdate {
            uid: "u".into(),
            revision: 2,
            writer_name: "w".into(),
            is_delta: false,
            new_links: link_map("reply_to", ["q"]),
            links_to_remove: LinkMap::new(),
        });
        assert_eq!(decode(&encode(&links).unwrap()).unwrap(), links);

        let terminal = WireRecord::Terminal(TerminalRecord {
            uid: "u".into(),
            revision: 3,
            writer_name: "w".into(),
            kind: TerminalKind::Deletion,
        });
        let bytes = encode(&terminal).unwrap();
        assert_eq!(bytes[0], 0x22);
        assert_eq!(decode(&bytes).unwrap(), terminal);
    }

    #[test]
    fn test_malformed_json_value() {
        let mut items = DocumentMap::new();
        items.insert("k".into(), DocumentValue::from("v"));
        let bytes = encode(&WireRecord::Payload(payload_update(PayloadType::Json, items))).unwrap();
        let mut raw = bytes.to_vec();
        // Corrupt the opening quote of the JSON text "\"v\""
        let pos = raw.iter().position(|&b| b == b'"').unwrap();
        raw[pos] = b'{';
        assert!(matches!(decode(&raw), Err(IpaacaError::JsonParsing(_))));
    }

    #[test]
    fn test_truncated_and_unknown() {
        assert!(matches!(decode(&[]), Err(IpaacaError::BufferTooShort { .. })));
        assert!(matches!(decode(&[0x7E, 0]), Err(IpaacaError::UnknownRecordKind(0x7E))));
        assert!(matches!(decode(&[0x20, 0x80]), Err(IpaacaError::InvalidWireFormat(_))));

        let terminal = WireRecord::Terminal(TerminalRecord {
            uid: "u".into(),
            revision: 3,
            writer_name: "w".into(),
            kind: TerminalKind::Commission,
        });
        let bytes = encode(&terminal).unwrap();
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(IpaacaError::BufferTooShort { .. })
        ));
        let mut padded = bytes.to_vec();
        padded.push(0);
        assert!(matches!(decode(&padded), Err(IpaacaError::InvalidWireFormat(_))));
    }

    #[test]
    fn test_response_codec() {
        assert_eq!(decode_response(&encode_response(7)).unwrap(), 7);
        assert_eq!(decode_response(&encode_response(0)).unwrap(), 0);
        assert!(decode_response(&[1, 2]).is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode(&data);
        }
    }
}
