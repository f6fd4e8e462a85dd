//! Framed message encoding for the IPC ring.
//!
//! One frame is a 16-byte header followed by a chain of self-describing
//! fields:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ MsgHeader                                                  │ 16 bytes
//! │  msg_type: u16   field_count: u16                          │
//! │  payload_len: u32   seq_no: u64                            │
//! ├────────────────────────────────────────────────────────────┤
//! │ FieldHeader  field_id: i16  field_type: u8  pad: u8        │ 8 bytes
//! │              value_len: u32                                │
//! │ value bytes                                                │
//! ├────────────────────────────────────────────────────────────┤
//! │ ... next field ...                                         │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! `payload_len` is authoritative; `field_count` is advisory and validated at
//! decode. Numeric values are little-endian raw bytes of their native width
//! (equal to host order on every machine the ring serves, since it never crosses
//! a network). Strings and byte blobs are length-prefixed, not
//! NUL-terminated.
//!
//! `seq_no` is written as 0 by the gateway; the sequencer stamps it
//! downstream.

use thiserror::Error;

/// Size of the fixed message header on the wire.
pub const MSG_HEADER_SIZE: usize = 16;

/// Size of one field header on the wire (includes one padding byte).
pub const FIELD_HEADER_SIZE: usize = 8;

/// Message type discriminants carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    None = 0,
    /// Client is submitting a new order.
    NewOrder = 1,
    /// Client wants to cancel an existing resting order.
    Cancel = 2,
    /// A trade occurred.
    Trade = 3,
    /// Incremental change to the order book.
    BookDelta = 4,
}

impl MsgType {
    /// Maps a raw header value back to a known type.
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::NewOrder),
            2 => Some(Self::Cancel),
            3 => Some(Self::Trade),
            4 => Some(Self::BookDelta),
            _ => None,
        }
    }
}

/// Well-known field identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum FieldId {
    Symbol = 1,
    /// 0 = buy, 1 = sell.
    Side = 2,
    /// Fixed-point ticks, price x 10000.
    Price = 3,
    Qty = 4,
    /// Originating client socket fd.
    ClientId = 5,
    /// Monotonic per-dispatcher order id.
    OrderId = 6,
    /// Time-in-force, 0 = DAY.
    Tif = 7,
}

/// On-wire field value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FieldType {
    Int64 = 1,
    Uint64 = 2,
    Double = 3,
    String = 4,
    Bytes = 5,
}

/// Decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer shorter than the header, or than `header + payload_len`.
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// A field's declared value length runs past the payload.
    #[error("field chain overruns payload at offset {offset}")]
    FieldOverrun { offset: usize },

    /// `field_count` disagrees with the fields actually present.
    #[error("field count mismatch: header says {declared}, payload holds {actual}")]
    CountMismatch { declared: u16, actual: u16 },
}

/// A framed IPC message: typed header plus an encoded field chain.
///
/// Build with the `add_*` methods, serialize with [`encode`](Self::encode),
/// parse with [`decode`](Self::decode), and read values back with the typed
/// getters (which return `None` on a missing field or a type/width
/// mismatch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    msg_type: u16,
    seq_no: u64,
    field_count: u16,
    /// Encoded field headers + values, ready to splice after the header.
    fields: Vec<u8>,
}

impl Default for IpcMessage {
    fn default() -> Self {
        Self::new(MsgType::None)
    }
}

impl IpcMessage {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type: msg_type as u16,
            seq_no: 0,
            field_count: 0,
            fields: Vec::new(),
        }
    }

    /// Raw message type from the header.
    pub fn msg_type_raw(&self) -> u16 {
        self.msg_type
    }

    /// Header message type, if it is a known discriminant.
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_raw(self.msg_type)
    }

    pub fn seq_no(&self) -> u64 {
        self.seq_no
    }

    pub fn set_seq_no(&mut self, seq_no: u64) {
        self.seq_no = seq_no;
    }

    pub fn field_count(&self) -> u16 {
        self.field_count
    }

    /// Total encoded size, for ring slot budgeting.
    pub fn encoded_len(&self) -> usize {
        MSG_HEADER_SIZE + self.fields.len()
    }

    // ----- builders -----

    pub fn add_i64(&mut self, id: FieldId, value: i64) {
        self.push_field_header(id, FieldType::Int64, 8);
        self.fields.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_u64(&mut self, id: FieldId, value: u64) {
        self.push_field_header(id, FieldType::Uint64, 8);
        self.fields.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_f64(&mut self, id: FieldId, value: f64) {
        self.push_field_header(id, FieldType::Double, 8);
        self.fields.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_str(&mut self, id: FieldId, value: &str) {
        self.push_field_header(id, FieldType::String, value.len() as u32);
        self.fields.extend_from_slice(value.as_bytes());
    }

    pub fn add_bytes(&mut self, id: FieldId, value: &[u8]) {
        self.push_field_header(id, FieldType::Bytes, value.len() as u32);
        self.fields.extend_from_slice(value);
    }

    fn push_field_header(&mut self, id: FieldId, ty: FieldType, value_len: u32) {
        self.fields.extend_from_slice(&(id as i16).to_le_bytes());
        self.fields.push(ty as u8);
        self.fields.push(0); // layout padding, always zero
        self.fields.extend_from_slice(&value_len.to_le_bytes());
        self.field_count += 1;
    }

    // ----- encode / decode -----

    /// Serializes header + fields into `out` (cleared first, capacity kept).
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(self.encoded_len());
        out.extend_from_slice(&self.msg_type.to_le_bytes());
        out.extend_from_slice(&self.field_count.to_le_bytes());
        out.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.seq_no.to_le_bytes());
        out.extend_from_slice(&self.fields);
    }

    /// Parses a frame read from the ring.
    ///
    /// # Errors
    ///
    /// Fails when the buffer is shorter than `header + payload_len`, when a
    /// field's length runs past the payload, or when the advisory
    /// `field_count` disagrees with the fields actually present.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < MSG_HEADER_SIZE {
            return Err(CodecError::Truncated {
                need: MSG_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let msg_type = u16::from_le_bytes([buf[0], buf[1]]);
        let declared_count = u16::from_le_bytes([buf[2], buf[3]]);
        let payload_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let seq_no = u64::from_le_bytes(buf[8..16].try_into().expect("header slice"));

        let need = MSG_HEADER_SIZE + payload_len;
        if buf.len() < need {
            return Err(CodecError::Truncated {
                need,
                have: buf.len(),
            });
        }
        let payload = &buf[MSG_HEADER_SIZE..need];

        let actual = walk_fields(payload)?;
        if actual != declared_count {
            return Err(CodecError::CountMismatch {
                declared: declared_count,
                actual,
            });
        }

        Ok(Self {
            msg_type,
            seq_no,
            field_count: declared_count,
            fields: payload.to_vec(),
        })
    }

    // ----- typed getters -----

    pub fn i64_field(&self, id: FieldId) -> Option<i64> {
        let value = self.find_field(id, FieldType::Int64)?;
        Some(i64::from_le_bytes(value.try_into().ok()?))
    }

    pub fn u64_field(&self, id: FieldId) -> Option<u64> {
        let value = self.find_field(id, FieldType::Uint64)?;
        Some(u64::from_le_bytes(value.try_into().ok()?))
    }

    pub fn f64_field(&self, id: FieldId) -> Option<f64> {
        let value = self.find_field(id, FieldType::Double)?;
        Some(f64::from_le_bytes(value.try_into().ok()?))
    }

    pub fn str_field(&self, id: FieldId) -> Option<&str> {
        let value = self.find_field(id, FieldType::String)?;
        std::str::from_utf8(value).ok()
    }

    pub fn bytes_field(&self, id: FieldId) -> Option<&[u8]> {
        self.find_field(id, FieldType::Bytes)
    }

    /// Walks the field chain for the first `(id, type)` match.
    ///
    /// The chain was validated at decode (or built by us), so the walk
    /// cannot overrun; the checks stay as debug assertions only.
    fn find_field(&self, id: FieldId, ty: FieldType) -> Option<&[u8]> {
        let mut cursor = 0usize;
        while cursor + FIELD_HEADER_SIZE <= self.fields.len() {
            let fid = i16::from_le_bytes([self.fields[cursor], self.fields[cursor + 1]]);
            let fty = self.fields[cursor + 2];
            let len = u32::from_le_bytes(
                self.fields[cursor + 4..cursor + 8].try_into().expect("field header slice"),
            ) as usize;
            let start = cursor + FIELD_HEADER_SIZE;
            debug_assert!(start + len <= self.fields.len());
            if start + len > self.fields.len() {
                return None;
            }
            if fid == id as i16 && fty == ty as u8 {
                return Some(&self.fields[start..start + len]);
            }
            cursor = start + len;
        }
        None
    }
}

/// Validates the field chain and returns the number of fields.
fn walk_fields(payload: &[u8]) -> Result<u16, CodecError> {
    let mut cursor = 0usize;
    let mut count: u16 = 0;
    while cursor < payload.len() {
        if cursor + FIELD_HEADER_SIZE > payload.len() {
            return Err(CodecError::FieldOverrun { offset: cursor });
        }
        let len = u32::from_le_bytes(
            payload[cursor + 4..cursor + 8].try_into().expect("field header slice"),
        ) as usize;
        cursor += FIELD_HEADER_SIZE;
        if cursor + len > payload.len() {
            return Err(CodecError::FieldOverrun { offset: cursor });
        }
        cursor += len;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order() -> IpcMessage {
        let mut msg = IpcMessage::new(MsgType::NewOrder);
        msg.add_str(FieldId::Symbol, "AAPL");
        msg.add_u64(FieldId::Side, 0);
        msg.add_i64(FieldId::Price, 1_505_000);
        msg.add_u64(FieldId::Qty, 100);
        msg.add_u64(FieldId::ClientId, 42);
        msg.add_u64(FieldId::OrderId, 1);
        msg.add_u64(FieldId::Tif, 0);
        msg
    }

    #[test]
    fn roundtrip_preserves_header_and_fields() {
        let msg = sample_order();
        let mut buf = Vec::new();
        msg.encode(&mut buf);

        let decoded = IpcMessage::decode(&buf).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.msg_type(), Some(MsgType::NewOrder));
        assert_eq!(decoded.field_count(), 7);
        assert_eq!(decoded.str_field(FieldId::Symbol), Some("AAPL"));
        assert_eq!(decoded.u64_field(FieldId::Side), Some(0));
        assert_eq!(decoded.i64_field(FieldId::Price), Some(1_505_000));
        assert_eq!(decoded.u64_field(FieldId::Qty), Some(100));
    }

    #[test]
    fn roundtrip_all_value_types() {
        let mut msg = IpcMessage::new(MsgType::BookDelta);
        msg.add_i64(FieldId::Price, -1);
        msg.add_u64(FieldId::Qty, u64::MAX);
        msg.add_f64(FieldId::Side, 0.25);
        msg.add_str(FieldId::Symbol, "");
        msg.add_bytes(FieldId::OrderId, &[0xde, 0xad, 0xbe, 0xef]);

        let mut buf = Vec::new();
        msg.encode(&mut buf);
        let decoded = IpcMessage::decode(&buf).unwrap();

        assert_eq!(decoded.i64_field(FieldId::Price), Some(-1));
        assert_eq!(decoded.u64_field(FieldId::Qty), Some(u64::MAX));
        assert_eq!(decoded.f64_field(FieldId::Side), Some(0.25));
        assert_eq!(decoded.str_field(FieldId::Symbol), Some(""));
        assert_eq!(
            decoded.bytes_field(FieldId::OrderId),
            Some(&[0xde, 0xad, 0xbe, 0xef][..])
        );
    }

    #[test]
    fn getters_check_type_and_width() {
        let msg = sample_order();
        // Symbol is a string, not an integer.
        assert_eq!(msg.u64_field(FieldId::Symbol), None);
        // Price is signed, not unsigned.
        assert_eq!(msg.u64_field(FieldId::Price), None);
        // Absent field.
        let empty = IpcMessage::new(MsgType::Cancel);
        assert_eq!(empty.u64_field(FieldId::Qty), None);
    }

    #[test]
    fn decode_rejects_every_truncation() {
        let msg = sample_order();
        let mut buf = Vec::new();
        msg.encode(&mut buf);

        for k in 0..buf.len() {
            assert!(
                IpcMessage::decode(&buf[..k]).is_err(),
                "prefix of {k} bytes must not decode"
            );
        }
        assert!(IpcMessage::decode(&buf).is_ok());
    }

    #[test]
    fn decode_validates_field_count() {
        let msg = sample_order();
        let mut buf = Vec::new();
        msg.encode(&mut buf);

        // Corrupt the advisory count.
        buf[2] = 99;
        assert_eq!(
            IpcMessage::decode(&buf),
            Err(CodecError::CountMismatch {
                declared: 99,
                actual: 7
            })
        );
    }

    #[test]
    fn decode_rejects_overrunning_field_length() {
        let mut msg = IpcMessage::new(MsgType::NewOrder);
        msg.add_str(FieldId::Symbol, "MSFT");
        let mut buf = Vec::new();
        msg.encode(&mut buf);

        // Inflate the field's value_len beyond the payload.
        let len_off = MSG_HEADER_SIZE + 4;
        buf[len_off..len_off + 4].copy_from_slice(&1000u32.to_le_bytes());
        // Keep payload_len consistent so the overrun check itself fires.
        assert!(matches!(
            IpcMessage::decode(&buf),
            Err(CodecError::FieldOverrun { .. })
        ));
    }

    #[test]
    fn empty_message_encodes_to_bare_header() {
        let msg = IpcMessage::new(MsgType::None);
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), MSG_HEADER_SIZE);
        let decoded = IpcMessage::decode(&buf).unwrap();
        assert_eq!(decoded.field_count(), 0);
        assert_eq!(decoded.msg_type(), Some(MsgType::None));
    }
}
