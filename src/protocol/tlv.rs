//! TLV8 encoding used throughout `HomeKit` pairing and configuration payloads
//!
//! Every entry is `{type: u8, length: u8, value}`. Values longer than 255
//! bytes are split across consecutive entries of the same type; repeated
//! structured values are separated by a zero-length type-0 delimiter entry.
//!
//! Two decode contracts exist over the same bytes and the correct one is
//! context-dependent: [`TlvReader::decode`] merges duplicate types by
//! concatenation (the legacy contract pairing payloads rely on), while
//! [`decode_with_lists`] keeps delimiter-separated repetitions as a
//! sequence and only concatenates genuine max-length continuations.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Zero-length entry of this type separates repeated values in a list.
pub const DELIMITER_TYPE: u8 = 0x00;

/// Maximum value bytes a single TLV8 entry can carry.
const MAX_ENTRY_LEN: usize = 255;

/// TLV decoding errors
#[derive(Debug, Error)]
pub enum TlvError {
    /// An entry header was cut off, or a claimed length ran past the buffer.
    #[error("tlv entry at offset {offset} exceeds remaining buffer")]
    LengthRunOff {
        /// Offset of the offending entry header
        offset: usize,
    },

    /// Duplicate entry where neither continuation nor list semantics apply.
    #[error("duplicated tlv entry: 0x{0:02x}")]
    DuplicatedEntry(u8),

    /// A required entry was absent.
    #[error("missing tlv entry: 0x{0:02x}")]
    MissingEntry(u8),

    /// An entry was present but its value had the wrong shape.
    #[error("invalid value for tlv entry 0x{0:02x}")]
    InvalidValue(u8),
}

/// Fluent TLV8 encoder
///
/// Values over 255 bytes are fragmented into consecutive entries of the
/// same type; [`TlvEncoder::add_list`] writes delimiter-separated repeated
/// values.
pub struct TlvEncoder {
    buffer: Vec<u8>,
}

impl TlvEncoder {
    /// Create a new encoder
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Add one entry, fragmenting values longer than 255 bytes
    #[must_use]
    pub fn add(mut self, tlv_type: u8, value: &[u8]) -> Self {
        self.push_entry(tlv_type, value);
        self
    }

    /// Add a single-byte entry
    #[must_use]
    pub fn add_u8(self, tlv_type: u8, value: u8) -> Self {
        self.add(tlv_type, &[value])
    }

    /// Add repeated values of one type, separated by delimiter entries
    #[must_use]
    pub fn add_list<I, V>(mut self, tlv_type: u8, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        let mut first = true;
        for value in values {
            if !first {
                self.buffer.push(DELIMITER_TYPE);
                self.buffer.push(0);
            }
            first = false;
            self.push_entry(tlv_type, value.as_ref());
        }
        self
    }

    /// Build the encoded bytes
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    fn push_entry(&mut self, tlv_type: u8, value: &[u8]) {
        if value.is_empty() {
            self.buffer.push(tlv_type);
            self.buffer.push(0);
            return;
        }
        for chunk in value.chunks(MAX_ENTRY_LEN) {
            self.buffer.push(tlv_type);
            #[allow(clippy::cast_possible_truncation)]
            self.buffer.push(chunk.len() as u8);
            self.buffer.extend_from_slice(chunk);
        }
    }
}

impl Default for TlvEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// One raw `{type, value}` entry as it appears on the wire.
struct RawEntry {
    tlv_type: u8,
    value: Vec<u8>,
}

/// Walk the buffer entry by entry, validating lengths.
fn scan(data: &[u8]) -> Result<Vec<RawEntry>, TlvError> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        if pos + 2 > data.len() {
            return Err(TlvError::LengthRunOff { offset: pos });
        }
        let tlv_type = data[pos];
        let length = data[pos + 1] as usize;
        if pos + 2 + length > data.len() {
            return Err(TlvError::LengthRunOff { offset: pos });
        }
        entries.push(RawEntry {
            tlv_type,
            value: data[pos + 2..pos + 2 + length].to_vec(),
        });
        pos += 2 + length;
    }

    Ok(entries)
}

/// Decoded TLV payload with the legacy duplicate-merging contract
pub struct TlvReader {
    items: HashMap<u8, Vec<u8>>,
}

impl TlvReader {
    /// Decode, concatenating duplicate types.
    ///
    /// This merges both genuine >255-byte continuations and repeated
    /// entries; pairing payloads depend on exactly this behavior, so it is
    /// preserved byte-for-byte even where list semantics would be cleaner.
    ///
    /// # Errors
    ///
    /// Returns [`TlvError::LengthRunOff`] if an entry claims more bytes
    /// than remain in the buffer.
    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut items: HashMap<u8, Vec<u8>> = HashMap::new();
        for entry in scan(data)? {
            items
                .entry(entry.tlv_type)
                .or_default()
                .extend_from_slice(&entry.value);
        }
        Ok(Self { items })
    }

    /// Get a value by type
    #[must_use]
    pub fn get(&self, tlv_type: u8) -> Option<&[u8]> {
        self.items.get(&tlv_type).map(Vec::as_slice)
    }

    /// Get a single-byte value
    #[must_use]
    pub fn get_u8(&self, tlv_type: u8) -> Option<u8> {
        self.get(tlv_type).and_then(|v| v.first().copied())
    }

    /// Get a required value
    ///
    /// # Errors
    ///
    /// Returns [`TlvError::MissingEntry`] if absent.
    pub fn get_required(&self, tlv_type: u8) -> Result<&[u8], TlvError> {
        self.get(tlv_type).ok_or(TlvError::MissingEntry(tlv_type))
    }

    /// Get a required exactly-one-byte value
    ///
    /// # Errors
    ///
    /// Returns [`TlvError::MissingEntry`] if absent or
    /// [`TlvError::InvalidValue`] if not exactly one byte.
    pub fn get_required_u8(&self, tlv_type: u8) -> Result<u8, TlvError> {
        let value = self.get_required(tlv_type)?;
        if value.len() != 1 {
            return Err(TlvError::InvalidValue(tlv_type));
        }
        Ok(value[0])
    }
}

/// A decoded value that may be a single byte string or a list of them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    /// A single (possibly reassembled) value
    Single(Vec<u8>),
    /// Delimiter-separated repeated values
    List(Vec<Vec<u8>>),
}

/// Decode, keeping delimiter-separated repetitions as lists.
///
/// A duplicate type is a continuation (concatenated) only when it directly
/// follows an entry of the same type that was filled to 255 bytes; it is a
/// list element only when the directly preceding entry was a delimiter.
/// Any other duplicate is an error.
///
/// # Errors
///
/// Returns [`TlvError::LengthRunOff`] on malformed lengths and
/// [`TlvError::DuplicatedEntry`] on duplicates with neither continuation
/// nor list context.
pub fn decode_with_lists(data: &[u8]) -> Result<HashMap<u8, TlvValue>, TlvError> {
    let mut items: HashMap<u8, TlvValue> = HashMap::new();
    let mut previous: Option<(u8, usize)> = None;

    for entry in scan(data)? {
        if entry.tlv_type == DELIMITER_TYPE && entry.value.is_empty() {
            previous = Some((DELIMITER_TYPE, 0));
            continue;
        }

        match items.get_mut(&entry.tlv_type) {
            None => {
                items.insert(entry.tlv_type, TlvValue::Single(entry.value.clone()));
            }
            Some(existing) => match previous {
                Some((DELIMITER_TYPE, 0)) => match existing {
                    TlvValue::Single(first) => {
                        let first = std::mem::take(first);
                        *existing = TlvValue::List(vec![first, entry.value.clone()]);
                    }
                    TlvValue::List(list) => list.push(entry.value.clone()),
                },
                Some((prev_type, prev_len))
                    if prev_type == entry.tlv_type && prev_len == MAX_ENTRY_LEN =>
                {
                    match existing {
                        TlvValue::Single(buf) => buf.extend_from_slice(&entry.value),
                        TlvValue::List(list) => {
                            if let Some(last) = list.last_mut() {
                                last.extend_from_slice(&entry.value);
                            }
                        }
                    }
                }
                _ => return Err(TlvError::DuplicatedEntry(entry.tlv_type)),
            },
        }

        previous = Some((entry.tlv_type, entry.value.len()));
    }

    Ok(items)
}

/// Split a flat TLV stream into records, each beginning at `entry_start_id`.
///
/// Entries seen before the first `entry_start_id` are ignored. Each record
/// is decoded with the legacy merging contract.
///
/// # Errors
///
/// Returns [`TlvError::LengthRunOff`] on malformed lengths.
pub fn decode_list(data: &[u8], entry_start_id: u8) -> Result<Vec<TlvReader>, TlvError> {
    let mut records: Vec<Vec<RawEntry>> = Vec::new();
    let mut last: Option<(u8, usize)> = None;

    for entry in scan(data)? {
        // A start id directly continuing a max-length start entry is a
        // fragment of the current record, not a new one.
        let continuation = entry.tlv_type == entry_start_id
            && matches!(last, Some((t, l)) if t == entry_start_id && l == MAX_ENTRY_LEN);
        if entry.tlv_type == entry_start_id && !continuation {
            records.push(Vec::new());
        }
        last = Some((entry.tlv_type, entry.value.len()));
        if let Some(record) = records.last_mut() {
            record.push(entry);
        }
    }

    Ok(records
        .into_iter()
        .map(|entries| {
            let mut items: HashMap<u8, Vec<u8>> = HashMap::new();
            for entry in entries {
                items
                    .entry(entry.tlv_type)
                    .or_default()
                    .extend_from_slice(&entry.value);
            }
            TlvReader { items }
        })
        .collect())
}

/// Write a `u16` as 2 little-endian bytes
#[must_use]
pub fn write_uint16_le(value: u16) -> [u8; 2] {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, value);
    buf
}

/// Write a `u32` as 4 little-endian bytes
#[must_use]
pub fn write_uint32_le(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    buf
}

/// Write a `u64` as 8 little-endian bytes
#[must_use]
pub fn write_uint64_le(value: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, value);
    buf
}

/// Read a little-endian `u16` from the start of `data`
///
/// # Errors
///
/// Returns [`TlvError::LengthRunOff`] if fewer than 2 bytes remain.
pub fn read_uint16_le(data: &[u8]) -> Result<u16, TlvError> {
    if data.len() < 2 {
        return Err(TlvError::LengthRunOff { offset: 0 });
    }
    Ok(LittleEndian::read_u16(data))
}

/// Read a little-endian `u32` from the start of `data`
///
/// # Errors
///
/// Returns [`TlvError::LengthRunOff`] if fewer than 4 bytes remain.
pub fn read_uint32_le(data: &[u8]) -> Result<u32, TlvError> {
    if data.len() < 4 {
        return Err(TlvError::LengthRunOff { offset: 0 });
    }
    Ok(LittleEndian::read_u32(data))
}

/// Read a big-endian `u64` from the start of `data`
///
/// The mixed endianness relative to the little-endian writers is part of
/// the wire format and is kept as-is.
///
/// # Errors
///
/// Returns [`TlvError::LengthRunOff`] if fewer than 8 bytes remain.
pub fn read_uint64_be(data: &[u8]) -> Result<u64, TlvError> {
    if data.len() < 8 {
        return Err(TlvError::LengthRunOff { offset: 0 });
    }
    Ok(byteorder::BigEndian::read_u64(data))
}

/// Write an unsigned integer with the narrowest of 1/2/4/8 LE widths
#[must_use]
pub fn write_variable_uint_le(value: u64) -> Vec<u8> {
    if value <= u64::from(u8::MAX) {
        #[allow(clippy::cast_possible_truncation)]
        vec![value as u8]
    } else if value <= u64::from(u16::MAX) {
        #[allow(clippy::cast_possible_truncation)]
        write_uint16_le(value as u16).to_vec()
    } else if value <= u64::from(u32::MAX) {
        #[allow(clippy::cast_possible_truncation)]
        write_uint32_le(value as u32).to_vec()
    } else {
        write_uint64_le(value).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_simple() {
        let encoded = TlvEncoder::new().add_u8(0x06, 1).add_u8(0x00, 0).build();
        assert_eq!(encoded, vec![0x06, 0x01, 0x01, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn round_trip_small_value() {
        let encoded = TlvEncoder::new().add(0x03, b"hello").build();
        let reader = TlvReader::decode(&encoded).unwrap();
        assert_eq!(reader.get(0x03), Some(&b"hello"[..]));
    }

    #[test]
    fn fragmentation_over_255() {
        let long = vec![0xAA; 300];
        let encoded = TlvEncoder::new().add(0x03, &long).build();

        assert_eq!(encoded[0], 0x03);
        assert_eq!(encoded[1], 255);
        assert_eq!(encoded[2 + 255], 0x03);
        assert_eq!(encoded[2 + 255 + 1], 45);

        let reader = TlvReader::decode(&encoded).unwrap();
        assert_eq!(reader.get(0x03), Some(&long[..]));
    }

    #[test]
    fn empty_value_encodes_zero_length_entry() {
        let encoded = TlvEncoder::new().add(0x0B, &[]).build();
        assert_eq!(encoded, vec![0x0B, 0x00]);
        let reader = TlvReader::decode(&encoded).unwrap();
        assert_eq!(reader.get(0x0B), Some(&[][..]));
    }

    #[test]
    fn legacy_decode_concatenates_repeated_entries() {
        let encoded = TlvEncoder::new().add(0x01, b"abc").add(0x01, b"def").build();
        let reader = TlvReader::decode(&encoded).unwrap();
        assert_eq!(reader.get(0x01), Some(&b"abcdef"[..]));
    }

    #[test]
    fn decode_with_lists_keeps_sequence() {
        let encoded = TlvEncoder::new()
            .add_list(0x01, [b"abc".as_slice(), b"def".as_slice(), b"gh".as_slice()])
            .build();
        let items = decode_with_lists(&encoded).unwrap();
        assert_eq!(
            items.get(&0x01),
            Some(&TlvValue::List(vec![
                b"abc".to_vec(),
                b"def".to_vec(),
                b"gh".to_vec()
            ]))
        );
    }

    #[test]
    fn decode_with_lists_reassembles_continuation() {
        let long = vec![0x42; 700];
        let encoded = TlvEncoder::new().add(0x05, &long).build();
        let items = decode_with_lists(&encoded).unwrap();
        assert_eq!(items.get(&0x05), Some(&TlvValue::Single(long)));
    }

    #[test]
    fn decode_with_lists_rejects_bare_duplicate() {
        let encoded = TlvEncoder::new().add(0x01, b"abc").add(0x01, b"def").build();
        let err = decode_with_lists(&encoded).unwrap_err();
        assert!(matches!(err, TlvError::DuplicatedEntry(0x01)));
    }

    #[test]
    fn decode_list_splits_records_on_start_id() {
        let mut stream = Vec::new();
        for i in 0..3u8 {
            let record = TlvEncoder::new()
                .add_u8(0x01, i)
                .add(0x02, &[0x10 + i, 0x20 + i])
                .build();
            stream.extend_from_slice(&record);
        }

        let records = decode_list(&stream, 0x01).unwrap();
        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let i = i as u8;
            assert_eq!(record.get_u8(0x01), Some(i));
            assert_eq!(record.get(0x02), Some(&[0x10 + i, 0x20 + i][..]));
        }
    }

    #[test]
    fn length_runoff_is_an_error_not_a_panic() {
        // Claims 16 value bytes, provides 2.
        let data = [0x01, 0x10, 0xAA, 0xBB];
        assert!(matches!(
            TlvReader::decode(&data),
            Err(TlvError::LengthRunOff { offset: 0 })
        ));

        // Type byte with no length byte.
        let data = [0x01];
        assert!(TlvReader::decode(&data).is_err());
    }

    #[test]
    fn fixed_width_helpers() {
        assert_eq!(write_uint16_le(0x1234), [0x34, 0x12]);
        assert_eq!(write_uint32_le(0x1234_5678), [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(read_uint16_le(&[0x34, 0x12]).unwrap(), 0x1234);
        assert_eq!(read_uint32_le(&[0x78, 0x56, 0x34, 0x12]).unwrap(), 0x1234_5678);
        // The u64 read is big-endian on purpose.
        assert_eq!(
            read_uint64_be(&[0, 0, 0, 0, 0, 0, 0x12, 0x34]).unwrap(),
            0x1234
        );
        assert!(read_uint16_le(&[0x01]).is_err());
    }

    #[test]
    fn variable_uint_picks_narrowest_width() {
        assert_eq!(write_variable_uint_le(0xAB), vec![0xAB]);
        assert_eq!(write_variable_uint_le(0x0100), vec![0x00, 0x01]);
        assert_eq!(write_variable_uint_le(0x0001_0000), vec![0x00, 0x00, 0x01, 0x00]);
        assert_eq!(
            write_variable_uint_le(0x1_0000_0000),
            vec![0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn round_trip_any_value(value in proptest::collection::vec(any::<u8>(), 0..2000)) {
                let encoded = TlvEncoder::new().add(0x09, &value).build();
                let reader = TlvReader::decode(&encoded).unwrap();
                prop_assert_eq!(reader.get(0x09).unwrap(), &value[..]);
            }

            #[test]
            fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..600)) {
                let _ = TlvReader::decode(&data);
                let _ = decode_with_lists(&data);
                let _ = decode_list(&data, 0x01);
            }
        }
    }
}
