//! Typed binary encoding for data-stream headers and messages
//!
//! Similar in spirit to TLV8 but with typed scalars, sequences and
//! dictionaries. Every value starts with a tag byte:
//!
//! | tag            | value                                   |
//! |----------------|-----------------------------------------|
//! | `0x01`/`0x02`  | true / false                            |
//! | `0x04`         | null                                    |
//! | `0x08..=0x2E`  | small integer 0..=38, inline            |
//! | `0x30..=0x33`  | i8 / i16 LE / i32 LE / i64 LE           |
//! | `0x35`/`0x36`  | f32 LE / f64 LE                         |
//! | `0x40..=0x60`  | UTF-8, length 0..=32 inline             |
//! | `0x61..=0x63`  | UTF-8, length as u8 / u16 LE / u32 LE   |
//! | `0x70..=0x90`  | byte string, length 0..=32 inline       |
//! | `0x91..=0x93`  | byte string, length u8 / u16 LE / u32 LE|
//! | `0xD0..=0xDC`  | array, count 0..=12 inline              |
//! | `0xDD..=0xDF`  | array, count u8 / u16 LE / u32 LE       |
//! | `0xE0..=0xEC`  | dictionary, count 0..=12 inline         |
//! | `0xED..=0xEF`  | dictionary, count u8 / u16 LE / u32 LE  |
//!
//! Dictionary entries are a string key followed by any value.

use std::collections::HashMap;

use thiserror::Error;

/// Decoding errors
#[derive(Debug, Error)]
pub enum DataStreamParseError {
    #[error("unexpected end of buffer")]
    UnexpectedEnd,

    #[error("unknown tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("dictionary key is not a string")]
    NonStringKey,

    #[error("trailing bytes after value")]
    TrailingBytes,

    #[error("value too large to encode")]
    ValueTooLarge,

    #[error("nesting too deep")]
    TooDeep,
}

/// Maximum recursion depth while decoding
const MAX_DEPTH: usize = 32;

/// A decoded data-stream value
#[derive(Debug, Clone, PartialEq)]
pub enum DataStreamValue {
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Data(Vec<u8>),
    /// Ordered sequence
    Array(Vec<DataStreamValue>),
    /// String-keyed map
    Dictionary(DataStreamDict),
}

/// A string-keyed message or header
pub type DataStreamDict = HashMap<String, DataStreamValue>;

impl DataStreamValue {
    /// String accessor
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer accessor
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Bytes accessor
    #[must_use]
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary accessor
    #[must_use]
    pub fn as_dict(&self) -> Option<&DataStreamDict> {
        match self {
            Self::Dictionary(d) => Some(d),
            _ => None,
        }
    }
}

impl From<&str> for DataStreamValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for DataStreamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for DataStreamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for DataStreamValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Data(value)
    }
}

/// Encode one value
///
/// # Errors
///
/// Returns [`DataStreamParseError::ValueTooLarge`] if a string, data or
/// container exceeds the u32 length range.
pub fn encode_value(value: &DataStreamValue, out: &mut Vec<u8>) -> Result<(), DataStreamParseError> {
    match value {
        DataStreamValue::Null => out.push(0x04),
        DataStreamValue::Bool(true) => out.push(0x01),
        DataStreamValue::Bool(false) => out.push(0x02),
        DataStreamValue::Int(i) => encode_int(*i, out),
        DataStreamValue::Float(f) => {
            out.push(0x36);
            out.extend_from_slice(&f.to_le_bytes());
        }
        DataStreamValue::String(s) => {
            encode_length(s.len(), 0x40, 32, 0x61, out)?;
            out.extend_from_slice(s.as_bytes());
        }
        DataStreamValue::Data(d) => {
            encode_length(d.len(), 0x70, 32, 0x91, out)?;
            out.extend_from_slice(d);
        }
        DataStreamValue::Array(items) => {
            encode_length(items.len(), 0xD0, 12, 0xDD, out)?;
            for item in items {
                encode_value(item, out)?;
            }
        }
        DataStreamValue::Dictionary(entries) => {
            encode_length(entries.len(), 0xE0, 12, 0xED, out)?;
            for (key, item) in entries {
                encode_value(&DataStreamValue::String(key.clone()), out)?;
                encode_value(item, out)?;
            }
        }
    }
    Ok(())
}

fn encode_int(value: i64, out: &mut Vec<u8>) {
    if (0..=38).contains(&value) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        out.push(0x08 + value as u8);
    } else if let Ok(v) = i8::try_from(value) {
        out.push(0x30);
        out.extend_from_slice(&v.to_le_bytes());
    } else if let Ok(v) = i16::try_from(value) {
        out.push(0x31);
        out.extend_from_slice(&v.to_le_bytes());
    } else if let Ok(v) = i32::try_from(value) {
        out.push(0x32);
        out.extend_from_slice(&v.to_le_bytes());
    } else {
        out.push(0x33);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn encode_length(
    len: usize,
    inline_base: u8,
    inline_max: usize,
    wide_base: u8,
    out: &mut Vec<u8>,
) -> Result<(), DataStreamParseError> {
    if len <= inline_max {
        #[allow(clippy::cast_possible_truncation)]
        out.push(inline_base + len as u8);
    } else if let Ok(len) = u8::try_from(len) {
        out.push(wide_base);
        out.push(len);
    } else if let Ok(len) = u16::try_from(len) {
        out.push(wide_base + 1);
        out.extend_from_slice(&len.to_le_bytes());
    } else if let Ok(len) = u32::try_from(len) {
        out.push(wide_base + 2);
        out.extend_from_slice(&len.to_le_bytes());
    } else {
        return Err(DataStreamParseError::ValueTooLarge);
    }
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DataStreamParseError> {
        if self.pos + n > self.data.len() {
            return Err(DataStreamParseError::UnexpectedEnd);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, DataStreamParseError> {
        Ok(self.take(1)?[0])
    }
}

/// Decode exactly one value from the buffer
///
/// # Errors
///
/// Returns a [`DataStreamParseError`] on malformed input or trailing
/// bytes.
pub fn decode_value(data: &[u8]) -> Result<DataStreamValue, DataStreamParseError> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = decode_inner(&mut cursor, 0)?;
    if cursor.pos != data.len() {
        return Err(DataStreamParseError::TrailingBytes);
    }
    Ok(value)
}

fn decode_inner(
    cursor: &mut Cursor<'_>,
    depth: usize,
) -> Result<DataStreamValue, DataStreamParseError> {
    if depth > MAX_DEPTH {
        return Err(DataStreamParseError::TooDeep);
    }

    let tag = cursor.take_u8()?;
    let value = match tag {
        0x01 => DataStreamValue::Bool(true),
        0x02 => DataStreamValue::Bool(false),
        0x04 => DataStreamValue::Null,
        0x08..=0x2E => DataStreamValue::Int(i64::from(tag - 0x08)),
        0x30 => DataStreamValue::Int(i64::from(i8::from_le_bytes([cursor.take_u8()?]))),
        0x31 => {
            let bytes: [u8; 2] = cursor.take(2)?.try_into().unwrap();
            DataStreamValue::Int(i64::from(i16::from_le_bytes(bytes)))
        }
        0x32 => {
            let bytes: [u8; 4] = cursor.take(4)?.try_into().unwrap();
            DataStreamValue::Int(i64::from(i32::from_le_bytes(bytes)))
        }
        0x33 => {
            let bytes: [u8; 8] = cursor.take(8)?.try_into().unwrap();
            DataStreamValue::Int(i64::from_le_bytes(bytes))
        }
        0x35 => {
            let bytes: [u8; 4] = cursor.take(4)?.try_into().unwrap();
            DataStreamValue::Float(f64::from(f32::from_le_bytes(bytes)))
        }
        0x36 => {
            let bytes: [u8; 8] = cursor.take(8)?.try_into().unwrap();
            DataStreamValue::Float(f64::from_le_bytes(bytes))
        }
        0x40..=0x60 => decode_string(cursor, usize::from(tag - 0x40))?,
        0x61..=0x63 => {
            let len = decode_wide_length(cursor, tag - 0x61)?;
            decode_string(cursor, len)?
        }
        0x70..=0x90 => DataStreamValue::Data(cursor.take(usize::from(tag - 0x70))?.to_vec()),
        0x91..=0x93 => {
            let len = decode_wide_length(cursor, tag - 0x91)?;
            DataStreamValue::Data(cursor.take(len)?.to_vec())
        }
        0xD0..=0xDC => decode_array(cursor, usize::from(tag - 0xD0), depth)?,
        0xDD..=0xDF => {
            let count = decode_wide_length(cursor, tag - 0xDD)?;
            decode_array(cursor, count, depth)?
        }
        0xE0..=0xEC => decode_dictionary(cursor, usize::from(tag - 0xE0), depth)?,
        0xED..=0xEF => {
            let count = decode_wide_length(cursor, tag - 0xED)?;
            decode_dictionary(cursor, count, depth)?
        }
        other => return Err(DataStreamParseError::UnknownTag(other)),
    };
    Ok(value)
}

fn decode_wide_length(cursor: &mut Cursor<'_>, width: u8) -> Result<usize, DataStreamParseError> {
    Ok(match width {
        0 => usize::from(cursor.take_u8()?),
        1 => {
            let bytes: [u8; 2] = cursor.take(2)?.try_into().unwrap();
            usize::from(u16::from_le_bytes(bytes))
        }
        _ => {
            let bytes: [u8; 4] = cursor.take(4)?.try_into().unwrap();
            u32::from_le_bytes(bytes) as usize
        }
    })
}

fn decode_string(cursor: &mut Cursor<'_>, len: usize) -> Result<DataStreamValue, DataStreamParseError> {
    let bytes = cursor.take(len)?;
    let s = std::str::from_utf8(bytes).map_err(|_| DataStreamParseError::InvalidUtf8)?;
    Ok(DataStreamValue::String(s.to_string()))
}

fn decode_array(
    cursor: &mut Cursor<'_>,
    count: usize,
    depth: usize,
) -> Result<DataStreamValue, DataStreamParseError> {
    let mut items = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        items.push(decode_inner(cursor, depth + 1)?);
    }
    Ok(DataStreamValue::Array(items))
}

fn decode_dictionary(
    cursor: &mut Cursor<'_>,
    count: usize,
    depth: usize,
) -> Result<DataStreamValue, DataStreamParseError> {
    let mut entries = DataStreamDict::with_capacity(count.min(64));
    for _ in 0..count {
        let DataStreamValue::String(key) = decode_inner(cursor, depth + 1)? else {
            return Err(DataStreamParseError::NonStringKey);
        };
        entries.insert(key, decode_inner(cursor, depth + 1)?);
    }
    Ok(DataStreamValue::Dictionary(entries))
}

/// Encode `{headerLen u8}{header}{message}`
///
/// # Errors
///
/// Returns [`DataStreamParseError::ValueTooLarge`] if the encoded header
/// does not fit the one-byte length prefix.
pub fn encode_payload(
    header: &DataStreamDict,
    message: &DataStreamDict,
) -> Result<Vec<u8>, DataStreamParseError> {
    let mut header_bytes = Vec::new();
    encode_value(&DataStreamValue::Dictionary(header.clone()), &mut header_bytes)?;
    let Ok(header_len) = u8::try_from(header_bytes.len()) else {
        return Err(DataStreamParseError::ValueTooLarge);
    };

    let mut out = Vec::with_capacity(1 + header_bytes.len() + 64);
    out.push(header_len);
    out.extend_from_slice(&header_bytes);
    encode_value(&DataStreamValue::Dictionary(message.clone()), &mut out)?;
    Ok(out)
}

/// Split and decode `{headerLen u8}{header}{message}`
///
/// # Errors
///
/// Returns a [`DataStreamParseError`] if either part is malformed or the
/// parts are not dictionaries.
pub fn decode_payload(
    data: &[u8],
) -> Result<(DataStreamDict, DataStreamDict), DataStreamParseError> {
    let Some((&header_len, rest)) = data.split_first() else {
        return Err(DataStreamParseError::UnexpectedEnd);
    };
    let header_len = usize::from(header_len);
    if rest.len() < header_len {
        return Err(DataStreamParseError::UnexpectedEnd);
    }
    let (header_bytes, message_bytes) = rest.split_at(header_len);

    let DataStreamValue::Dictionary(header) = decode_value(header_bytes)? else {
        return Err(DataStreamParseError::NonStringKey);
    };
    let DataStreamValue::Dictionary(message) = decode_value(message_bytes)? else {
        return Err(DataStreamParseError::NonStringKey);
    };
    Ok((header, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: DataStreamValue) {
        let mut bytes = Vec::new();
        encode_value(&value, &mut bytes).unwrap();
        assert_eq!(decode_value(&bytes).unwrap(), value);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(DataStreamValue::Null);
        round_trip(DataStreamValue::Bool(true));
        round_trip(DataStreamValue::Bool(false));
        round_trip(DataStreamValue::Int(0));
        round_trip(DataStreamValue::Int(38));
        round_trip(DataStreamValue::Int(39));
        round_trip(DataStreamValue::Int(-1));
        round_trip(DataStreamValue::Int(i64::MIN));
        round_trip(DataStreamValue::Int(i64::MAX));
        round_trip(DataStreamValue::Float(1.5));
        round_trip(DataStreamValue::String(String::new()));
        round_trip(DataStreamValue::String("hello".to_string()));
        round_trip(DataStreamValue::String("x".repeat(300)));
        round_trip(DataStreamValue::Data(vec![0u8; 40]));
        round_trip(DataStreamValue::Data(vec![7u8; 70_000]));
    }

    #[test]
    fn small_int_is_one_byte() {
        let mut bytes = Vec::new();
        encode_value(&DataStreamValue::Int(5), &mut bytes).unwrap();
        assert_eq!(bytes, vec![0x08 + 5]);
    }

    #[test]
    fn containers_round_trip() {
        let mut dict = DataStreamDict::new();
        dict.insert("protocol".to_string(), "control".into());
        dict.insert("id".to_string(), 42i64.into());
        dict.insert(
            "nested".to_string(),
            DataStreamValue::Array(vec![1i64.into(), true.into(), DataStreamValue::Null]),
        );
        round_trip(DataStreamValue::Dictionary(dict));
    }

    #[test]
    fn payload_round_trip() {
        let mut header = DataStreamDict::new();
        header.insert("protocol".to_string(), "control".into());
        header.insert("request".to_string(), "hello".into());
        header.insert("id".to_string(), 7i64.into());

        let mut message = DataStreamDict::new();
        message.insert("name".to_string(), "accessory".into());

        let bytes = encode_payload(&header, &message).unwrap();
        let (decoded_header, decoded_message) = decode_payload(&bytes).unwrap();
        assert_eq!(decoded_header.get("request").and_then(DataStreamValue::as_str), Some("hello"));
        assert_eq!(decoded_header.get("id").and_then(DataStreamValue::as_int), Some(7));
        assert_eq!(
            decoded_message.get("name").and_then(DataStreamValue::as_str),
            Some("accessory")
        );
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut bytes = Vec::new();
        encode_value(&DataStreamValue::String("truncate me".to_string()), &mut bytes).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            decode_value(&bytes),
            Err(DataStreamParseError::UnexpectedEnd)
        ));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(matches!(
            decode_value(&[0xFF]),
            Err(DataStreamParseError::UnknownTag(0xFF))
        ));
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        assert!(matches!(
            decode_value(&[0x01, 0x01]),
            Err(DataStreamParseError::TrailingBytes)
        ));
    }
}
