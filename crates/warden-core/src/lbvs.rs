//! LBVS: the length/type/value record format shared by events and control payloads.
//!
//! A record is a packed little-endian header followed by self-describing fields:
//!
//! ```text
//! magic: u32 = "LBVS" | version: u8 | size: u32 (whole record) | count: u8
//! id: u16 | type: u8 | body ...   (repeated)
//! ```
//!
//! The field count is a wrapping `u8` and only informational; readers walk the
//! fields up to the declared size.

use thiserror::Error;

pub const LBVS_MAGIC: u32 = 0x5356_424C;
pub const LBVS_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 10;
const FIELD_HEADER_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Null = 0,
    String = 1,
    WString = 2,
    Stream = 3,
    Bool = 4,
    U32 = 5,
    U64 = 6,
    /// Zero-size marker opening a nested group (one rule in an update payload).
    SeqDict = 7,
    SeqSeq = 8,
}

impl FieldType {
    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Null,
            1 => Self::String,
            2 => Self::WString,
            3 => Self::Stream,
            4 => Self::Bool,
            5 => Self::U32,
            6 => Self::U64,
            7 => Self::SeqDict,
            8 => Self::SeqSeq,
            _ => return None,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Record shorter than header ({0} bytes)")]
    ShortHeader(usize),
    #[error("Bad magic: {0:#010x}")]
    BadMagic(u32),
    #[error("Declared size {declared} exceeds buffer of {available} bytes")]
    SizeOverflow { declared: usize, available: usize },
    #[error("Field {id} truncated at offset {offset}")]
    Truncated { id: u16, offset: usize },
    #[error("Field {id} has unsupported type {raw}")]
    UnsupportedType { id: u16, raw: u8 },
    #[error("Field {id}: stream of {len} bytes exceeds u16 length prefix")]
    StreamTooLong { id: u16, len: usize },
    #[error("Field {id}: string contains an embedded NUL")]
    EmbeddedNul { id: u16 },
    #[error("Field {id}: expected {expected}, found {found:?}")]
    TypeMismatch {
        id: u16,
        expected: &'static str,
        found: FieldType,
    },
    #[error("Record exceeds u32 size")]
    RecordTooLarge,
}

/// Builds one LBVS record. `finish` patches the size and count into the header.
#[derive(Debug, Clone)]
pub struct LbvsWriter {
    buf: Vec<u8>,
    count: u8,
}

impl Default for LbvsWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl LbvsWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity.max(HEADER_SIZE));
        buf.extend_from_slice(&LBVS_MAGIC.to_le_bytes());
        buf.push(LBVS_VERSION);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.push(0);
        Self { buf, count: 0 }
    }

    fn field_header(&mut self, id: u16, ty: FieldType) {
        self.buf.extend_from_slice(&id.to_le_bytes());
        self.buf.push(ty as u8);
        self.count = self.count.wrapping_add(1);
    }

    pub fn write_null(&mut self, id: impl Into<u16>) {
        self.field_header(id.into(), FieldType::Null);
    }

    pub fn write_str(&mut self, id: impl Into<u16>, value: &str) -> Result<(), CodecError> {
        let id = id.into();
        if value.as_bytes().contains(&0) {
            return Err(CodecError::EmbeddedNul { id });
        }
        self.field_header(id, FieldType::String);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub fn write_wstr(&mut self, id: impl Into<u16>, value: &str) -> Result<(), CodecError> {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.write_utf16(id, &units)
    }

    /// Writes raw UTF-16 units as a `WString`, appending the terminator.
    pub fn write_utf16(&mut self, id: impl Into<u16>, units: &[u16]) -> Result<(), CodecError> {
        let id = id.into();
        if units.contains(&0) {
            return Err(CodecError::EmbeddedNul { id });
        }
        self.field_header(id, FieldType::WString);
        for unit in units {
            self.buf.extend_from_slice(&unit.to_le_bytes());
        }
        self.buf.extend_from_slice(&[0, 0]);
        Ok(())
    }

    pub fn write_stream(&mut self, id: impl Into<u16>, bytes: &[u8]) -> Result<(), CodecError> {
        let id = id.into();
        let len = u16::try_from(bytes.len())
            .map_err(|_| CodecError::StreamTooLong { id, len: bytes.len() })?;
        self.field_header(id, FieldType::Stream);
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_bool(&mut self, id: impl Into<u16>, value: bool) {
        self.field_header(id.into(), FieldType::Bool);
        self.buf.push(u8::from(value));
    }

    pub fn write_u32(&mut self, id: impl Into<u16>, value: u32) {
        self.field_header(id.into(), FieldType::U32);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, id: impl Into<u16>, value: u64) {
        self.field_header(id.into(), FieldType::U64);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn begin_group(&mut self, id: impl Into<u16>) {
        self.field_header(id.into(), FieldType::SeqDict);
    }

    /// Bytes of every field written so far, without the header.
    pub fn field_bytes(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_SIZE
    }

    pub fn finish(mut self) -> Result<Vec<u8>, CodecError> {
        let size = u32::try_from(self.buf.len()).map_err(|_| CodecError::RecordTooLarge)?;
        self.buf[5..9].copy_from_slice(&size.to_le_bytes());
        self.buf[9] = self.count;
        Ok(self.buf)
    }
}

/// A decoded field value borrowing from the record buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    Null,
    /// UTF-8 bytes without the terminator.
    Str(&'a [u8]),
    /// UTF-16LE bytes without the terminator.
    WStr(&'a [u8]),
    Stream(&'a [u8]),
    Bool(bool),
    U32(u32),
    U64(u64),
    Group,
}

impl Value<'_> {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Null => FieldType::Null,
            Value::Str(_) => FieldType::String,
            Value::WStr(_) => FieldType::WString,
            Value::Stream(_) => FieldType::Stream,
            Value::Bool(_) => FieldType::Bool,
            Value::U32(_) => FieldType::U32,
            Value::U64(_) => FieldType::U64,
            Value::Group => FieldType::SeqDict,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub id: u16,
    pub value: Value<'a>,
}

impl<'a> Field<'a> {
    fn mismatch(&self, expected: &'static str) -> CodecError {
        CodecError::TypeMismatch {
            id: self.id,
            expected,
            found: self.value.field_type(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.value, Value::Group)
    }

    pub fn as_u64(&self) -> Result<u64, CodecError> {
        match self.value {
            Value::U32(v) => Ok(u64::from(v)),
            Value::U64(v) => Ok(v),
            _ => Err(self.mismatch("integer")),
        }
    }

    /// Truncates a `U64` value.
    pub fn as_u32(&self) -> Result<u32, CodecError> {
        match self.value {
            Value::U32(v) => Ok(v),
            Value::U64(v) => Ok(v as u32),
            _ => Err(self.mismatch("integer")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, CodecError> {
        match self.value {
            Value::Bool(v) => Ok(v),
            Value::U32(v) => Ok(v != 0),
            Value::U64(v) => Ok(v != 0),
            _ => Err(self.mismatch("bool")),
        }
    }

    pub fn as_string(&self) -> Result<String, CodecError> {
        match self.value {
            Value::Str(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            Value::WStr(bytes) => Ok(decode_utf16le(bytes)),
            _ => Err(self.mismatch("string")),
        }
    }

    pub fn as_stream(&self) -> Result<&'a [u8], CodecError> {
        match self.value {
            Value::Stream(bytes) => Ok(bytes),
            _ => Err(self.mismatch("stream")),
        }
    }
}

pub(crate) fn decode_utf16le(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Validated view over one record.
#[derive(Debug, Clone, Copy)]
pub struct LbvsReader<'a> {
    record: &'a [u8],
    count: u8,
}

impl<'a> LbvsReader<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::ShortHeader(buf.len()));
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != LBVS_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let declared = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if declared > buf.len() {
            return Err(CodecError::SizeOverflow {
                declared,
                available: buf.len(),
            });
        }
        if declared < HEADER_SIZE {
            return Err(CodecError::ShortHeader(declared));
        }
        Ok(Self {
            record: &buf[..declared],
            count: buf[9],
        })
    }

    /// Reads the declared total size from a header prefix, for stream framing.
    pub fn peek_size(header: &[u8]) -> Result<usize, CodecError> {
        if header.len() < HEADER_SIZE {
            return Err(CodecError::ShortHeader(header.len()));
        }
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != LBVS_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        Ok(u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize)
    }

    pub fn declared_count(&self) -> u8 {
        self.count
    }

    pub fn size(&self) -> usize {
        self.record.len()
    }

    pub fn fields(&self) -> Fields<'a> {
        Fields {
            record: self.record,
            pos: HEADER_SIZE,
            failed: false,
        }
    }

    /// Decodes every field, failing on the first malformed one.
    pub fn collect(&self) -> Result<Vec<Field<'a>>, CodecError> {
        self.fields().collect()
    }
}

/// Iterator over the fields of a record. Stops after the first error.
pub struct Fields<'a> {
    record: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Fields<'a> {
    fn take(&mut self, id: u16, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.record.len())
            .ok_or(CodecError::Truncated { id, offset: self.pos })?;
        let slice = &self.record[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_terminated(&mut self, id: u16, unit: usize) -> Result<&'a [u8], CodecError> {
        let rest = &self.record[self.pos..];
        let end = rest
            .chunks_exact(unit)
            .position(|c| c.iter().all(|b| *b == 0))
            .ok_or(CodecError::Truncated { id, offset: self.pos })?
            * unit;
        let body = &rest[..end];
        self.pos += end + unit;
        Ok(body)
    }

    fn next_field(&mut self) -> Result<Field<'a>, CodecError> {
        let header = self.take(u16::MAX, FIELD_HEADER_SIZE)?;
        let id = u16::from_le_bytes([header[0], header[1]]);
        let raw = header[2];
        let ty = FieldType::from_raw(raw).ok_or(CodecError::UnsupportedType { id, raw })?;
        let value = match ty {
            FieldType::Null => Value::Null,
            FieldType::String => Value::Str(self.take_terminated(id, 1)?),
            FieldType::WString => Value::WStr(self.take_terminated(id, 2)?),
            FieldType::Stream => {
                let len = self.take(id, 2)?;
                let len = u16::from_le_bytes([len[0], len[1]]) as usize;
                Value::Stream(self.take(id, len)?)
            }
            FieldType::Bool => Value::Bool(self.take(id, 1)?[0] != 0),
            FieldType::U32 => {
                let b = self.take(id, 4)?;
                Value::U32(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            FieldType::U64 => {
                let b = self.take(id, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Value::U64(u64::from_le_bytes(raw))
            }
            FieldType::SeqDict => Value::Group,
            FieldType::SeqSeq => return Err(CodecError::UnsupportedType { id, raw }),
        };
        Ok(Field { id, value })
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<Field<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.record.len() {
            return None;
        }
        let item = self.next_field();
        self.failed = item.is_err();
        Some(item)
    }
}
