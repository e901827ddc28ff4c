//! Plaintext wire codec.
//!
//! Every field is rendered as a run of bytes terminated by `;`, with `\`
//! escaping `;` and `\` inside the run.  Integers are decimal ASCII, bools
//! are `0`/`1`, collections are u32-length-prefixed, optionals are a
//! presence flag followed by the payload.  Decoding is strict: a field that
//! does not parse exactly, or does not fit its width, is an error, and the
//! outermost value must consume the whole input.
//!
//! The same codec frames datagrams (prefixed by [`crate::WIRE_MAGIC`]) and
//! the persisted server snapshot.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Decoding failure.  Encoding is infallible.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The datagram does not begin with the magic number; silently dropped
    /// by recipients.
    #[error("message does not carry the magic number and is not recognized")]
    OutOfProtocol,
    /// Input ended in the middle of a field.
    #[error("unexpected end of input during deserialization")]
    UnexpectedEof,
    /// Input continued after the outermost value was fully decoded.
    #[error("expected end of input during deserialization but got more data")]
    ExpectedEof,
    /// A numeric field did not parse, or did not fit its width.
    #[error("found invalid integer '{content}' for type {ty}")]
    InvalidInt { ty: &'static str, content: String },
    /// A structurally valid field violated a domain rule (bad tag code,
    /// bad username, ...).
    #[error("{0}")]
    InvalidValue(String),
}

/// Types that can be written to the wire.
pub trait WireEncode {
    fn encode(&self, w: &mut WireWriter);
}

/// Types that can be read back from the wire.
pub trait WireDecode: Sized {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError>;
}

/// Encode a value into a fresh buffer.
pub fn to_bytes<T: WireEncode>(value: &T) -> Vec<u8> {
    let mut w = WireWriter::new();
    value.encode(&mut w);
    w.finish()
}

/// Decode a value from a buffer, requiring the buffer to be fully consumed.
pub fn from_bytes<T: WireDecode>(bytes: &[u8]) -> Result<T, WireError> {
    let mut r = WireReader::new(bytes);
    let value = T::decode(&mut r)?;
    r.ensure_eof()?;
    Ok(value)
}

// ---------------------------------------------------------------------------
// WireWriter
// ---------------------------------------------------------------------------

/// Accumulates encoded fields into a byte buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        WireWriter::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Write one field: escape `;` and `\`, then terminate with `;`.
    pub fn put_str(&mut self, data: &str) {
        for byte in data.bytes() {
            if byte == b';' || byte == b'\\' {
                self.buf.push(b'\\');
            }
            self.buf.push(byte);
        }
        self.buf.push(b';');
    }

    pub fn put_bool(&mut self, data: bool) {
        self.put_str(if data { "1" } else { "0" });
    }

    pub fn put_u8(&mut self, data: u8) {
        self.put_str(&data.to_string());
    }

    pub fn put_u16(&mut self, data: u16) {
        self.put_str(&data.to_string());
    }

    pub fn put_u32(&mut self, data: u32) {
        self.put_str(&data.to_string());
    }

    pub fn put_u64(&mut self, data: u64) {
        self.put_str(&data.to_string());
    }

    pub fn put_i8(&mut self, data: i8) {
        self.put_str(&data.to_string());
    }

    pub fn put_i16(&mut self, data: i16) {
        self.put_str(&data.to_string());
    }

    pub fn put_i32(&mut self, data: i32) {
        self.put_str(&data.to_string());
    }

    pub fn put_i64(&mut self, data: i64) {
        self.put_str(&data.to_string());
    }
}

// ---------------------------------------------------------------------------
// WireReader
// ---------------------------------------------------------------------------

/// Consumes encoded fields from a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        WireReader { bytes, pos: 0 }
    }

    /// Fails with `ExpectedEof` if any input remains.
    pub fn ensure_eof(&self) -> Result<(), WireError> {
        if self.pos < self.bytes.len() {
            return Err(WireError::ExpectedEof);
        }
        Ok(())
    }

    /// Read one unescaped field up to its `;` terminator.
    fn take_field(&mut self) -> Result<Vec<u8>, WireError> {
        let mut field = Vec::new();
        loop {
            let Some(&byte) = self.bytes.get(self.pos) else {
                return Err(WireError::UnexpectedEof);
            };
            self.pos += 1;
            match byte {
                b';' => return Ok(field),
                b'\\' => {
                    let Some(&escaped) = self.bytes.get(self.pos) else {
                        return Err(WireError::UnexpectedEof);
                    };
                    self.pos += 1;
                    field.push(escaped);
                }
                other => field.push(other),
            }
        }
    }

    pub fn take_string(&mut self) -> Result<String, WireError> {
        let field = self.take_field()?;
        String::from_utf8(field)
            .map_err(|_| WireError::InvalidValue("field is not valid UTF-8".to_owned()))
    }

    pub fn take_bool(&mut self) -> Result<bool, WireError> {
        let field = self.take_field()?;
        match field.as_slice() {
            b"0" => Ok(false),
            b"1" => Ok(true),
            other => Err(WireError::InvalidInt {
                ty: "bool",
                content: String::from_utf8_lossy(other).into_owned(),
            }),
        }
    }

    pub fn take_u64(&mut self) -> Result<u64, WireError> {
        let field = self.take_field()?;
        parse_int::<u64>(&field, "uint64")
    }

    pub fn take_u32(&mut self) -> Result<u32, WireError> {
        let field = self.take_field()?;
        parse_int::<u32>(&field, "uint32")
    }

    pub fn take_u16(&mut self) -> Result<u16, WireError> {
        let field = self.take_field()?;
        parse_int::<u16>(&field, "uint16")
    }

    pub fn take_u8(&mut self) -> Result<u8, WireError> {
        let field = self.take_field()?;
        parse_int::<u8>(&field, "uint8")
    }

    pub fn take_i64(&mut self) -> Result<i64, WireError> {
        let field = self.take_field()?;
        parse_int::<i64>(&field, "int64")
    }

    pub fn take_i32(&mut self) -> Result<i32, WireError> {
        let field = self.take_field()?;
        parse_int::<i32>(&field, "int32")
    }

    pub fn take_i16(&mut self) -> Result<i16, WireError> {
        let field = self.take_field()?;
        parse_int::<i16>(&field, "int16")
    }

    pub fn take_i8(&mut self) -> Result<i8, WireError> {
        let field = self.take_field()?;
        parse_int::<i8>(&field, "int8")
    }
}

fn parse_int<T: std::str::FromStr>(field: &[u8], ty: &'static str) -> Result<T, WireError> {
    let invalid = || WireError::InvalidInt {
        ty,
        content: String::from_utf8_lossy(field).into_owned(),
    };
    let text = std::str::from_utf8(field).map_err(|_| invalid())?;
    if text.is_empty() {
        return Err(invalid());
    }
    text.parse().map_err(|_| invalid())
}

// ---------------------------------------------------------------------------
// Blanket impls for primitives and containers
// ---------------------------------------------------------------------------

macro_rules! impl_wire_scalar {
    ($($ty:ty => $put:ident, $take:ident;)*) => {
        $(
            impl WireEncode for $ty {
                fn encode(&self, w: &mut WireWriter) {
                    w.$put(*self);
                }
            }

            impl WireDecode for $ty {
                fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
                    r.$take()
                }
            }
        )*
    };
}

impl_wire_scalar! {
    bool => put_bool, take_bool;
    u8 => put_u8, take_u8;
    u16 => put_u16, take_u16;
    u32 => put_u32, take_u32;
    u64 => put_u64, take_u64;
    i8 => put_i8, take_i8;
    i16 => put_i16, take_i16;
    i32 => put_i32, take_i32;
    i64 => put_i64, take_i64;
}

impl WireEncode for String {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(self);
    }
}

impl WireDecode for String {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.take_string()
    }
}

impl WireEncode for &str {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(self);
    }
}

fn encode_seq<'i, T: WireEncode + 'i>(
    len: usize,
    items: impl Iterator<Item = &'i T>,
    w: &mut WireWriter,
) {
    w.put_u32(len as u32);
    for item in items {
        item.encode(w);
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, w: &mut WireWriter) {
        encode_seq(self.len(), self.iter(), w);
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let len = r.take_u32()?;
        let mut items = Vec::new();
        for _ in 0..len {
            items.push(T::decode(r)?);
        }
        Ok(items)
    }
}

impl<T: WireEncode> WireEncode for VecDeque<T> {
    fn encode(&self, w: &mut WireWriter) {
        encode_seq(self.len(), self.iter(), w);
    }
}

impl<T: WireDecode> WireDecode for VecDeque<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Vec::<T>::decode(r)?.into())
    }
}

impl<T: WireEncode> WireEncode for BTreeSet<T> {
    fn encode(&self, w: &mut WireWriter) {
        encode_seq(self.len(), self.iter(), w);
    }
}

impl<T: WireDecode + Ord> WireDecode for BTreeSet<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let len = r.take_u32()?;
        let mut items = BTreeSet::new();
        for _ in 0..len {
            items.insert(T::decode(r)?);
        }
        Ok(items)
    }
}

impl<K: WireEncode, V: WireEncode> WireEncode for BTreeMap<K, V> {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.len() as u32);
        for (key, value) in self {
            key.encode(w);
            value.encode(w);
        }
    }
}

impl<K: WireDecode + Ord, V: WireDecode> WireDecode for BTreeMap<K, V> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let len = r.take_u32()?;
        let mut items = BTreeMap::new();
        for _ in 0..len {
            let key = K::decode(r)?;
            let value = V::decode(r)?;
            items.insert(key, value);
        }
        Ok(items)
    }
}

impl<T: WireEncode> WireEncode for Option<T> {
    fn encode(&self, w: &mut WireWriter) {
        match self {
            Some(value) => {
                w.put_bool(true);
                value.encode(w);
            }
            None => w.put_bool(false),
        }
    }
}

impl<T: WireDecode> WireDecode for Option<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        if r.take_bool()? {
            Ok(Some(T::decode(r)?))
        } else {
            Ok(None)
        }
    }
}

impl<A: WireEncode, B: WireEncode> WireEncode for (A, B) {
    fn encode(&self, w: &mut WireWriter) {
        self.0.encode(w);
        self.1.encode(w);
    }
}

impl<A: WireDecode, B: WireDecode> WireDecode for (A, B) {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let a = A::decode(r)?;
        let b = B::decode(r)?;
        Ok((a, b))
    }
}
