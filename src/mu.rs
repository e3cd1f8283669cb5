//! TPM wire-format marshalling.
//!
//! Everything is big-endian. Sized buffers carry a `u16` length prefix and
//! lists a `u32` element count, the same layout the TPM uses for its
//! `TPM2B_*` and `TPML_*` structures. Unmarshalling never panics and never
//! reads past the end of the input; failures record the chain of
//! `Type.field` frames that were being decoded so a corrupt key file can be
//! pinned down to the nested field that is broken.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A size or count prefix is larger than the bytes left in the buffer.
    SizeTooLarge,
    /// The buffer ended in the middle of a fixed size value.
    UnexpectedEof,
    /// The value was read but isn't valid for the type.
    InvalidValue(&'static str),
    /// Bytes remained after the top level value was decoded.
    TrailingBytes,
    /// A value is too large to be marshalled with a `u16` size prefix.
    Overflow,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SizeTooLarge => {
                f.write_str("sized value has a size larger than the remaining bytes")
            }
            ErrorKind::UnexpectedEof => f.write_str("unexpected end of data"),
            ErrorKind::InvalidValue(why) => write!(f, "invalid value ({})", why),
            ErrorKind::TrailingBytes => f.write_str("trailing bytes after value"),
            ErrorKind::Overflow => f.write_str("value is too large for its size field"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    ty: &'static str,
    field: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    ty: &'static str,
    kind: ErrorKind,
    // innermost frame first
    stack: Vec<Frame>,
}

impl Error {
    pub fn new(ty: &'static str, kind: ErrorKind) -> Self {
        Self {
            ty,
            kind,
            stack: Vec::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The name of the type whose decoding failed.
    pub fn type_name(&self) -> &'static str {
        self.ty
    }

    /// Field path from the outermost structure, e.g.
    /// `KeyDataV2.static_policy_data.auth_public_key.auth_policy`.
    pub fn path(&self) -> Option<String> {
        let outer = self.stack.last()?;
        let fields = self
            .stack
            .iter()
            .rev()
            .map(|f| f.field)
            .collect::<Vec<_>>()
            .join(".");
        Some(format!("{}.{}", outer.ty, fields))
    }

    fn within(mut self, ty: &'static str, field: &'static str) -> Self {
        self.stack.push(Frame { ty, field });
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path() {
            Some(path) => write!(f, "cannot unmarshal {} in {}: {}", self.ty, path, self.kind),
            None => write!(f, "cannot unmarshal {}: {}", self.ty, self.kind),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T, E = Error> = core::result::Result<T, E>;

pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, ty: &'static str, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::new(ty, ErrorKind::UnexpectedEof));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self, ty: &'static str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(ty, N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>("u8")?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array("u16")?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array("u32")?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array("u64")?))
    }

    /// Reads a `u16` size prefixed buffer on behalf of `ty`.
    pub fn read_sized(&mut self, ty: &'static str) -> Result<&'a [u8]> {
        let size = self.read_u16().map_err(|e| Error::new(ty, e.kind))? as usize;
        if size > self.buf.len() {
            return Err(Error::new(ty, ErrorKind::SizeTooLarge));
        }
        self.take(ty, size)
    }

    /// Reads the remaining input as raw bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    /// Runs `f`, attributing any error to `field` of `ty`.
    pub fn field<T, F>(&mut self, ty: &'static str, field: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        f(self).map_err(|e| e.within(ty, field))
    }

    /// Unmarshals a `T` as `field` of `ty`.
    pub fn read_field<T: Unmarshal>(&mut self, ty: &'static str, field: &'static str) -> Result<T> {
        self.field(ty, field, T::unmarshal)
    }
}

#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
    overflow: Option<&'static str>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Writes `v` with a `u16` size prefix. Oversized values poison the
    /// writer, which is reported by [`Writer::into_bytes`].
    pub fn write_sized(&mut self, ty: &'static str, v: &[u8]) {
        match u16::try_from(v.len()) {
            Ok(len) => {
                self.write_u16(len);
                self.write_raw(v);
            }
            Err(_) => {
                self.overflow.get_or_insert(ty);
            }
        }
    }

    /// Marshals `v` into a nested buffer and writes it with a `u16` size prefix.
    pub fn write_sized_value<T: Marshal + ?Sized>(&mut self, ty: &'static str, v: &T) {
        let mut inner = Writer::new();
        v.marshal(&mut inner);
        if let Some(ty) = inner.overflow {
            self.overflow.get_or_insert(ty);
            return;
        }
        self.write_sized(ty, &inner.buf);
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.overflow {
            Some(ty) => Err(Error::new(ty, ErrorKind::Overflow)),
            None => Ok(self.buf),
        }
    }
}

pub trait Marshal {
    fn marshal(&self, w: &mut Writer);
}

pub trait Unmarshal: Sized {
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self>;
}

pub fn marshal_to_vec<T: Marshal + ?Sized>(v: &T) -> Result<Vec<u8>> {
    let mut w = Writer::new();
    v.marshal(&mut w);
    w.into_bytes()
}

/// Unmarshals a `T` that must consume all of `buf`.
pub fn unmarshal_from_bytes<T: Unmarshal>(ty: &'static str, buf: &[u8]) -> Result<T> {
    let mut r = Reader::new(buf);
    let v = T::unmarshal(&mut r)?;
    if !r.is_empty() {
        return Err(Error::new(ty, ErrorKind::TrailingBytes));
    }
    Ok(v)
}

macro_rules! impl_int {
    ($t:ty, $read:ident, $write:ident) => {
        impl Marshal for $t {
            fn marshal(&self, w: &mut Writer) {
                w.$write(*self)
            }
        }
        impl Unmarshal for $t {
            fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
                r.$read()
            }
        }
    };
}

impl_int!(u8, read_u8, write_u8);
impl_int!(u16, read_u16, write_u16);
impl_int!(u32, read_u32, write_u32);
impl_int!(u64, read_u64, write_u64);

impl<T: Marshal> Marshal for Vec<T> {
    fn marshal(&self, w: &mut Writer) {
        // lists longer than u32::MAX can't be built in memory anyway
        w.write_u32(self.len() as u32);
        for v in self {
            v.marshal(w);
        }
    }
}

impl<T: Unmarshal> Unmarshal for Vec<T> {
    fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
        let count = r.read_u32().map_err(|e| Error::new("list", e.kind))? as usize;
        // every element occupies at least one byte
        if count > r.remaining() {
            return Err(Error::new("list", ErrorKind::SizeTooLarge));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(T::unmarshal(r)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inner {
        value: Vec<u8>,
    }

    impl Unmarshal for Inner {
        fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
            let value = r.field("Inner", "value", |r| Ok(r.read_sized("Buffer")?.to_vec()))?;
            Ok(Self { value })
        }
    }

    struct Outer {
        _a: u32,
        inner: Inner,
    }

    impl Unmarshal for Outer {
        fn unmarshal(r: &mut Reader<'_>) -> Result<Self> {
            Ok(Self {
                _a: r.read_field("Outer", "a")?,
                inner: r.read_field("Outer", "inner")?,
            })
        }
    }

    #[test]
    fn sized_value_larger_than_buffer() {
        let buf = [0, 0, 0, 1, 0, 10, 1, 2];
        let err = unmarshal_from_bytes::<Outer>("Outer", &buf)
            .err()
            .expect("decoding should fail");
        assert_eq!(err.kind(), ErrorKind::SizeTooLarge);
        assert_eq!(err.type_name(), "Buffer");
        assert_eq!(err.path().as_deref(), Some("Outer.inner.value"));
        assert_eq!(
            err.to_string(),
            "cannot unmarshal Buffer in Outer.inner.value: sized value has a size larger than the remaining bytes"
        );
    }

    #[test]
    fn truncated_integer() {
        let err = unmarshal_from_bytes::<Outer>("Outer", &[0, 0])
            .err()
            .expect("decoding should fail");
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        assert_eq!(err.path().as_deref(), Some("Outer.a"));
    }

    #[test]
    fn trailing_bytes() {
        let err = unmarshal_from_bytes::<Outer>("Outer", &[0, 0, 0, 1, 0, 1, 7, 9])
            .err()
            .expect("decoding should fail");
        assert_eq!(err.kind(), ErrorKind::TrailingBytes);
        assert_eq!(err.path(), None);
    }

    #[test]
    fn decodes_nested_value() -> Result<()> {
        let outer = unmarshal_from_bytes::<Outer>("Outer", &[0, 0, 0, 1, 0, 2, 7, 9])?;
        assert_eq!(outer.inner.value, vec![7, 9]);
        Ok(())
    }

    #[test]
    fn oversized_write_is_reported() {
        let mut w = Writer::new();
        w.write_sized("Buffer", &vec![0u8; 70000]);
        assert_eq!(
            w.into_bytes().err().map(|e| e.kind()),
            Some(ErrorKind::Overflow)
        );
    }

    #[test]
    fn list_count_is_bounded_by_input() {
        let err = unmarshal_from_bytes::<Vec<u32>>("list", &[0xff, 0xff, 0xff, 0xff, 0])
            .err()
            .expect("decoding should fail");
        assert_eq!(err.kind(), ErrorKind::SizeTooLarge);
    }
}
