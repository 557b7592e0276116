//! Reader/Writer capability consumed by generated code, plus byte-buffer implementations.
//!
//! Generated decoders are generic over [`Reader`] and encoders over [`Writer`]. Implementors only
//! supply raw byte access; every primitive (fixed-width integers with configurable endianness,
//! VarInt/VarLong, length-prefixed strings and byte arrays) is provided on top of that.

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Runtime decode failure raised by generated code and by the interpreter.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("IO: {0}")]
    Io(std::io::Error),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("malformed VarInt: more than {0} bytes")]
    MalformedVarInt(usize),
    #[error("negative length {0}")]
    NegativeLength(i64),
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("unknown id {id} for enum {ty}")]
    UnknownEnumId { ty: String, id: i128 },
    #[error("unknown tag {tag} for union {ty}")]
    UnknownTag { ty: String, tag: String },
    #[error("literal mismatch: expected {expected}, found {found}")]
    LiteralMismatch { expected: String, found: String },
    #[error("unknown packet id {id:#04x} in flow {flow}")]
    UnknownPacket { flow: String, id: i32 },
    #[error("transform {path} failed: {message}")]
    Transform { path: String, message: String },
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DecodeError::UnexpectedEof
        } else {
            DecodeError::Io(e)
        }
    }
}

/// Runtime encode failure raised by generated code and by the interpreter.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown name {name} for enum {ty}")]
    UnknownEnumName { ty: String, name: String },
    #[error("value matches no variant of {ty}")]
    UnmatchedVariant { ty: String },
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("length {0} does not fit the length prefix")]
    LengthOverflow(usize),
    #[error("transform {path} failed: {message}")]
    Transform { path: String, message: String },
}

const VARINT_MAX: usize = 5;
const VARLONG_MAX: usize = 10;

macro_rules! read_fixed {
    ($name:ident, $ty:ty, $n:expr, $read:ident) => {
        fn $name(&mut self) -> Result<$ty, DecodeError> {
            let mut buf = [0u8; $n];
            self.read_exact(&mut buf)?;
            Ok(match self.endianness() {
                Endianness::Big => BigEndian::$read(&buf),
                Endianness::Little => LittleEndian::$read(&buf),
            })
        }
    };
}

macro_rules! write_fixed {
    ($name:ident, $ty:ty, $n:expr, $write:ident) => {
        fn $name(&mut self, v: $ty) -> Result<(), EncodeError> {
            let mut buf = [0u8; $n];
            match self.endianness() {
                Endianness::Big => BigEndian::$write(&mut buf, v),
                Endianness::Little => LittleEndian::$write(&mut buf, v),
            }
            self.write_all(&buf)
        }
    };
}

/// Byte source for generated decoders.
pub trait Reader {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DecodeError>;

    /// Consume everything left in the current frame.
    fn read_rest(&mut self) -> Result<Vec<u8>, DecodeError>;

    fn endianness(&self) -> Endianness {
        Endianness::Big
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.read_u8()? as i8)
    }

    fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    read_fixed!(read_i16, i16, 2, read_i16);
    read_fixed!(read_u16, u16, 2, read_u16);
    read_fixed!(read_i32, i32, 4, read_i32);
    read_fixed!(read_u32, u32, 4, read_u32);
    read_fixed!(read_i64, i64, 8, read_i64);
    read_fixed!(read_u64, u64, 8, read_u64);
    read_fixed!(read_u128, u128, 16, read_u128);
    read_fixed!(read_f32, f32, 4, read_f32);
    read_fixed!(read_f64, f64, 8, read_f64);

    fn read_varint(&mut self) -> Result<i32, DecodeError> {
        let mut value: u32 = 0;
        for i in 0..VARINT_MAX {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(DecodeError::MalformedVarInt(VARINT_MAX))
    }

    fn read_varlong(&mut self) -> Result<i64, DecodeError> {
        let mut value: u64 = 0;
        for i in 0..VARLONG_MAX {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as i64);
            }
        }
        Err(DecodeError::MalformedVarInt(VARLONG_MAX))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_varint()?;
        if len < 0 {
            return Err(DecodeError::NegativeLength(len as i64));
        }
        self.read_fixed_bytes(len as usize)
    }

    fn read_fixed_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_bytes()?;
        Ok(String::from_utf8(bytes)?)
    }
}

/// Byte sink for generated encoders.
pub trait Writer {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), EncodeError>;

    fn endianness(&self) -> Endianness {
        Endianness::Big
    }

    fn write_u8(&mut self, v: u8) -> Result<(), EncodeError> {
        self.write_all(&[v])
    }

    fn write_i8(&mut self, v: i8) -> Result<(), EncodeError> {
        self.write_u8(v as u8)
    }

    fn write_bool(&mut self, v: bool) -> Result<(), EncodeError> {
        self.write_u8(v as u8)
    }

    write_fixed!(write_i16, i16, 2, write_i16);
    write_fixed!(write_u16, u16, 2, write_u16);
    write_fixed!(write_i32, i32, 4, write_i32);
    write_fixed!(write_u32, u32, 4, write_u32);
    write_fixed!(write_i64, i64, 8, write_i64);
    write_fixed!(write_u64, u64, 8, write_u64);
    write_fixed!(write_u128, u128, 16, write_u128);
    write_fixed!(write_f32, f32, 4, write_f32);
    write_fixed!(write_f64, f64, 8, write_f64);

    fn write_varint(&mut self, v: i32) -> Result<(), EncodeError> {
        let mut value = v as u32;
        loop {
            if value & !0x7f == 0 {
                return self.write_u8(value as u8);
            }
            self.write_u8((value & 0x7f) as u8 | 0x80)?;
            value >>= 7;
        }
    }

    fn write_varlong(&mut self, v: i64) -> Result<(), EncodeError> {
        let mut value = v as u64;
        loop {
            if value & !0x7f == 0 {
                return self.write_u8(value as u8);
            }
            self.write_u8((value & 0x7f) as u8 | 0x80)?;
            value >>= 7;
        }
    }

    fn write_bytes(&mut self, v: &[u8]) -> Result<(), EncodeError> {
        let len = i32::try_from(v.len()).map_err(|_| EncodeError::LengthOverflow(v.len()))?;
        self.write_varint(len)?;
        self.write_all(v)
    }

    fn write_fixed_bytes(&mut self, v: &[u8], len: usize) -> Result<(), EncodeError> {
        if v.len() != len {
            return Err(EncodeError::LengthMismatch { expected: len, actual: v.len() });
        }
        self.write_all(v)
    }

    fn write_rest(&mut self, v: &[u8]) -> Result<(), EncodeError> {
        self.write_all(v)
    }

    fn write_string(&mut self, v: &str) -> Result<(), EncodeError> {
        self.write_bytes(v.as_bytes())
    }
}

/// [`Reader`] over a byte slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    cursor: Cursor<&'a [u8]>,
    endianness: Endianness,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8], endianness: Endianness) -> Self {
        ByteReader { cursor: Cursor::new(bytes), endianness }
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }
}

impl Reader for ByteReader<'_> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DecodeError> {
        Read::read_exact(&mut self.cursor, buf)?;
        Ok(())
    }

    fn read_rest(&mut self) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::with_capacity(self.remaining());
        self.cursor.read_to_end(&mut out)?;
        Ok(out)
    }

    fn endianness(&self) -> Endianness {
        self.endianness
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(ReadBytesExt::read_u8(&mut self.cursor)?)
    }
}

/// [`Writer`] into a growable buffer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
    endianness: Endianness,
}

impl ByteWriter {
    pub fn new(endianness: Endianness) -> Self {
        ByteWriter { buf: Vec::new(), endianness }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Writer for ByteWriter {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), EncodeError> {
        Write::write_all(&mut self.buf, buf)?;
        Ok(())
    }

    fn endianness(&self) -> Endianness {
        self.endianness
    }

    fn write_u8(&mut self, v: u8) -> Result<(), EncodeError> {
        WriteBytesExt::write_u8(&mut self.buf, v)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for v in [0, 1, 127, 128, 255, 25565, 2097151, i32::MAX, -1, i32::MIN] {
            let mut w = ByteWriter::new(Endianness::Big);
            w.write_varint(v).expect("write");
            let bytes = w.into_inner();
            let mut r = ByteReader::new(&bytes, Endianness::Big);
            assert_eq!(r.read_varint().expect("read"), v);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn test_varint_known_encodings() {
        let mut w = ByteWriter::new(Endianness::Big);
        w.write_varint(300).expect("write");
        w.write_varint(-1).expect("write");
        assert_eq!(w.as_bytes(), &[0xac, 0x02, 0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn test_malformed_varint() {
        let bytes = [0xff; 6];
        let mut r = ByteReader::new(&bytes, Endianness::Big);
        assert!(matches!(r.read_varint(), Err(DecodeError::MalformedVarInt(5))));
    }

    #[test]
    fn test_endianness() {
        let mut big = ByteWriter::new(Endianness::Big);
        big.write_u16(0x0102).expect("write");
        let mut little = ByteWriter::new(Endianness::Little);
        little.write_u16(0x0102).expect("write");
        assert_eq!(big.as_bytes(), &[0x01, 0x02]);
        assert_eq!(little.as_bytes(), &[0x02, 0x01]);
    }

    #[test]
    fn test_eof_and_strings() {
        let mut w = ByteWriter::new(Endianness::Big);
        w.write_string("héllo").expect("write");
        let bytes = w.into_inner();
        let mut r = ByteReader::new(&bytes, Endianness::Big);
        assert_eq!(r.read_string().expect("read"), "héllo");
        assert!(matches!(r.read_u8(), Err(DecodeError::UnexpectedEof)));
    }

    #[test]
    fn test_fixed_bytes_length_checked() {
        let mut w = ByteWriter::new(Endianness::Big);
        assert!(matches!(
            w.write_fixed_bytes(&[1, 2, 3], 4),
            Err(EncodeError::LengthMismatch { expected: 4, actual: 3 })
        ));
    }
}
