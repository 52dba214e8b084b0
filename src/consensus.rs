// Copyright 2021-2022 Farcaster Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA


//! Consensus encoding of the protocol messages exchanged between the buyer and the seller.
//!
//! Integers are little-endian. Byte blobs and strings carry a `u32` length prefix and are bounded
//! by [`MAX_BLOB_LEN`], the counterparty is not trusted to send sane prefixes. Optional values are
//! prefixed by a one byte presence marker. [`impl_strict_encoding`] bridges any [`Encodable`] and
//! [`Decodable`] type to `strict_encoding` so messages can travel on strict-encoded transports.

use thiserror::Error;

use std::io::{self, Cursor, Read, Write};
use std::str;

/// Largest byte blob accepted when decoding, 1 MiB.
pub const MAX_BLOB_LEN: u32 = 1 << 20;

/// Encoding and decoding errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown tag or marker value.
    #[error("Unknown consensus type")]
    UnknownType,
    /// A length prefix above [`MAX_BLOB_LEN`].
    #[error("Blob of {0} bytes exceeds the 1 MiB limit")]
    TooLong(u32),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Bytes left over after decoding a complete value.
    #[error("Parsing error: {0}")]
    ParseFailed(&'static str),
    #[error("Invalid utf-8 string: {0}")]
    Utf8(#[from] str::Utf8Error),
}

/// Encode a value into a vector of bytes, [`deserialize`] reverses it.
pub fn serialize<T: Encodable + ?Sized>(data: &T) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    let written = data.consensus_encode(&mut buf)?;
    debug_assert_eq!(written, buf.len());
    Ok(buf)
}

/// Encode a value into a hex string, mostly useful in logs and tests.
pub fn serialize_hex<T: Encodable + ?Sized>(data: &T) -> Result<String, Error> {
    serialize(data).map(hex::encode)
}

/// Decode a value that must span all of `data`.
pub fn deserialize<T: Decodable>(data: &[u8]) -> Result<T, Error> {
    let mut cursor = Cursor::new(data);
    let value = T::consensus_decode(&mut cursor)?;
    if cursor.position() as usize != data.len() {
        return Err(Error::ParseFailed("trailing bytes after the encoded value"));
    }
    Ok(value)
}

/// Data with a well-defined wire format.
pub trait Encodable {
    /// Write the value and return the number of bytes written. Only fails if the writer fails.
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// Data which can be read back from its wire format.
pub trait Decodable: Sized {
    fn consensus_decode<R: Read>(reader: &mut R) -> Result<Self, Error>;
}

macro_rules! impl_le_integer {
    ($ty:ty, $size:expr) => {
        impl Encodable for $ty {
            #[inline]
            fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
                writer.write_all(&self.to_le_bytes()).map(|_| $size)
            }
        }

        impl Decodable for $ty {
            #[inline]
            fn consensus_decode<R: Read>(reader: &mut R) -> Result<Self, Error> {
                let mut bytes = [0u8; $size];
                reader.read_exact(&mut bytes)?;
                Ok(<$ty>::from_le_bytes(bytes))
            }
        }
    };
}

impl_le_integer!(u8, 1);
impl_le_integer!(u16, 2);
impl_le_integer!(u32, 4);
impl_le_integer!(u64, 8);

impl Encodable for [u8] {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let len = u32::try_from(self.len())
            .ok()
            .filter(|len| *len <= MAX_BLOB_LEN)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "blob too long"))?;
        len.consensus_encode(writer)?;
        writer.write_all(self)?;
        Ok(4 + self.len())
    }
}

impl Encodable for Vec<u8> {
    #[inline]
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_slice().consensus_encode(writer)
    }
}

impl Decodable for Vec<u8> {
    fn consensus_decode<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let len = u32::consensus_decode(reader)?;
        if len > MAX_BLOB_LEN {
            return Err(Error::TooLong(len));
        }
        let mut blob = vec![0u8; len as usize];
        reader.read_exact(&mut blob)?;
        Ok(blob)
    }
}

impl<T: Encodable> Encodable for Option<T> {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            None => 0u8.consensus_encode(writer),
            Some(value) => Ok(1u8.consensus_encode(writer)? + value.consensus_encode(writer)?),
        }
    }
}

impl<T: Decodable> Decodable for Option<T> {
    fn consensus_decode<R: Read>(reader: &mut R) -> Result<Self, Error> {
        match u8::consensus_decode(reader)? {
            0 => Ok(None),
            1 => T::consensus_decode(reader).map(Some),
            _ => Err(Error::UnknownType),
        }
    }
}

impl Encodable for String {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_bytes().consensus_encode(writer)
    }
}

impl Decodable for String {
    fn consensus_decode<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let bytes = Vec::<u8>::consensus_decode(reader)?;
        Ok(str::from_utf8(&bytes)?.to_owned())
    }
}

/// Implement `strict_encoding` for a type through its consensus encoding.
#[macro_export]
macro_rules! impl_strict_encoding {
    ($type:ty) => {
        impl strict_encoding::StrictEncode for $type {
            fn strict_encode<E: ::std::io::Write>(
                &self,
                mut e: E,
            ) -> Result<usize, strict_encoding::Error> {
                let written = $crate::consensus::Encodable::consensus_encode(self, &mut e)?;
                Ok(written)
            }
        }

        impl strict_encoding::StrictDecode for $type {
            fn strict_decode<D: ::std::io::Read>(mut d: D) -> Result<Self, strict_encoding::Error> {
                <$type as $crate::consensus::Decodable>::consensus_decode(&mut d)
                    .map_err(|err| strict_encoding::Error::DataIntegrityError(err.to_string()))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(serialize(&0xdeadbeefu32).unwrap(), vec![0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(deserialize::<u64>(&[0x40, 0x0d, 0x03, 0, 0, 0, 0, 0]).unwrap(), 200_000);
        assert_eq!(serialize_hex(&0x0102u16).unwrap(), "0201");
    }

    #[test]
    fn blobs_are_length_prefixed() {
        let blob: Vec<u8> = vec![0xde, 0xad, 0xbe, 0xef];
        assert_eq!(serialize_hex(&blob).unwrap(), "04000000deadbeef");
        // above the u16 range
        let blob = vec![0x41; u16::MAX as usize + 10];
        assert_eq!(deserialize::<Vec<u8>>(&serialize(&blob).unwrap()).unwrap(), blob);
        assert_eq!(
            deserialize::<String>(&hex::decode("03000000616263").unwrap()).unwrap(),
            "abc"
        );
    }

    #[test]
    fn oversized_prefix_is_rejected_before_reading() {
        let forged = (MAX_BLOB_LEN + 1).to_le_bytes();
        assert!(matches!(
            deserialize::<Vec<u8>>(&forged),
            Err(Error::TooLong(len)) if len == MAX_BLOB_LEN + 1
        ));
        assert!(matches!(
            deserialize::<String>(&hex::decode("02000000ff00").unwrap()),
            Err(Error::Utf8(_))
        ));
    }

    #[test]
    fn option_marker() {
        assert_eq!(serialize_hex(&Some(2u16)).unwrap(), "010200");
        assert_eq!(serialize_hex(&None::<u16>).unwrap(), "00");
        assert!(matches!(
            deserialize::<Option<u8>>(&[0x02, 0x00]),
            Err(Error::UnknownType)
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert!(matches!(
            deserialize::<u8>(&[0x01, 0x02]),
            Err(Error::ParseFailed(_))
        ));
    }
}
