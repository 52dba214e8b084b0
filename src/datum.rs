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


//! Datum are the opaque pieces of cryptographic material produced by a signer and forwarded
//! verbatim between peers: key shares, nonce shares, partial signatures, PSBTs and raw
//! transactions. The library never interprets their content, it only moves them between rounds.

use bitcoin::hashes::Hash;
use bitcoin::Txid;

use std::fmt;
use std::io;

use crate::consensus::{self, Decodable, Encodable};

macro_rules! impl_datum {
    ( $(#[$doc:meta])* $name:ident ) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Vec<u8>);

        impl $name {
            pub fn new(bytes: Vec<u8>) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn into_bytes(self) -> Vec<u8> {
                self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                Self(bytes)
            }
        }

        impl Encodable for $name {
            fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
                self.0.consensus_encode(s)
            }
        }

        impl Decodable for $name {
            fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
                Ok(Self(Decodable::consensus_decode(d)?))
            }
        }

        impl_strict_encoding!($name);
    };
}

macro_rules! impl_hex_fmt {
    ( $name:ident ) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&hex::encode(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0))
            }
        }
    };
}

impl_datum!(
    /// A public-key share of one of the two 2-of-2 trade outputs.
    PubKeyShare
);
impl_hex_fmt!(PubKeyShare);

impl_datum!(
    /// A public nonce share committing to the nonce used in a later partial signature.
    NonceShare
);
impl_hex_fmt!(NonceShare);

impl_datum!(
    /// One party's contribution to a joint MuSig signature on a transaction input.
    PartialSignature
);
impl_hex_fmt!(PartialSignature);

impl_datum!(
    /// A serialized partially signed bitcoin transaction.
    Psbt
);
impl_hex_fmt!(Psbt);

impl_datum!(
    /// A fully serialized bitcoin transaction.
    RawTx
);
impl_hex_fmt!(RawTx);

impl_datum!(
    /// A private-key share of a trade output. Revealing it to the peer hands over full control
    /// of that output, its content is never printed.
    PrvKeyShare
);

impl fmt::Display for PrvKeyShare {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl fmt::Debug for PrvKeyShare {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PrvKeyShare(<{} bytes>)", self.0.len())
    }
}

impl RawTx {
    /// Double SHA-256 of the raw bytes, the transaction id for a serialization without witness.
    pub fn txid(&self) -> Txid {
        Txid::hash(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{deserialize, serialize_hex};

    #[test]
    fn private_shares_are_never_printed() {
        let share = PrvKeyShare::new(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(format!("{}", share), "<redacted>");
        assert_eq!(format!("{:?}", share), "PrvKeyShare(<4 bytes>)");
        let nonce = NonceShare::new(vec![0xab]);
        assert_eq!(format!("{:?}", nonce), "NonceShare(ab)");
    }

    #[test]
    fn datum_encoding_is_length_prefixed() {
        let sig = PartialSignature::new(vec![0x01, 0x02]);
        assert_eq!(serialize_hex(&sig).unwrap(), "020000000102");
        assert_eq!(
            deserialize::<PartialSignature>(&hex::decode("020000000102").unwrap()).unwrap(),
            sig
        );
    }

    #[test]
    fn txid_of_raw_tx() {
        let tx = RawTx::new(b"deposit".to_vec());
        assert_eq!(tx.txid(), RawTx::new(b"deposit".to_vec()).txid());
        assert_ne!(tx.txid(), RawTx::new(b"swap".to_vec()).txid());
    }
}
