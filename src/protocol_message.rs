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


//! Protocol messages exchanged between the buyer and the seller, labelled A to G.
//!
//! | Label | Direction | Content |
//! |-------|-----------|---------|
//! | A | buyer → seller | buyer's public-key shares |
//! | B | seller → buyer | seller's public-key shares and nonce shares |
//! | C | buyer → seller | buyer's nonce shares and **redacted** partial signatures |
//! | D | seller → buyer | seller's partial signatures |
//! | E | buyer → seller | buyer's withheld swap transaction partial signature |
//! | F | seller → buyer | seller's share of the buyer's output private key |
//! | G | buyer → seller | buyer's share of the seller's output private key |
//!
//! Messages A to E are required for the trade to complete, F and G may never arrive.

use std::io;

use crate::bundle::{NonceShareSet, PartialSignatureSet, PubKeyShareSet, RedactedPartialSignatureSet};
use crate::consensus::{self, Decodable, Encodable};
use crate::datum::{PartialSignature, PrvKeyShare};
use crate::{Error, Res};

/// Label of a protocol message.
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[display(Debug)]
pub enum MessageLabel {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
}

impl MessageLabel {
    /// Return `true` for the cooperative closure messages whose absence is tolerated.
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::F | Self::G)
    }

    fn tag(&self) -> u8 {
        match self {
            Self::A => 0x01,
            Self::B => 0x02,
            Self::C => 0x03,
            Self::D => 0x04,
            Self::E => 0x05,
            Self::F => 0x06,
            Self::G => 0x07,
        }
    }
}

/// Message A.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKeyShares {
    pub pub_key_shares: PubKeyShareSet,
}

/// Message B.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceShares {
    pub pub_key_shares: PubKeyShareSet,
    pub nonce_shares: NonceShareSet,
}

/// Message C. The partial signatures can only be carried redacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignatures {
    pub nonce_shares: NonceShareSet,
    pub partial_signatures: RedactedPartialSignatureSet,
}

/// Message D.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositSignatures {
    pub partial_signatures: PartialSignatureSet,
}

/// Message E, releasing the swap share withheld from message C.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTxSignature {
    pub swap_tx_input_partial_signature: PartialSignature,
}

/// Messages F and G.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseTrade {
    pub peer_output_prv_key_share: PrvKeyShare,
}

/// A protocol message as carried by a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    A(PubKeyShares),
    B(NonceShares),
    C(PartialSignatures),
    D(DepositSignatures),
    E(SwapTxSignature),
    F(CloseTrade),
    G(CloseTrade),
}

impl PeerMessage {
    pub fn label(&self) -> MessageLabel {
        match self {
            Self::A(_) => MessageLabel::A,
            Self::B(_) => MessageLabel::B,
            Self::C(_) => MessageLabel::C,
            Self::D(_) => MessageLabel::D,
            Self::E(_) => MessageLabel::E,
            Self::F(_) => MessageLabel::F,
            Self::G(_) => MessageLabel::G,
        }
    }

    /// Build message C. The buyer's signatures are always redacted here, whatever the closure
    /// eventually turns out to be.
    pub fn partial_signatures(
        nonce_shares: NonceShareSet,
        partial_signatures: &PartialSignatureSet,
    ) -> Self {
        Self::C(PartialSignatures {
            nonce_shares,
            partial_signatures: partial_signatures.redact(),
        })
    }

    /// Build message E from the buyer's full signature set, releasing the withheld share.
    pub fn swap_tx_signature(partial_signatures: &PartialSignatureSet) -> Res<Self> {
        match &partial_signatures.swap_tx_input_partial_signature {
            Some(sig) if !sig.is_empty() => Ok(Self::E(SwapTxSignature {
                swap_tx_input_partial_signature: sig.clone(),
            })),
            _ => Err(Error::Signer(crate::signer::Error::InvalidRequest(
                "no swap tx partial signature to release".to_string(),
            ))),
        }
    }
}

impl Encodable for PeerMessage {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let len = self.label().tag().consensus_encode(s)?;
        Ok(len
            + match self {
                Self::A(m) => m.pub_key_shares.consensus_encode(s)?,
                Self::B(m) => {
                    m.pub_key_shares.consensus_encode(s)? + m.nonce_shares.consensus_encode(s)?
                }
                Self::C(m) => {
                    m.nonce_shares.consensus_encode(s)?
                        + m.partial_signatures.consensus_encode(s)?
                }
                Self::D(m) => m.partial_signatures.consensus_encode(s)?,
                Self::E(m) => m.swap_tx_input_partial_signature.consensus_encode(s)?,
                Self::F(m) | Self::G(m) => m.peer_output_prv_key_share.consensus_encode(s)?,
            })
    }
}

impl Decodable for PeerMessage {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match u8::consensus_decode(d)? {
            0x01u8 => Ok(Self::A(PubKeyShares {
                pub_key_shares: Decodable::consensus_decode(d)?,
            })),
            0x02u8 => Ok(Self::B(NonceShares {
                pub_key_shares: Decodable::consensus_decode(d)?,
                nonce_shares: Decodable::consensus_decode(d)?,
            })),
            0x03u8 => Ok(Self::C(PartialSignatures {
                nonce_shares: Decodable::consensus_decode(d)?,
                partial_signatures: Decodable::consensus_decode(d)?,
            })),
            0x04u8 => Ok(Self::D(DepositSignatures {
                partial_signatures: Decodable::consensus_decode(d)?,
            })),
            0x05u8 => Ok(Self::E(SwapTxSignature {
                swap_tx_input_partial_signature: Decodable::consensus_decode(d)?,
            })),
            0x06u8 => Ok(Self::F(CloseTrade {
                peer_output_prv_key_share: Decodable::consensus_decode(d)?,
            })),
            0x07u8 => Ok(Self::G(CloseTrade {
                peer_output_prv_key_share: Decodable::consensus_decode(d)?,
            })),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(PeerMessage);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::{NonceShare, Psbt, PubKeyShare};

    fn nonce_shares() -> NonceShareSet {
        NonceShareSet {
            half_deposit_psbt: Psbt::new(vec![0x70; 8]),
            deposit_tx_input_nonce_share: NonceShare::new(vec![0x01; 33]),
            swap_tx_input_nonce_share: NonceShare::new(vec![0x02; 33]),
        }
    }

    fn signatures() -> PartialSignatureSet {
        PartialSignatureSet {
            deposit_tx_input_partial_signature: PartialSignature::new(vec![0x03; 32]),
            swap_tx_input_partial_signature: Some(PartialSignature::new(vec![0x04; 32])),
        }
    }

    #[test]
    fn message_c_is_always_redacted() {
        let msg = PeerMessage::partial_signatures(nonce_shares(), &signatures());
        assert_eq!(msg.label(), MessageLabel::C);
        match msg {
            PeerMessage::C(c) => assert!(c.partial_signatures.into_set().is_redacted()),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn message_e_releases_the_withheld_share() {
        let msg = PeerMessage::swap_tx_signature(&signatures()).unwrap();
        assert_eq!(
            msg,
            PeerMessage::E(SwapTxSignature {
                swap_tx_input_partial_signature: PartialSignature::new(vec![0x04; 32]),
            })
        );
        assert!(PeerMessage::swap_tx_signature(&signatures().redact().into_set()).is_err());
    }

    #[test]
    fn strict_encoding_matches_consensus_encoding() {
        let msg = PeerMessage::A(PubKeyShares {
            pub_key_shares: PubKeyShareSet {
                buyer_output_pub_key_share: PubKeyShare::new(vec![0x02; 33]),
                seller_output_pub_key_share: PubKeyShare::new(vec![0x03; 33]),
                current_block_height: 840_000,
            },
        });
        let strict_ser = strict_encoding::strict_serialize(&msg).unwrap();
        assert_eq!(strict_ser, consensus::serialize(&msg).unwrap());
        assert_eq!(strict_ser[0], 0x01);
        let res: PeerMessage = strict_encoding::strict_deserialize(&strict_ser).unwrap();
        assert_eq!(res, msg);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            consensus::deserialize::<PeerMessage>(&[0x08]),
            Err(consensus::Error::UnknownType)
        ));
        assert!(MessageLabel::G.is_optional());
        assert!(!MessageLabel::E.is_optional());
    }
}
