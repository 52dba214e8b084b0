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


//! Bundles group the datum a signer returns for one protocol round. They are produced by a
//! party's own signer and forwarded, unchanged or redacted, to the counterparty.

use std::io;

use crate::consensus::{self, Decodable, Encodable};
use crate::datum::{NonceShare, PartialSignature, PrvKeyShare, Psbt, PubKeyShare, RawTx};

/// Public-key shares of the two trade outputs, produced once per session at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKeyShareSet {
    /// Share of the key controlling the buyer's payout output.
    pub buyer_output_pub_key_share: PubKeyShare,
    /// Share of the key controlling the seller's payout output.
    pub seller_output_pub_key_share: PubKeyShare,
    /// Chain tip seen by the signer when the shares were created.
    pub current_block_height: u32,
}

impl Encodable for PubKeyShareSet {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.buyer_output_pub_key_share.consensus_encode(s)?;
        len += self.seller_output_pub_key_share.consensus_encode(s)?;
        Ok(len + self.current_block_height.consensus_encode(s)?)
    }
}

impl Decodable for PubKeyShareSet {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            buyer_output_pub_key_share: Decodable::consensus_decode(d)?,
            seller_output_pub_key_share: Decodable::consensus_decode(d)?,
            current_block_height: Decodable::consensus_decode(d)?,
        })
    }
}

/// Nonce shares derived from the peer's public-key shares and the trade terms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonceShareSet {
    /// This party's half of the deposit transaction, committing to the trade terms.
    pub half_deposit_psbt: Psbt,
    pub deposit_tx_input_nonce_share: NonceShare,
    pub swap_tx_input_nonce_share: NonceShare,
}

impl Encodable for NonceShareSet {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.half_deposit_psbt.consensus_encode(s)?;
        len += self.deposit_tx_input_nonce_share.consensus_encode(s)?;
        Ok(len + self.swap_tx_input_nonce_share.consensus_encode(s)?)
    }
}

impl Decodable for NonceShareSet {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            half_deposit_psbt: Decodable::consensus_decode(d)?,
            deposit_tx_input_nonce_share: Decodable::consensus_decode(d)?,
            swap_tx_input_nonce_share: Decodable::consensus_decode(d)?,
        })
    }
}

/// Partial signatures on the deposit transaction and on the swap transaction input.
///
/// This is also the shape a signer accepts as the peer's signatures when signing the deposit: the
/// swap share is then absent when the peer withheld it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartialSignatureSet {
    pub deposit_tx_input_partial_signature: PartialSignature,
    pub swap_tx_input_partial_signature: Option<PartialSignature>,
}

impl PartialSignatureSet {
    /// Clear the swap transaction share, producing the only form of this set allowed to cross
    /// the peer boundary before the deposit is confirmed.
    pub fn redact(&self) -> RedactedPartialSignatureSet {
        RedactedPartialSignatureSet {
            deposit_tx_input_partial_signature: self.deposit_tx_input_partial_signature.clone(),
        }
    }

    /// Return `true` if no (or an empty) swap share is present.
    pub fn is_redacted(&self) -> bool {
        self.swap_tx_input_partial_signature
            .as_ref()
            .map_or(true, PartialSignature::is_empty)
    }
}

impl Encodable for PartialSignatureSet {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let len = self.deposit_tx_input_partial_signature.consensus_encode(s)?;
        Ok(len + self.swap_tx_input_partial_signature.consensus_encode(s)?)
    }
}

impl Decodable for PartialSignatureSet {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            deposit_tx_input_partial_signature: Decodable::consensus_decode(d)?,
            swap_tx_input_partial_signature: Decodable::consensus_decode(d)?,
        })
    }
}

/// A [`PartialSignatureSet`] with the swap transaction share removed. The type has no field for
/// the swap share, neither in memory nor on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RedactedPartialSignatureSet {
    deposit_tx_input_partial_signature: PartialSignature,
}

impl RedactedPartialSignatureSet {
    pub fn deposit_tx_input_partial_signature(&self) -> &PartialSignature {
        &self.deposit_tx_input_partial_signature
    }

    /// Widen into the set shape accepted by signers, with the swap share cleared.
    pub fn into_set(self) -> PartialSignatureSet {
        PartialSignatureSet {
            deposit_tx_input_partial_signature: self.deposit_tx_input_partial_signature,
            swap_tx_input_partial_signature: None,
        }
    }
}

impl Encodable for RedactedPartialSignatureSet {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        self.deposit_tx_input_partial_signature.consensus_encode(s)
    }
}

impl Decodable for RedactedPartialSignatureSet {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            deposit_tx_input_partial_signature: Decodable::consensus_decode(d)?,
        })
    }
}

/// The deposit transaction once both parties' deposit signature shares are known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepositPsbt {
    pub deposit_psbt: Psbt,
}

/// Result of signing the swap transaction on receipt of the buyer's withheld share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwapTxSignatureResult {
    /// The fully signed swap transaction, publishable by its holder.
    pub swap_tx: RawTx,
    /// The private-key share of the peer's output held by this party, handed over in a
    /// cooperative closure.
    pub peer_output_prv_key_share: PrvKeyShare,
}

/// What a signer returns when a trade is closed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloseTradeResponse {
    /// The private-key share of the peer's output held by this party.
    pub peer_output_prv_key_share: PrvKeyShare,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{deserialize, serialize};

    fn signatures() -> PartialSignatureSet {
        PartialSignatureSet {
            deposit_tx_input_partial_signature: PartialSignature::new(vec![1; 32]),
            swap_tx_input_partial_signature: Some(PartialSignature::new(vec![2; 32])),
        }
    }

    #[test]
    fn redaction_clears_the_swap_share() {
        let full = signatures();
        assert!(!full.is_redacted());
        let redacted = full.redact();
        assert_eq!(
            redacted.deposit_tx_input_partial_signature(),
            &full.deposit_tx_input_partial_signature
        );
        let widened = redacted.into_set();
        assert!(widened.is_redacted());
        assert_eq!(widened.swap_tx_input_partial_signature, None);
    }

    #[test]
    fn redacted_wire_form_has_no_swap_share() {
        let full = signatures();
        let redacted = serialize(&full.redact()).unwrap();
        // deposit share only: u32 length prefix and 32 bytes
        assert_eq!(redacted.len(), 4 + 32);
        assert!(!redacted.windows(32).any(|w| w == [2; 32]));
        let decoded: RedactedPartialSignatureSet = deserialize(&redacted).unwrap();
        assert_eq!(decoded, full.redact());
    }

    #[test]
    fn empty_swap_share_counts_as_redacted() {
        let mut set = signatures();
        set.swap_tx_input_partial_signature = Some(PartialSignature::default());
        assert!(set.is_redacted());
    }
}
