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


//! Trade structures. Buyer and seller agree out-of-band on the [`TradeTerms`] and the payout
//! [`Receiver`]s; each of them then tracks the trade under its own [`TradeId`].
//!
//! ## Terms fingerprint
//!
//! Terms must be bit-identical on both sides for the two-party computation to converge on the
//! same deposit transaction. Signers compare the [`TermsFingerprint`], the Keccak-256 hash of the
//! consensus encoded terms, to detect a mismatch.

use bitcoin::Amount;
use std::fmt;
use std::io;
use std::str::FromStr;
use tiny_keccak::{Hasher, Keccak};
use uuid::Uuid;

use crate::consensus::{self, serialize, Decodable, Encodable};

/// The identifier of one party's view of a trade. Buyer and seller never share an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[serde(transparent)]
#[display(inner)]
pub struct TradeId(String);

impl TradeId {
    /// Create a trade identifier from any string.
    pub fn new(id: impl Into<String>) -> Self {
        TradeId(id.into())
    }

    /// Create a fresh identifier `<prefix>-<uuid v4>`.
    pub fn random(prefix: &str) -> Self {
        TradeId(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TradeId {
    fn from(s: &str) -> Self {
        TradeId::new(s)
    }
}

impl Encodable for TradeId {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(s)
    }
}

impl Decodable for TradeId {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self(Decodable::consensus_decode(d)?))
    }
}

impl_strict_encoding!(TradeId);

fixed_hash::construct_fixed_hash!(
    /// Identify trade terms by their content, internally store the Keccak-256 hash of the terms
    /// serialized with the consensus encoding.
    pub struct TermsFingerprint(32);
);

/// Economic parameters of a trade. Amounts are in satoshis, fee rates in satoshis per kilo weight
/// unit (`50_000` is 12.5 sat/vB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeTerms {
    /// Amount of bitcoin sold.
    pub trade_amount: u64,
    /// Security deposit locked by the buyer.
    pub buyers_security_deposit: u64,
    /// Security deposit locked by the seller.
    pub sellers_security_deposit: u64,
    /// Fee rate of the deposit transaction.
    pub deposit_tx_fee_rate: u64,
    /// Fee rate of the prepared (swap, warning, redirect) transactions.
    pub prepared_tx_fee_rate: u64,
}

impl TradeTerms {
    /// Generate the [`TermsFingerprint`] of the terms.
    pub fn fingerprint(&self) -> Result<TermsFingerprint, consensus::Error> {
        let mut keccak = Keccak::v256();
        let mut out = [0u8; 32];
        keccak.update(&serialize(self)?);
        keccak.finalize(&mut out);
        Ok(TermsFingerprint(out))
    }

    /// Total value locked in the deposit transaction, `None` on overflow.
    pub fn total_locked(&self) -> Option<Amount> {
        Amount::from_sat(self.trade_amount)
            .checked_add(Amount::from_sat(self.buyers_security_deposit))?
            .checked_add(Amount::from_sat(self.sellers_security_deposit))
    }
}

impl fmt::Display for TradeTerms {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Trade amount: {}", Amount::from_sat(self.trade_amount))?;
        writeln!(f, "Security deposits")?;
        writeln!(f, "- buyer: {}", Amount::from_sat(self.buyers_security_deposit))?;
        writeln!(f, "- seller: {}", Amount::from_sat(self.sellers_security_deposit))?;
        writeln!(f, "Fee rates (sat/kwu)")?;
        writeln!(f, "- deposit tx: {}", self.deposit_tx_fee_rate)?;
        write!(f, "- prepared txs: {}", self.prepared_tx_fee_rate)
    }
}

impl Encodable for TradeTerms {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.trade_amount.consensus_encode(s)?;
        len += self.buyers_security_deposit.consensus_encode(s)?;
        len += self.sellers_security_deposit.consensus_encode(s)?;
        len += self.deposit_tx_fee_rate.consensus_encode(s)?;
        Ok(len + self.prepared_tx_fee_rate.consensus_encode(s)?)
    }
}

impl Decodable for TradeTerms {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            trade_amount: Decodable::consensus_decode(d)?,
            buyers_security_deposit: Decodable::consensus_decode(d)?,
            sellers_security_deposit: Decodable::consensus_decode(d)?,
            deposit_tx_fee_rate: Decodable::consensus_decode(d)?,
            prepared_tx_fee_rate: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(TradeTerms);

/// A payout destination and the amount it receives, in satoshis. Addresses are kept opaque, the
/// signer validates them against its network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receiver {
    pub address: String,
    pub amount: u64,
}

impl Receiver {
    pub fn new(address: impl Into<String>, amount: u64) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }

    /// Sum of the amounts paid to `receivers`, `None` on overflow.
    pub fn total(receivers: &[Receiver]) -> Option<Amount> {
        receivers.iter().try_fold(Amount::from_sat(0), |acc, r| {
            acc.checked_add(Amount::from_sat(r.amount))
        })
    }
}

impl fmt::Display for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", Amount::from_sat(self.amount), self.address)
    }
}

impl Encodable for Receiver {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let len = self.address.consensus_encode(s)?;
        Ok(len + self.amount.consensus_encode(s)?)
    }
}

impl Decodable for Receiver {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self {
            address: Decodable::consensus_decode(d)?,
            amount: Decodable::consensus_decode(d)?,
        })
    }
}

/// The clean (unmediated) ways a trade can end.
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[display(Debug)]
pub enum ClosureType {
    /// Both parties exchange their output private-key shares (messages F and G).
    Cooperative,
    /// The seller force-closes after a timeout, the buyer recovers from the swap transaction
    /// published on-chain.
    Uncooperative,
}

impl FromStr for ClosureType {
    type Err = consensus::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Cooperative" | "cooperative" => Ok(ClosureType::Cooperative),
            "Uncooperative" | "uncooperative" => Ok(ClosureType::Uncooperative),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms() -> TradeTerms {
        TradeTerms {
            trade_amount: 200_000,
            buyers_security_deposit: 30_000,
            sellers_security_deposit: 30_000,
            deposit_tx_fee_rate: 50_000,
            prepared_tx_fee_rate: 40_000,
        }
    }

    #[test]
    fn fingerprint_depends_on_every_term() {
        let base = terms().fingerprint().unwrap();
        assert_eq!(base, terms().fingerprint().unwrap());
        let mut other = terms();
        other.prepared_tx_fee_rate += 1;
        assert_ne!(base, other.fingerprint().unwrap());
    }

    #[test]
    fn amounts() {
        assert_eq!(terms().total_locked(), Some(Amount::from_sat(260_000)));
        let receivers = vec![Receiver::new("a", 200_000), Receiver::new("b", 92_345)];
        assert_eq!(Receiver::total(&receivers), Some(Amount::from_sat(292_345)));
        assert_eq!(Receiver::total(&[]), Some(Amount::from_sat(0)));
    }

    #[test]
    fn random_trade_ids_are_distinct() {
        let a = TradeId::random("buyer-trade");
        let b = TradeId::random("buyer-trade");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("buyer-trade-"));
    }
}
