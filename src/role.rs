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


//! Roles distinguishing the two participants of a trade. The buyer always takes the offer and
//! broadcasts the deposit transaction, the seller always makes the offer.

use std::io;
use std::str::FromStr;

use crate::consensus::{self, Decodable, Encodable};

/// Role of a participant, fixed for the lifetime of a session.
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[display(Debug)]
pub enum Role {
    /// The buyer takes the offer and is the broadcaster of the deposit transaction. Its partial
    /// signature on the swap transaction is withheld until the deposit is confirmed.
    BuyerAsTaker,
    /// The seller makes the offer. It signs the swap transaction as soon as it receives the
    /// buyer's withheld partial signature.
    SellerAsMaker,
}

impl Role {
    /// Return the counterparty role.
    pub fn other(&self) -> Self {
        match self {
            Self::BuyerAsTaker => Self::SellerAsMaker,
            Self::SellerAsMaker => Self::BuyerAsTaker,
        }
    }

    /// Return `true` for the maker (seller) role.
    pub fn is_maker(&self) -> bool {
        matches!(self, Self::SellerAsMaker)
    }

    /// Return `true` for the taker (buyer) role, the one broadcasting the deposit.
    pub fn is_taker(&self) -> bool {
        matches!(self, Self::BuyerAsTaker)
    }
}

impl Encodable for Role {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Role::BuyerAsTaker => 0x01u8.consensus_encode(writer),
            Role::SellerAsMaker => 0x02u8.consensus_encode(writer),
        }
    }
}

impl Decodable for Role {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(Role::BuyerAsTaker),
            0x02u8 => Ok(Role::SellerAsMaker),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(Role);

impl FromStr for Role {
    type Err = consensus::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BuyerAsTaker" | "buyer" | "taker" => Ok(Role::BuyerAsTaker),
            "SellerAsMaker" | "seller" | "maker" => Ok(Role::SellerAsMaker),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}
