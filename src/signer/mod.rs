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


//! The signer service contract. Each party talks to its own signer instance, which holds the
//! secret material of its trades keyed by [`TradeId`] and never shares it with the other party's
//! signer.
//!
//! The operations mirror the rounds of the protocol:
//!
//! | Operation | Key inputs | Key outputs |
//! |---|---|---|
//! | [`init_trade`] | trade id, role | [`PubKeyShareSet`] |
//! | [`get_nonce_shares`] | peer public-key shares, [`TradeTerms`] | [`NonceShareSet`] |
//! | [`get_partial_signatures`] | peer nonce shares, [`Receiver`]s | [`PartialSignatureSet`] |
//! | [`sign_deposit_tx`] | peer partial signatures (redacted or not) | [`DepositPsbt`] |
//! | [`publish_deposit_tx`] | trade id | [`ConfirmationStream`] |
//! | [`subscribe_tx_confirmation_status`] | trade id | [`ConfirmationStream`] |
//! | [`sign_swap_tx`] | peer's swap partial signature | [`SwapTxSignatureResult`] |
//! | [`close_trade`] | optional peer private-key share, optional swap tx | [`CloseTradeResponse`] |
//!
//! [`init_trade`]: SignerService::init_trade
//! [`get_nonce_shares`]: SignerService::get_nonce_shares
//! [`get_partial_signatures`]: SignerService::get_partial_signatures
//! [`sign_deposit_tx`]: SignerService::sign_deposit_tx
//! [`publish_deposit_tx`]: SignerService::publish_deposit_tx
//! [`subscribe_tx_confirmation_status`]: SignerService::subscribe_tx_confirmation_status
//! [`sign_swap_tx`]: SignerService::sign_swap_tx
//! [`close_trade`]: SignerService::close_trade

use async_trait::async_trait;
use thiserror::Error;

use std::sync::Arc;

use crate::bundle::{
    CloseTradeResponse, DepositPsbt, NonceShareSet, PartialSignatureSet, PubKeyShareSet,
    SwapTxSignatureResult,
};
use crate::datum::{PartialSignature, PrvKeyShare, RawTx};
use crate::role::Role;
use crate::syncer::ConfirmationStream;
use crate::trade::{Receiver, TradeId, TradeTerms};

pub mod mock;

/// Errors returned by a signer backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The trade identifier is already initialized on this signer.
    #[error("Trade {0} already initialized")]
    AlreadyInitialized(TradeId),
    /// The trade identifier is unknown to this signer.
    #[error("Unknown trade {0}")]
    UnknownTrade(TradeId),
    /// The signer's own view of the trade does not allow the request yet.
    #[error("Invalid signer state: {0}")]
    InvalidState(String),
    /// The peer's material was built on different trade terms.
    #[error("Trade terms mismatch")]
    TermsMismatch,
    /// The request content is rejected, e.g. an invalid partial signature.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// The backend cannot be reached.
    #[error("Signer unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubKeySharesRequest {
    pub trade_id: TradeId,
    pub my_role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceSharesRequest {
    pub trade_id: TradeId,
    pub peer_pub_key_shares: PubKeyShareSet,
    pub trade_terms: TradeTerms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSignaturesRequest {
    pub trade_id: TradeId,
    pub peers_nonce_shares: NonceShareSet,
    pub receivers: Vec<Receiver>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositTxSignatureRequest {
    pub trade_id: TradeId,
    /// The swap share is absent when the maker signs, the buyer withholds it until message E.
    pub peers_partial_signatures: PartialSignatureSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapTxSignatureRequest {
    pub trade_id: TradeId,
    pub swap_tx_input_peers_partial_signature: PartialSignature,
}

/// Close request. Both optional fields empty means a forced closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseTradeRequest {
    pub trade_id: TradeId,
    pub my_output_peers_prv_key_share: Option<PrvKeyShare>,
    pub swap_tx: Option<RawTx>,
}

/// Per-party cryptographic backend. Implementations are stateful per trade identifier.
#[async_trait]
pub trait SignerService: Send + Sync {
    /// Create the trade and return this party's public-key shares.
    async fn init_trade(&self, request: PubKeySharesRequest) -> Result<PubKeyShareSet, Error>;

    /// Derive nonce shares from the peer's public-key shares and the trade terms.
    async fn get_nonce_shares(&self, request: NonceSharesRequest) -> Result<NonceShareSet, Error>;

    /// Derive partial signatures from the peer's nonce shares. The signer checks the receivers.
    async fn get_partial_signatures(
        &self,
        request: PartialSignaturesRequest,
    ) -> Result<PartialSignatureSet, Error>;

    async fn sign_deposit_tx(
        &self,
        request: DepositTxSignatureRequest,
    ) -> Result<DepositPsbt, Error>;

    /// Broadcast the deposit transaction and return its confirmation stream. Publishing twice is
    /// left to the backend.
    async fn publish_deposit_tx(&self, trade_id: &TradeId) -> Result<ConfirmationStream, Error>;

    async fn subscribe_tx_confirmation_status(
        &self,
        trade_id: &TradeId,
    ) -> Result<ConfirmationStream, Error>;

    async fn sign_swap_tx(
        &self,
        request: SwapTxSignatureRequest,
    ) -> Result<SwapTxSignatureResult, Error>;

    async fn close_trade(&self, request: CloseTradeRequest) -> Result<CloseTradeResponse, Error>;
}

#[async_trait]
impl<T> SignerService for Arc<T>
where
    T: SignerService + ?Sized,
{
    async fn init_trade(&self, request: PubKeySharesRequest) -> Result<PubKeyShareSet, Error> {
        (**self).init_trade(request).await
    }

    async fn get_nonce_shares(&self, request: NonceSharesRequest) -> Result<NonceShareSet, Error> {
        (**self).get_nonce_shares(request).await
    }

    async fn get_partial_signatures(
        &self,
        request: PartialSignaturesRequest,
    ) -> Result<PartialSignatureSet, Error> {
        (**self).get_partial_signatures(request).await
    }

    async fn sign_deposit_tx(
        &self,
        request: DepositTxSignatureRequest,
    ) -> Result<DepositPsbt, Error> {
        (**self).sign_deposit_tx(request).await
    }

    async fn publish_deposit_tx(&self, trade_id: &TradeId) -> Result<ConfirmationStream, Error> {
        (**self).publish_deposit_tx(trade_id).await
    }

    async fn subscribe_tx_confirmation_status(
        &self,
        trade_id: &TradeId,
    ) -> Result<ConfirmationStream, Error> {
        (**self).subscribe_tx_confirmation_status(trade_id).await
    }

    async fn sign_swap_tx(
        &self,
        request: SwapTxSignatureRequest,
    ) -> Result<SwapTxSignatureResult, Error> {
        (**self).sign_swap_tx(request).await
    }

    async fn close_trade(&self, request: CloseTradeRequest) -> Result<CloseTradeResponse, Error> {
        (**self).close_trade(request).await
    }
}
