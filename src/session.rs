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


//! Trade session state machine. A [`TradeSession`] is owned by one party, wraps its
//! [`SignerService`] and tracks which protocol rounds have completed for one [`TradeId`].
//!
//! States only move forward:
//!
//! ```text
//! Init -> KeysReady -> NoncesReady -> PartialSigsReady -> DepositSigned
//!      -> DepositPublished (taker only) -> DepositConfirmed -> SwapSigned (maker only)
//!      -> Closed | ForceClosed
//! ```
//!
//! Every operation looks up its transition in [`SessionState::next`] before calling the signer and
//! commits the new state only once the signer succeeded, a failed call leaves the session where it
//! was.

use tracing::{debug, info, warn};

use crate::bundle::{
    CloseTradeResponse, DepositPsbt, NonceShareSet, PartialSignatureSet, PubKeyShareSet,
    SwapTxSignatureResult,
};
use crate::datum::{PartialSignature, PrvKeyShare, RawTx};
use crate::role::Role;
use crate::signer::{
    CloseTradeRequest, DepositTxSignatureRequest, NonceSharesRequest, PartialSignaturesRequest,
    PubKeySharesRequest, SignerService, SwapTxSignatureRequest,
};
use crate::syncer::{
    self, ConfirmationEvent, ConfirmationPolicy, ConfirmationStream, ConfirmationWatcher,
};
use crate::trade::{Receiver, TradeId, TradeTerms};
use crate::{Error, Res};

/// The rounds a session went through.
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[display(Debug)]
pub enum SessionState {
    Init,
    KeysReady,
    NoncesReady,
    PartialSigsReady,
    DepositSigned,
    DepositPublished,
    DepositConfirmed,
    SwapSigned,
    Closed,
    ForceClosed,
}

/// Operations driving a session from one state to the next.
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq)]
#[display(Debug)]
pub enum Operation {
    Initialize,
    DeriveNonceShares,
    DerivePartialSignatures,
    SignDepositTx,
    PublishDepositTx,
    SubscribeConfirmations,
    ConfirmDeposit,
    SignSwapTx,
    CloseCooperatively,
    ForceClose,
    RecoverFromSwapTx,
}

impl SessionState {
    /// The transition table. Returns the state reached by applying `operation` in this state for
    /// `role`, `None` if the operation is not allowed.
    pub fn next(self, operation: Operation, role: Role) -> Option<SessionState> {
        use Operation::*;
        use SessionState::*;

        match (self, operation) {
            (Init, Initialize) => Some(KeysReady),
            (KeysReady, DeriveNonceShares) => Some(NoncesReady),
            (NoncesReady, DerivePartialSignatures) => Some(PartialSigsReady),
            (PartialSigsReady, SignDepositTx) => Some(DepositSigned),
            // only the taker broadcasts, publishing again is left to the signer
            (DepositSigned | DepositPublished, PublishDepositTx) if role.is_taker() => {
                Some(DepositPublished)
            }
            (DepositSigned, SubscribeConfirmations) => Some(DepositSigned),
            (DepositPublished, SubscribeConfirmations) => Some(DepositPublished),
            (DepositSigned | DepositPublished, ConfirmDeposit) => Some(DepositConfirmed),
            (DepositConfirmed, SignSwapTx) if role.is_maker() => Some(SwapSigned),
            // the maker only closes once it signed the swap tx with the share from message E
            (DepositConfirmed, CloseCooperatively) if role.is_taker() => Some(Closed),
            (SwapSigned, CloseCooperatively) => Some(Closed),
            (SwapSigned, ForceClose) => Some(ForceClosed),
            (DepositConfirmed, RecoverFromSwapTx) if role.is_taker() => Some(Closed),
            _ => None,
        }
    }

    /// Return `true` once the trade is closed or force-closed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::ForceClosed)
    }
}

/// The three closure shapes accepted by [`TradeSession::close_trade`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOptions {
    /// Close with the peer's share of our output private key (message F or G).
    Cooperative(PrvKeyShare),
    /// Give up on the peer and close without its material.
    ForceClose,
    /// Recover our output from the swap transaction observed on-chain.
    RecoverFromSwapTx(RawTx),
}

impl CloseOptions {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Cooperative(_) => Operation::CloseCooperatively,
            Self::ForceClose => Operation::ForceClose,
            Self::RecoverFromSwapTx(_) => Operation::RecoverFromSwapTx,
        }
    }
}

/// Outcome of the terminal operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseResult {
    /// Either [`SessionState::Closed`] or [`SessionState::ForceClosed`].
    pub state: SessionState,
    pub response: CloseTradeResponse,
}

/// One party's state machine for one trade.
pub struct TradeSession<S> {
    trade_id: TradeId,
    role: Role,
    signer: S,
    state: SessionState,
    terms: Option<TradeTerms>,
    deposit_tx: Option<RawTx>,
}

impl<S> TradeSession<S>
where
    S: SignerService,
{
    /// Create a session in [`SessionState::Init`]. The role is fixed for the session lifetime.
    pub fn new(trade_id: TradeId, role: Role, signer: S) -> Self {
        Self {
            trade_id,
            role,
            signer,
            state: SessionState::Init,
            terms: None,
            deposit_tx: None,
        }
    }

    pub fn trade_id(&self) -> &TradeId {
        &self.trade_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The terms committed in the nonce round, if any.
    pub fn terms(&self) -> Option<&TradeTerms> {
        self.terms.as_ref()
    }

    /// The deposit transaction, known once it is confirmed.
    pub fn deposit_tx(&self) -> Option<&RawTx> {
        self.deposit_tx.as_ref()
    }

    pub fn signer(&self) -> &S {
        &self.signer
    }

    fn transition(&self, operation: Operation) -> Res<SessionState> {
        if operation == Operation::Initialize && self.state != SessionState::Init {
            return Err(Error::AlreadyInitialized(self.trade_id.clone()));
        }
        self.state
            .next(operation, self.role)
            .ok_or(Error::InvalidState {
                operation,
                state: self.state,
            })
    }

    fn commit(&mut self, operation: Operation, next: SessionState) {
        if next != self.state {
            info!(
                trade_id = %self.trade_id,
                role = %self.role,
                "{} -> {} ({})",
                self.state,
                next,
                operation
            );
        }
        self.state = next;
    }

    /// Create the trade on the signer and return our public-key shares (message A or B).
    pub async fn initialize(&mut self) -> Res<PubKeyShareSet> {
        let next = self.transition(Operation::Initialize)?;
        let shares = self
            .signer
            .init_trade(PubKeySharesRequest {
                trade_id: self.trade_id.clone(),
                my_role: self.role,
            })
            .await?;
        self.commit(Operation::Initialize, next);
        Ok(shares)
    }

    /// Derive our nonce shares. The terms are fixed from here on.
    pub async fn derive_nonce_shares(
        &mut self,
        peer_pub_key_shares: PubKeyShareSet,
        terms: TradeTerms,
    ) -> Res<NonceShareSet> {
        let next = self.transition(Operation::DeriveNonceShares)?;
        let shares = self
            .signer
            .get_nonce_shares(NonceSharesRequest {
                trade_id: self.trade_id.clone(),
                peer_pub_key_shares,
                trade_terms: terms,
            })
            .await?;
        self.terms = Some(terms);
        self.commit(Operation::DeriveNonceShares, next);
        Ok(shares)
    }

    /// Derive our partial signatures, the returned set is complete and must be redacted before
    /// being sent as message C.
    pub async fn derive_partial_signatures(
        &mut self,
        peer_nonce_shares: NonceShareSet,
        receivers: Vec<Receiver>,
    ) -> Res<PartialSignatureSet> {
        let next = self.transition(Operation::DerivePartialSignatures)?;
        let signatures = self
            .signer
            .get_partial_signatures(PartialSignaturesRequest {
                trade_id: self.trade_id.clone(),
                peers_nonce_shares: peer_nonce_shares,
                receivers,
            })
            .await?;
        self.commit(Operation::DerivePartialSignatures, next);
        Ok(signatures)
    }

    /// Sign the deposit with the peer's signatures: redacted ones for the maker, the full set for
    /// the taker.
    pub async fn sign_deposit_tx(
        &mut self,
        peer_partial_signatures: PartialSignatureSet,
    ) -> Res<DepositPsbt> {
        let next = self.transition(Operation::SignDepositTx)?;
        debug!(
            trade_id = %self.trade_id,
            is_maker = self.role.is_maker(),
            redacted = peer_partial_signatures.is_redacted(),
            "signing deposit tx"
        );
        let psbt = self
            .signer
            .sign_deposit_tx(DepositTxSignatureRequest {
                trade_id: self.trade_id.clone(),
                peers_partial_signatures: peer_partial_signatures,
            })
            .await?;
        self.commit(Operation::SignDepositTx, next);
        Ok(psbt)
    }

    /// Broadcast the deposit, taker only.
    pub async fn publish_deposit_tx(&mut self) -> Res<ConfirmationStream> {
        let next = self.transition(Operation::PublishDepositTx)?;
        let stream = self.signer.publish_deposit_tx(&self.trade_id).await?;
        self.commit(Operation::PublishDepositTx, next);
        Ok(stream)
    }

    /// Subscribe to the deposit confirmation status, available to both parties once the deposit
    /// is signed.
    pub async fn subscribe_confirmations(&mut self) -> Res<ConfirmationStream> {
        let next = self.transition(Operation::SubscribeConfirmations)?;
        let stream = self
            .signer
            .subscribe_tx_confirmation_status(&self.trade_id)
            .await?;
        self.commit(Operation::SubscribeConfirmations, next);
        Ok(stream)
    }

    /// Consume `stream` until the deposit reaches the policy depth, re-subscribing on an ended or
    /// expired subscription up to `policy.max_attempts` subscriptions in total.
    pub async fn await_deposit_confirmation(
        &mut self,
        stream: ConfirmationStream,
        policy: &ConfirmationPolicy,
    ) -> Res<ConfirmationEvent> {
        let next = self.transition(Operation::ConfirmDeposit)?;
        let max_attempts = policy.max_attempts.max(1);
        let mut stream = stream;
        let mut attempt = 1;
        loop {
            match ConfirmationWatcher::new(stream, policy)
                .wait_for_confirmation()
                .await
            {
                Ok(event) => {
                    info!(trade_id = %self.trade_id, "deposit tx reached {}", event);
                    self.deposit_tx = Some(event.tx.clone());
                    self.commit(Operation::ConfirmDeposit, next);
                    return Ok(event);
                }
                Err(syncer::Error::Signer(err)) => return Err(err.into()),
                Err(err) if attempt < max_attempts => {
                    warn!(
                        trade_id = %self.trade_id,
                        attempt,
                        "{}, re-subscribing to deposit confirmations",
                        err
                    );
                    attempt += 1;
                    stream = self.subscribe_confirmations().await?;
                }
                Err(err) => {
                    warn!(trade_id = %self.trade_id, attempt, "{}, giving up", err);
                    return Err(Error::ConfirmationTimeout { attempts: attempt });
                }
            }
        }
    }

    /// Sign the swap transaction with the buyer's released share (message E), maker only.
    pub async fn sign_swap_tx(
        &mut self,
        unredacted_peer_swap_share: PartialSignature,
    ) -> Res<SwapTxSignatureResult> {
        let next = self.transition(Operation::SignSwapTx)?;
        let result = self
            .signer
            .sign_swap_tx(SwapTxSignatureRequest {
                trade_id: self.trade_id.clone(),
                swap_tx_input_peers_partial_signature: unredacted_peer_swap_share,
            })
            .await?;
        self.commit(Operation::SignSwapTx, next);
        Ok(result)
    }

    /// Terminal operation, see [`CloseOptions`] for the three closure shapes.
    pub async fn close_trade(&mut self, options: CloseOptions) -> Res<CloseResult> {
        let operation = options.operation();
        let next = self.transition(operation)?;
        let (my_output_peers_prv_key_share, swap_tx) = match options {
            CloseOptions::Cooperative(share) => (Some(share), None),
            CloseOptions::ForceClose => (None, None),
            CloseOptions::RecoverFromSwapTx(tx) => (None, Some(tx)),
        };
        let response = self
            .signer
            .close_trade(CloseTradeRequest {
                trade_id: self.trade_id.clone(),
                my_output_peers_prv_key_share,
                swap_tx,
            })
            .await?;
        self.commit(operation, next);
        Ok(CloseResult {
            state: next,
            response,
        })
    }
}
