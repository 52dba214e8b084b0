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


//! Run both parties of a trade concurrently, each with its own signer, session and relay endpoint.

use thiserror::Error;
use tracing::{error, info};

use std::sync::Arc;

use crate::config::{self, TradeConfig};
use crate::protocol::{
    self, PartyOutcome, PaymentConfirmation, PaymentSettled, ProtocolFailure, Round, TradeContext,
};
use crate::protocol_message::MessageLabel;
use crate::relay::{InMemoryRelay, TranscriptEntry};
use crate::role::Role;
use crate::session::{SessionState, TradeSession};
use crate::signer::SignerService;
use crate::syncer::SpendWatcher;
use crate::trade::{ClosureType, Receiver, TradeId, TradeTerms};

/// Errors ending an orchestrated trade.
#[derive(Error, Debug)]
pub enum Error {
    /// A party stopped before reaching a terminal state.
    #[error("{role} aborted trade {trade_id} in state {state} during {round} round: {source}")]
    Aborted {
        role: Role,
        trade_id: TradeId,
        /// Last state reached by the party's session.
        state: SessionState,
        round: Round,
        source: crate::Error,
    },
    #[error(transparent)]
    Config(#[from] config::Error),
}

impl Error {
    /// The protocol error behind an abort.
    pub fn protocol_error(&self) -> Option<&crate::Error> {
        match self {
            Self::Aborted { source, .. } => Some(source),
            Self::Config(_) => None,
        }
    }

    fn round(&self) -> Option<Round> {
        match self {
            Self::Aborted { round, .. } => Some(*round),
            Self::Config(_) => None,
        }
    }

    /// Errors caused by the other party stopping: a missing message, or the missing swap tx a
    /// silent seller would have published.
    fn is_consequence(&self) -> bool {
        matches!(
            self.protocol_error(),
            Some(crate::Error::PeerMessageMissing(_) | crate::Error::SwapTxUnobserved)
        )
    }
}

/// Pick the abort to report when both parties failed: a root cause over a consequence, then the
/// earliest round, then the buyer.
fn root_cause(buyer: Error, seller: Error) -> Error {
    match (buyer.is_consequence(), seller.is_consequence()) {
        (true, false) => seller,
        (false, true) => buyer,
        _ if seller.round() < buyer.round() => seller,
        _ => buyer,
    }
}

/// Inputs of one trade. Each party keeps its own view of the terms, they are compared by the
/// signers only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeSetup {
    pub buyer_trade_id: TradeId,
    pub seller_trade_id: TradeId,
    pub buyer_terms: TradeTerms,
    pub seller_terms: TradeTerms,
    pub receivers: Vec<Receiver>,
}

impl TradeSetup {
    /// Setup with random trade ids and the same terms on both sides.
    pub fn new(terms: TradeTerms, receivers: Vec<Receiver>) -> Self {
        Self {
            buyer_trade_id: TradeId::random("buyer-trade"),
            seller_trade_id: TradeId::random("seller-trade"),
            buyer_terms: terms,
            seller_terms: terms,
            receivers,
        }
    }
}

/// Outcome of a trade completed by both parties.
#[derive(Debug, Clone)]
pub struct TradeReport {
    pub buyer: PartyOutcome,
    pub seller: PartyOutcome,
    /// Every message sent during the trade, delivered or not.
    pub transcript: Vec<TranscriptEntry>,
}

/// Runs trades between a buyer and a seller signer.
pub struct TradeOrchestrator<B, S, W> {
    buyer_signer: B,
    seller_signer: S,
    spend_watcher: W,
    payment: Arc<dyn PaymentConfirmation>,
    config: TradeConfig,
}

impl<B, S, W> TradeOrchestrator<B, S, W>
where
    B: SignerService + Clone,
    S: SignerService + Clone,
    W: SpendWatcher,
{
    /// Orchestrator whose buyer considers the payment settled as soon as the deposit confirms.
    pub fn new(buyer_signer: B, seller_signer: S, spend_watcher: W, config: TradeConfig) -> Self {
        Self {
            buyer_signer,
            seller_signer,
            spend_watcher,
            payment: Arc::new(PaymentSettled),
            config,
        }
    }

    /// Gate message E on `payment`.
    pub fn with_payment_confirmation(mut self, payment: Arc<dyn PaymentConfirmation>) -> Self {
        self.payment = payment;
        self
    }

    pub fn config(&self) -> &TradeConfig {
        &self.config
    }

    /// Run one trade to its end. With [`ClosureType::Uncooperative`] the seller's message F is
    /// dropped on the way, forcing the timeout-driven closure.
    pub async fn execute(
        &self,
        setup: TradeSetup,
        closure: ClosureType,
    ) -> Result<TradeReport, Error> {
        self.config.validate()?;
        info!(
            buyer = %setup.buyer_trade_id,
            seller = %setup.seller_trade_id,
            %closure,
            "starting trade: {}",
            setup.buyer_terms
        );

        let (buyer_relay, mut seller_relay) = InMemoryRelay::pair();
        if closure == ClosureType::Uncooperative {
            seller_relay.discard(MessageLabel::F);
        }
        let transcript = buyer_relay.transcript();

        let mut buyer = TradeSession::new(
            setup.buyer_trade_id,
            Role::BuyerAsTaker,
            self.buyer_signer.clone(),
        );
        let mut seller = TradeSession::new(
            setup.seller_trade_id,
            Role::SellerAsMaker,
            self.seller_signer.clone(),
        );
        let buyer_context = TradeContext {
            terms: setup.buyer_terms,
            receivers: setup.receivers.clone(),
            config: self.config,
        };
        let seller_context = TradeContext {
            terms: setup.seller_terms,
            receivers: setup.receivers,
            config: self.config,
        };

        let (buyer_res, seller_res) = tokio::join!(
            protocol::run_buyer(
                &mut buyer,
                buyer_relay,
                &self.spend_watcher,
                self.payment.as_ref(),
                &buyer_context
            ),
            protocol::run_seller(&mut seller, seller_relay, &seller_context),
        );

        match (buyer_res, seller_res) {
            (Ok(buyer), Ok(seller)) => {
                info!(
                    "trade completed, buyer {} and seller {}",
                    buyer.state, seller.state
                );
                Ok(TradeReport {
                    buyer,
                    seller,
                    transcript: transcript.entries().await,
                })
            }
            (Err(failure), Ok(_)) => Err(aborted(&buyer, failure)),
            (Ok(_), Err(failure)) => Err(aborted(&seller, failure)),
            (Err(buyer_failure), Err(seller_failure)) => Err(root_cause(
                aborted(&buyer, buyer_failure),
                aborted(&seller, seller_failure),
            )),
        }
    }
}

fn aborted<S: SignerService>(session: &TradeSession<S>, failure: ProtocolFailure) -> Error {
    let err = Error::Aborted {
        role: session.role(),
        trade_id: session.trade_id().clone(),
        state: session.state(),
        round: failure.round,
        source: failure.source,
    };
    error!("{}", err);
    err
}
