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


//! Protocol execution. [`run_buyer`] and [`run_seller`] drive one party's [`TradeSession`] through
//! the rounds of a trade, exchanging the messages of [`protocol_message`] with the counterparty
//! over a [`PeerMessageRelay`].
//!
//! The buyer (taker) always speaks first and always redacts its swap tx partial signature from
//! message C, releasing it with message E only once the deposit is confirmed and the payment
//! sent. The closure is cooperative when messages F and G arrive in time; otherwise the seller
//! force-closes by publishing the swap tx and the buyer recovers its output from it.
//!
//! [`protocol_message`]: crate::protocol_message

use async_trait::async_trait;
use tracing::{info, warn};

use crate::bundle::CloseTradeResponse;
use crate::config::TradeConfig;
use crate::datum::{PrvKeyShare, RawTx};
use crate::protocol_message::{
    CloseTrade, DepositSignatures, MessageLabel, NonceShares, PeerMessage, PubKeyShares,
};
use crate::relay::PeerMessageRelay;
use crate::role::Role;
use crate::session::{CloseOptions, SessionState, TradeSession};
use crate::signer::SignerService;
use crate::syncer::SpendWatcher;
use crate::trade::{ClosureType, Receiver, TradeId, TradeTerms};
use crate::{Error, Res};

/// Protocol rounds in execution order, used to report where a party stopped.
#[derive(
    Display, Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[display(Debug)]
pub enum Round {
    /// Trade creation and message A.
    Initialization,
    /// Message B.
    NonceExchange,
    /// Message C.
    PartialSignatureExchange,
    /// Message D and the deposit signatures.
    DepositSigning,
    DepositConfirmation,
    /// Message E and the swap tx signature.
    SwapSigning,
    /// Messages F and G, or their fallback.
    Closure,
}

/// A failed round, with the error that stopped the party.
#[derive(thiserror::Error, Debug)]
#[error("{source} during {round} round")]
pub struct ProtocolFailure {
    pub round: Round,
    pub source: Error,
}

trait AtRound<T> {
    fn at(self, round: Round) -> Result<T, ProtocolFailure>;
}

impl<T> AtRound<T> for Res<T> {
    fn at(self, round: Round) -> Result<T, ProtocolFailure> {
        self.map_err(|source| ProtocolFailure { round, source })
    }
}

fn unexpected(expected: MessageLabel, received: &PeerMessage, round: Round) -> ProtocolFailure {
    ProtocolFailure {
        round,
        source: Error::UnexpectedMessage {
            expected,
            received: received.label(),
        },
    }
}

macro_rules! receive {
    ($relay:expr, $label:ident, $timeout:expr, $round:expr) => {
        match $relay
            .receive(MessageLabel::$label, $timeout)
            .await
            .at($round)?
        {
            PeerMessage::$label(content) => content,
            other => return Err(unexpected(MessageLabel::$label, &other, $round)),
        }
    };
}

/// Buyer side confirmation that the fiat payment was sent. Message E is only sent once
/// [`PaymentConfirmation::payment_sent`] resolves.
#[async_trait]
pub trait PaymentConfirmation: Send + Sync {
    async fn payment_sent(&self, trade_id: &TradeId) -> Res<()>;
}

/// Payment settled out of band, message E follows the deposit confirmation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaymentSettled;

#[async_trait]
impl PaymentConfirmation for PaymentSettled {
    async fn payment_sent(&self, _trade_id: &TradeId) -> Res<()> {
        Ok(())
    }
}

/// What one party knows about the trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeContext {
    pub terms: TradeTerms,
    pub receivers: Vec<Receiver>,
    pub config: TradeConfig,
}

/// How a party ended the trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyOutcome {
    pub role: Role,
    pub trade_id: TradeId,
    /// Terminal session state.
    pub state: SessionState,
    pub closure: ClosureType,
    pub deposit_tx: RawTx,
    /// The swap tx signed by the seller, or observed on-chain by the buyer. The buyer closing
    /// cooperatively never sees it.
    pub swap_tx: Option<RawTx>,
    /// The peer's private-key share of our output, received with message F or G.
    pub received_prv_key_share: Option<PrvKeyShare>,
    pub close_response: CloseTradeResponse,
}

/// Drive the buyer (taker) side of a trade to its end.
pub async fn run_buyer<S, R, W, P>(
    session: &mut TradeSession<S>,
    mut relay: R,
    spend_watcher: &W,
    payment: &P,
    context: &TradeContext,
) -> Result<PartyOutcome, ProtocolFailure>
where
    S: SignerService,
    R: PeerMessageRelay,
    W: SpendWatcher + ?Sized,
    P: PaymentConfirmation + ?Sized,
{
    let config = &context.config;
    let timeout = config.peer_message_timeout();
    let trade_id = session.trade_id().clone();

    info!(%trade_id, "buyer starts trade");
    let pub_key_shares = session.initialize().await.at(Round::Initialization)?;
    relay
        .send(PeerMessage::A(PubKeyShares { pub_key_shares }))
        .await
        .at(Round::Initialization)?;

    let seller = receive!(relay, B, timeout, Round::NonceExchange);
    let nonce_shares = session
        .derive_nonce_shares(seller.pub_key_shares, context.terms)
        .await
        .at(Round::NonceExchange)?;

    let partial_signatures = session
        .derive_partial_signatures(seller.nonce_shares, context.receivers.clone())
        .await
        .at(Round::PartialSignatureExchange)?;
    relay
        .send(PeerMessage::partial_signatures(
            nonce_shares,
            &partial_signatures,
        ))
        .await
        .at(Round::PartialSignatureExchange)?;

    let deposit = receive!(relay, D, timeout, Round::DepositSigning);
    session
        .sign_deposit_tx(deposit.partial_signatures)
        .await
        .at(Round::DepositSigning)?;

    info!(%trade_id, "publishing deposit tx");
    let stream = session
        .publish_deposit_tx()
        .await
        .at(Round::DepositConfirmation)?;
    let confirmed = session
        .await_deposit_confirmation(stream, &config.confirmation_policy())
        .await
        .at(Round::DepositConfirmation)?;
    let deposit_tx = confirmed.tx;

    info!(%trade_id, "deposit confirmed, waiting for the payment");
    match tokio::time::timeout(config.payment_timeout(), payment.payment_sent(&trade_id)).await {
        Ok(sent) => sent.at(Round::SwapSigning)?,
        Err(_) => {
            return Err(ProtocolFailure {
                round: Round::SwapSigning,
                source: Error::PaymentUnconfirmed,
            })
        }
    }
    let release = PeerMessage::swap_tx_signature(&partial_signatures).at(Round::SwapSigning)?;
    relay.send(release).await.at(Round::SwapSigning)?;

    match relay
        .receive(MessageLabel::F, config.cooperative_close_timeout())
        .await
    {
        Ok(PeerMessage::F(CloseTrade {
            peer_output_prv_key_share,
        })) => {
            let closed = session
                .close_trade(CloseOptions::Cooperative(
                    peer_output_prv_key_share.clone(),
                ))
                .await
                .at(Round::Closure)?;
            relay
                .send(PeerMessage::G(CloseTrade {
                    peer_output_prv_key_share: closed
                        .response
                        .peer_output_prv_key_share
                        .clone(),
                }))
                .await
                .at(Round::Closure)?;
            info!(%trade_id, "buyer closed trade cooperatively");
            Ok(PartyOutcome {
                role: Role::BuyerAsTaker,
                trade_id,
                state: closed.state,
                closure: ClosureType::Cooperative,
                deposit_tx,
                swap_tx: None,
                received_prv_key_share: Some(peer_output_prv_key_share),
                close_response: closed.response,
            })
        }
        Ok(other) => Err(unexpected(MessageLabel::F, &other, Round::Closure)),
        Err(Error::PeerMessageMissing(_)) => {
            warn!(%trade_id, "message F missing, watching the chain for the swap tx");
            let swap_tx = match tokio::time::timeout(
                config.swap_tx_timeout(),
                spend_watcher.watch_swap_tx(deposit_tx.txid()),
            )
            .await
            {
                Ok(Ok(swap_tx)) => swap_tx,
                Ok(Err(err)) => {
                    warn!(%trade_id, "swap tx watch failed: {}", err);
                    return Err(ProtocolFailure {
                        round: Round::Closure,
                        source: Error::SwapTxUnobserved,
                    });
                }
                Err(_) => {
                    warn!(%trade_id, "swap tx not seen after {:?}", config.swap_tx_timeout());
                    return Err(ProtocolFailure {
                        round: Round::Closure,
                        source: Error::SwapTxUnobserved,
                    });
                }
            };
            let closed = session
                .close_trade(CloseOptions::RecoverFromSwapTx(swap_tx.clone()))
                .await
                .at(Round::Closure)?;
            info!(%trade_id, "buyer closed trade from the swap tx");
            Ok(PartyOutcome {
                role: Role::BuyerAsTaker,
                trade_id,
                state: closed.state,
                closure: ClosureType::Uncooperative,
                deposit_tx,
                swap_tx: Some(swap_tx),
                received_prv_key_share: None,
                close_response: closed.response,
            })
        }
        Err(err) => Err(ProtocolFailure {
            round: Round::Closure,
            source: err,
        }),
    }
}

/// Drive the seller (maker) side of a trade to its end.
pub async fn run_seller<S, R>(
    session: &mut TradeSession<S>,
    mut relay: R,
    context: &TradeContext,
) -> Result<PartyOutcome, ProtocolFailure>
where
    S: SignerService,
    R: PeerMessageRelay,
{
    let config = &context.config;
    let timeout = config.peer_message_timeout();
    let trade_id = session.trade_id().clone();

    info!(%trade_id, "seller waits for the buyer");
    let buyer = receive!(relay, A, timeout, Round::Initialization);
    let pub_key_shares = session.initialize().await.at(Round::Initialization)?;

    let nonce_shares = session
        .derive_nonce_shares(buyer.pub_key_shares, context.terms)
        .await
        .at(Round::NonceExchange)?;
    relay
        .send(PeerMessage::B(NonceShares {
            pub_key_shares,
            nonce_shares,
        }))
        .await
        .at(Round::NonceExchange)?;

    let buyer = receive!(relay, C, timeout, Round::PartialSignatureExchange);
    let partial_signatures = session
        .derive_partial_signatures(buyer.nonce_shares, context.receivers.clone())
        .await
        .at(Round::PartialSignatureExchange)?;

    session
        .sign_deposit_tx(buyer.partial_signatures.into_set())
        .await
        .at(Round::DepositSigning)?;
    let stream = session
        .subscribe_confirmations()
        .await
        .at(Round::DepositConfirmation)?;
    relay
        .send(PeerMessage::D(DepositSignatures { partial_signatures }))
        .await
        .at(Round::DepositSigning)?;

    let confirmed = session
        .await_deposit_confirmation(stream, &config.confirmation_policy())
        .await
        .at(Round::DepositConfirmation)?;
    let deposit_tx = confirmed.tx;

    let release = receive!(relay, E, config.payment_timeout(), Round::SwapSigning);
    let swap = session
        .sign_swap_tx(release.swap_tx_input_partial_signature)
        .await
        .at(Round::SwapSigning)?;
    relay
        .send(PeerMessage::F(CloseTrade {
            peer_output_prv_key_share: swap.peer_output_prv_key_share.clone(),
        }))
        .await
        .at(Round::Closure)?;

    let (options, received_prv_key_share, closure) = match relay
        .receive(MessageLabel::G, config.cooperative_close_timeout())
        .await
    {
        Ok(PeerMessage::G(CloseTrade {
            peer_output_prv_key_share,
        })) => (
            CloseOptions::Cooperative(peer_output_prv_key_share.clone()),
            Some(peer_output_prv_key_share),
            ClosureType::Cooperative,
        ),
        Ok(other) => return Err(unexpected(MessageLabel::G, &other, Round::Closure)),
        Err(Error::PeerMessageMissing(_)) => {
            warn!(%trade_id, "message G missing, force-closing the trade");
            (CloseOptions::ForceClose, None, ClosureType::Uncooperative)
        }
        Err(err) => {
            return Err(ProtocolFailure {
                round: Round::Closure,
                source: err,
            })
        }
    };
    let closed = session.close_trade(options).await.at(Round::Closure)?;
    info!(%trade_id, "seller ended trade in state {}", closed.state);
    Ok(PartyOutcome {
        role: Role::SellerAsMaker,
        trade_id,
        state: closed.state,
        closure,
        deposit_tx,
        swap_tx: Some(swap.swap_tx),
        received_prv_key_share,
        close_response: closed.response,
    })
}
