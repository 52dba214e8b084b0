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


use musig_trade_core::bundle::{
    CloseTradeResponse, DepositPsbt, NonceShareSet, PartialSignatureSet, PubKeyShareSet,
    SwapTxSignatureResult,
};
use musig_trade_core::config::TradeConfig;
use musig_trade_core::orchestrator::{self, TradeOrchestrator, TradeReport, TradeSetup};
use musig_trade_core::protocol::{self, PaymentConfirmation, PaymentSettled, Round, TradeContext};
use musig_trade_core::protocol_message::{MessageLabel, PeerMessage};
use musig_trade_core::relay::InMemoryRelay;
use musig_trade_core::role::Role;
use musig_trade_core::session::{SessionState, TradeSession};
use musig_trade_core::signer::mock::{MockChain, MockSigner};
use musig_trade_core::signer::{
    self, CloseTradeRequest, DepositTxSignatureRequest, NonceSharesRequest,
    PartialSignaturesRequest, PubKeySharesRequest, SignerService, SwapTxSignatureRequest,
};
use musig_trade_core::syncer::ConfirmationStream;
use musig_trade_core::trade::{ClosureType, Receiver, TradeId, TradeTerms};
use musig_trade_core::{Error, Res};

use async_trait::async_trait;
use bitcoin::Amount;

use std::sync::Arc;
use std::time::Duration;

type MockOrchestrator = TradeOrchestrator<Arc<MockSigner>, Arc<MockSigner>, Arc<MockChain>>;

fn terms() -> TradeTerms {
    TradeTerms {
        trade_amount: 200_000,
        buyers_security_deposit: 30_000,
        sellers_security_deposit: 30_000,
        deposit_tx_fee_rate: 50_000,
        prepared_tx_fee_rate: 40_000,
    }
}

fn receivers() -> Vec<Receiver> {
    vec![
        Receiver::new(
            "tb1pwxlp4v9v7v03nx0e7vunlc87d4936wnyqegw0fuahudypan64wys5stxh7",
            200_000,
        ),
        Receiver::new("tb1qpg889v22f3gefuvwpe3963t5a00nvfmkhlgqw5", 80_000),
        Receiver::new("2N2x2bA28AsLZZEHss4SjFoyToQV5YYZsJM", 12_345),
    ]
}

fn setup(
    chain: MockChain,
    config: TradeConfig,
) -> (MockOrchestrator, Arc<MockSigner>, Arc<MockSigner>) {
    let chain = Arc::new(chain);
    let buyer = Arc::new(MockSigner::new("buyer", chain.clone()));
    let seller = Arc::new(MockSigner::new("seller", chain.clone()));
    let orchestrator = TradeOrchestrator::new(buyer.clone(), seller.clone(), chain, config);
    (orchestrator, buyer, seller)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn message(report: &TradeReport, label: MessageLabel) -> PeerMessage {
    report
        .transcript
        .iter()
        .find(|entry| entry.message.label() == label)
        .map(|entry| entry.message.clone())
        .expect("message in transcript")
}

#[test]
fn scenario_amounts() {
    assert_eq!(Receiver::total(&receivers()), Some(Amount::from_sat(292_345)));
    assert_eq!(terms().total_locked(), Some(Amount::from_sat(260_000)));
}

#[tokio::test(start_paused = true)]
async fn cooperative_trade_closes_both_sides() {
    let (orchestrator, buyer, seller) = setup(MockChain::new(100), TradeConfig::default());
    let report = orchestrator
        .execute(
            TradeSetup::new(terms(), receivers()),
            ClosureType::Cooperative,
        )
        .await
        .expect("cooperative trade");

    assert_eq!(report.buyer.state, SessionState::Closed);
    assert_eq!(report.seller.state, SessionState::Closed);
    assert_eq!(report.buyer.closure, ClosureType::Cooperative);
    assert_eq!(report.seller.closure, ClosureType::Cooperative);
    assert_eq!(report.buyer.deposit_tx, report.seller.deposit_tx);
    assert!(report.buyer.trade_id.as_str().starts_with("buyer-trade-"));
    assert!(report.seller.trade_id.as_str().starts_with("seller-trade-"));

    let labels: Vec<MessageLabel> = report.transcript.iter().map(|e| e.message.label()).collect();
    use MessageLabel::*;
    assert_eq!(labels, vec![A, B, C, D, E, F, G]);
    assert!(report.transcript.iter().all(|e| e.delivered));

    // the seller closes with exactly the share the buyer's close returned
    let seller_journal = seller.journal().await;
    let seller_close = seller_journal.close_requests.last().expect("seller closed");
    assert_eq!(
        seller_close.my_output_peers_prv_key_share.as_ref(),
        Some(&report.buyer.close_response.peer_output_prv_key_share)
    );
    assert_eq!(
        report.seller.received_prv_key_share.as_ref(),
        Some(&report.buyer.close_response.peer_output_prv_key_share)
    );

    // and the buyer closes with message F, the seller's swap result share
    let buyer_journal = buyer.journal().await;
    let buyer_close = buyer_journal.close_requests.last().expect("buyer closed");
    match message(&report, F) {
        PeerMessage::F(f) => assert_eq!(
            buyer_close.my_output_peers_prv_key_share.as_ref(),
            Some(&f.peer_output_prv_key_share)
        ),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(buyer_close.swap_tx, None);
}

#[tokio::test(start_paused = true)]
async fn buyer_swap_share_is_withheld_until_message_e() {
    let (orchestrator, _, seller) = setup(MockChain::new(100), TradeConfig::default());
    let report = orchestrator
        .execute(
            TradeSetup::new(terms(), receivers()),
            ClosureType::Cooperative,
        )
        .await
        .expect("cooperative trade");

    let swap_share = match message(&report, MessageLabel::E) {
        PeerMessage::E(e) => e.swap_tx_input_partial_signature,
        other => panic!("unexpected {:?}", other),
    };
    assert!(!swap_share.is_empty());

    let c = report
        .transcript
        .iter()
        .find(|entry| entry.message.label() == MessageLabel::C)
        .expect("message C");
    assert_eq!(c.sender, Role::BuyerAsTaker);
    assert!(!contains(&c.payload, swap_share.as_bytes()));

    // the seller signs the deposit without the buyer's swap share
    let journal = seller.journal().await;
    let deposit_request = journal.deposit_requests.last().expect("deposit signed");
    assert!(deposit_request.peers_partial_signatures.is_redacted());
}

#[tokio::test(start_paused = true)]
async fn public_key_shares_reach_the_seller_unchanged() {
    let (orchestrator, _, seller) = setup(MockChain::new(7), TradeConfig::default());
    let report = orchestrator
        .execute(
            TradeSetup::new(terms(), receivers()),
            ClosureType::Cooperative,
        )
        .await
        .expect("cooperative trade");

    let sent = match message(&report, MessageLabel::A) {
        PeerMessage::A(a) => a.pub_key_shares,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(sent.current_block_height, 7);
    let journal = seller.journal().await;
    assert_eq!(journal.nonce_requests[0].peer_pub_key_shares, sent);
    assert_eq!(journal.nonce_requests[0].trade_terms, terms());
}

#[tokio::test(start_paused = true)]
async fn uncooperative_trade_force_closes() {
    let (orchestrator, buyer, seller) = setup(MockChain::new(100), TradeConfig::default());
    let report = orchestrator
        .execute(
            TradeSetup::new(terms(), receivers()),
            ClosureType::Uncooperative,
        )
        .await
        .expect("uncooperative trade");

    assert_eq!(report.seller.state, SessionState::ForceClosed);
    assert_eq!(report.buyer.state, SessionState::Closed);
    assert_eq!(report.buyer.closure, ClosureType::Uncooperative);
    assert_eq!(report.seller.received_prv_key_share, None);
    assert_eq!(report.buyer.received_prv_key_share, None);

    let seller_journal = seller.journal().await;
    let seller_close = seller_journal.close_requests.last().expect("seller closed");
    assert_eq!(seller_close.my_output_peers_prv_key_share, None);
    assert_eq!(seller_close.swap_tx, None);

    // the buyer recovers with the swap tx the seller signed
    let signed_swap_tx = report.seller.swap_tx.clone().expect("seller signed the swap tx");
    assert_eq!(report.buyer.swap_tx.as_ref(), Some(&signed_swap_tx));
    let buyer_journal = buyer.journal().await;
    let buyer_close = buyer_journal.close_requests.last().expect("buyer closed");
    assert_eq!(buyer_close.swap_tx.as_ref(), Some(&signed_swap_tx));
    assert_eq!(buyer_close.my_output_peers_prv_key_share, None);

    let f = report
        .transcript
        .iter()
        .find(|entry| entry.message.label() == MessageLabel::F)
        .expect("message F sent");
    assert!(!f.delivered);
    assert!(report
        .transcript
        .iter()
        .all(|entry| entry.message.label() != MessageLabel::G));
}

#[tokio::test(start_paused = true)]
async fn signers_serve_consecutive_trades() {
    let (orchestrator, _, _) = setup(MockChain::new(100), TradeConfig::default());
    for closure in [ClosureType::Cooperative, ClosureType::Uncooperative] {
        for _ in 0..2 {
            let report = orchestrator
                .execute(TradeSetup::new(terms(), receivers()), closure)
                .await
                .expect("trade");
            assert!(report.buyer.state.is_terminal());
            assert!(report.seller.state.is_terminal());
        }
    }
}

#[tokio::test(start_paused = true)]
async fn mismatched_terms_abort() {
    let (orchestrator, _, _) = setup(MockChain::new(100), TradeConfig::default());
    let mut trade = TradeSetup::new(terms(), receivers());
    trade.seller_terms.deposit_tx_fee_rate = 45_000;

    match orchestrator.execute(trade, ClosureType::Cooperative).await {
        Err(orchestrator::Error::Aborted {
            role,
            state,
            round,
            source: Error::TermsMismatch,
            ..
        }) => {
            assert_eq!(role, Role::BuyerAsTaker);
            assert_eq!(state, SessionState::NoncesReady);
            assert_eq!(round, Round::PartialSignatureExchange);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn truncated_confirmation_stream_times_out() {
    let config = TradeConfig {
        required_confirmations: 2,
        max_confirmation_attempts: 2,
        ..Default::default()
    };
    let (orchestrator, _, _) = setup(MockChain::new(100).with_max_stream_events(1), config);

    match orchestrator
        .execute(
            TradeSetup::new(terms(), receivers()),
            ClosureType::Cooperative,
        )
        .await
    {
        Err(orchestrator::Error::Aborted {
            round,
            source: Error::ConfirmationTimeout { attempts },
            ..
        }) => {
            assert_eq!(attempts, 2);
            assert_eq!(round, Round::DepositConfirmation);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn unavailable_signer_is_the_reported_cause() {
    let (orchestrator, _, seller) = setup(MockChain::new(100), TradeConfig::default());
    seller.set_available(false);

    match orchestrator
        .execute(
            TradeSetup::new(terms(), receivers()),
            ClosureType::Cooperative,
        )
        .await
    {
        Err(orchestrator::Error::Aborted {
            role,
            state,
            round,
            source: Error::SignerUnavailable(_),
            ..
        }) => {
            assert_eq!(role, Role::SellerAsMaker);
            assert_eq!(state, SessionState::Init);
            assert_eq!(round, Round::Initialization);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn invalid_config_is_rejected() {
    let config = TradeConfig {
        max_confirmation_attempts: 0,
        ..Default::default()
    };
    let (orchestrator, _, _) = setup(MockChain::new(100), config);
    assert!(matches!(
        orchestrator
            .execute(
                TradeSetup::new(terms(), receivers()),
                ClosureType::Cooperative
            )
            .await,
        Err(orchestrator::Error::Config(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn silent_seller_aborts_the_buyer() {
    let chain = Arc::new(MockChain::new(100));
    let signer = Arc::new(MockSigner::new("buyer", chain.clone()));
    let mut session = TradeSession::new(TradeId::new("buyer-trade-1"), Role::BuyerAsTaker, signer);
    // the seller endpoint stays open but never answers
    let (buyer_relay, _seller_relay) = InMemoryRelay::pair();
    let context = TradeContext {
        terms: terms(),
        receivers: receivers(),
        config: TradeConfig::default(),
    };

    let failure = protocol::run_buyer(
        &mut session,
        buyer_relay,
        chain.as_ref(),
        &PaymentSettled,
        &context,
    )
        .await
        .expect_err("no message B");
    assert_eq!(failure.round, Round::NonceExchange);
    assert!(matches!(
        failure.source,
        Error::PeerMessageMissing(MessageLabel::B)
    ));
    assert_eq!(session.state(), SessionState::KeysReady);
}

#[tokio::test(start_paused = true)]
async fn missing_swap_share_aborts_the_seller() {
    let chain = Arc::new(MockChain::new(100));
    let buyer_signer = Arc::new(MockSigner::new("buyer", chain.clone()));
    let seller_signer = Arc::new(MockSigner::new("seller", chain.clone()));
    let mut buyer = TradeSession::new(TradeId::new("b"), Role::BuyerAsTaker, buyer_signer);
    let mut seller = TradeSession::new(TradeId::new("s"), Role::SellerAsMaker, seller_signer);
    let (mut buyer_relay, seller_relay) = InMemoryRelay::pair();
    buyer_relay.discard(MessageLabel::E);
    let context = TradeContext {
        terms: terms(),
        receivers: receivers(),
        config: TradeConfig::default(),
    };

    let (buyer_res, seller_res) = tokio::join!(
        protocol::run_buyer(
            &mut buyer,
            buyer_relay,
            chain.as_ref(),
            &PaymentSettled,
            &context
        ),
        protocol::run_seller(&mut seller, seller_relay, &context),
    );

    let failure = seller_res.expect_err("no message E");
    assert_eq!(failure.round, Round::SwapSigning);
    assert!(matches!(
        failure.source,
        Error::PeerMessageMissing(MessageLabel::E)
    ));
    assert_eq!(seller.state(), SessionState::DepositConfirmed);
    // without the swap tx on-chain the buyer cannot recover either
    let failure = buyer_res.expect_err("no swap tx");
    assert!(matches!(failure.source, Error::SwapTxUnobserved));
    assert_eq!(buyer.state(), SessionState::DepositConfirmed);
}

/// Seller signer going offline when asked to sign the swap tx.
#[derive(Clone)]
struct SwapSignerOffline(Arc<MockSigner>);

#[async_trait]
impl SignerService for SwapSignerOffline {
    async fn init_trade(
        &self,
        request: PubKeySharesRequest,
    ) -> Result<PubKeyShareSet, signer::Error> {
        self.0.init_trade(request).await
    }

    async fn get_nonce_shares(
        &self,
        request: NonceSharesRequest,
    ) -> Result<NonceShareSet, signer::Error> {
        self.0.get_nonce_shares(request).await
    }

    async fn get_partial_signatures(
        &self,
        request: PartialSignaturesRequest,
    ) -> Result<PartialSignatureSet, signer::Error> {
        self.0.get_partial_signatures(request).await
    }

    async fn sign_deposit_tx(
        &self,
        request: DepositTxSignatureRequest,
    ) -> Result<DepositPsbt, signer::Error> {
        self.0.sign_deposit_tx(request).await
    }

    async fn publish_deposit_tx(
        &self,
        trade_id: &TradeId,
    ) -> Result<ConfirmationStream, signer::Error> {
        self.0.publish_deposit_tx(trade_id).await
    }

    async fn subscribe_tx_confirmation_status(
        &self,
        trade_id: &TradeId,
    ) -> Result<ConfirmationStream, signer::Error> {
        self.0.subscribe_tx_confirmation_status(trade_id).await
    }

    async fn sign_swap_tx(
        &self,
        _request: SwapTxSignatureRequest,
    ) -> Result<SwapTxSignatureResult, signer::Error> {
        Err(signer::Error::Unavailable("connection reset".into()))
    }

    async fn close_trade(
        &self,
        request: CloseTradeRequest,
    ) -> Result<CloseTradeResponse, signer::Error> {
        self.0.close_trade(request).await
    }
}

#[tokio::test(start_paused = true)]
async fn swap_signing_failure_is_reported_over_the_missing_swap_tx() {
    let chain = Arc::new(MockChain::new(100));
    let buyer = Arc::new(MockSigner::new("buyer", chain.clone()));
    let seller = SwapSignerOffline(Arc::new(MockSigner::new("seller", chain.clone())));
    let orchestrator = TradeOrchestrator::new(buyer, seller, chain, TradeConfig::default());

    match orchestrator
        .execute(
            TradeSetup::new(terms(), receivers()),
            ClosureType::Cooperative,
        )
        .await
    {
        Err(orchestrator::Error::Aborted {
            role,
            state,
            round,
            source: Error::SignerUnavailable(_),
            ..
        }) => {
            assert_eq!(role, Role::SellerAsMaker);
            assert_eq!(state, SessionState::DepositConfirmed);
            assert_eq!(round, Round::SwapSigning);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

/// Payment sent `delay` after the deposit confirmation, or never.
struct DelayedPayment(Option<Duration>);

#[async_trait]
impl PaymentConfirmation for DelayedPayment {
    async fn payment_sent(&self, _trade_id: &TradeId) -> Res<()> {
        match self.0 {
            Some(delay) => tokio::time::sleep(delay).await,
            None => futures::future::pending::<()>().await,
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn slow_payment_still_closes_cooperatively() {
    let config = TradeConfig::default();
    let (orchestrator, _, _) = setup(MockChain::new(100), config);
    let delay = config.peer_message_timeout() * 3;
    let orchestrator =
        orchestrator.with_payment_confirmation(Arc::new(DelayedPayment(Some(delay))));

    let report = orchestrator
        .execute(
            TradeSetup::new(terms(), receivers()),
            ClosureType::Cooperative,
        )
        .await
        .expect("cooperative trade after a slow payment");
    assert_eq!(report.buyer.state, SessionState::Closed);
    assert_eq!(report.seller.state, SessionState::Closed);
    assert_eq!(report.seller.closure, ClosureType::Cooperative);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_payment_withholds_message_e() {
    let config = TradeConfig {
        payment_timeout_ms: 120_000,
        ..Default::default()
    };
    let (orchestrator, _, _) = setup(MockChain::new(100), config);
    let orchestrator = orchestrator.with_payment_confirmation(Arc::new(DelayedPayment(None)));

    match orchestrator
        .execute(
            TradeSetup::new(terms(), receivers()),
            ClosureType::Cooperative,
        )
        .await
    {
        Err(orchestrator::Error::Aborted {
            role,
            state,
            round,
            source: Error::PaymentUnconfirmed,
            ..
        }) => {
            assert_eq!(role, Role::BuyerAsTaker);
            assert_eq!(state, SessionState::DepositConfirmed);
            assert_eq!(round, Round::SwapSigning);
        }
        other => panic!("unexpected result {:?}", other),
    }
}
