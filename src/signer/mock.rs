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


//! In-memory signer and chain used by the simulator binary and the tests.
//!
//! [`MockChain`] keeps a block height, the published deposits and the swap transactions spending
//! them, and streams confirmation statuses to subscribers. [`MockSigner`] derives every share from
//! Keccak hashes of a per-signer seed, so the peer can check what it receives without any real
//! cryptography. Nothing here is secure, it only behaves like a signer would.

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::Txid;
use futures::stream::{self, StreamExt};
use tiny_keccak::{Hasher, Keccak};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{
    CloseTradeRequest, DepositTxSignatureRequest, Error, NonceSharesRequest,
    PartialSignaturesRequest, PubKeySharesRequest, SignerService, SwapTxSignatureRequest,
};
use crate::bundle::{
    CloseTradeResponse, DepositPsbt, NonceShareSet, PartialSignatureSet, PubKeyShareSet,
    SwapTxSignatureResult,
};
use crate::datum::{NonceShare, PartialSignature, PrvKeyShare, Psbt, PubKeyShare, RawTx};
use crate::role::Role;
use crate::syncer::{self, ConfirmationEvent, ConfirmationStream, SpendWatcher};
use crate::trade::{Receiver, TradeId, TradeTerms};

const DEPOSIT_TX_PREFIX: &[u8] = b"deposit";
const SWAP_TX_PREFIX: &[u8] = b"swap";

fn keccak(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

fn pub_key_share(prv: &[u8]) -> PubKeyShare {
    let mut bytes = vec![0x02];
    bytes.extend_from_slice(&keccak(&[b"pub", prv]));
    PubKeyShare::new(bytes)
}

#[derive(Debug, Clone, Default)]
struct ChainState {
    tip: u32,
    /// Published deposits with the height of the block including them.
    deposits: HashMap<Txid, (RawTx, u32)>,
    /// Swap transactions, keyed by the deposit they spend.
    spends: HashMap<Txid, RawTx>,
}

impl ChainState {
    fn event(&self, txid: &Txid) -> Option<ConfirmationEvent> {
        self.deposits.get(txid).map(|(tx, height)| {
            let num_confirmations = if self.tip >= *height {
                self.tip - height + 1
            } else {
                0
            };
            ConfirmationEvent {
                tx: tx.clone(),
                current_block_height: self.tip,
                num_confirmations,
            }
        })
    }
}

/// A toy chain shared by both signers of a simulated trade.
#[derive(Debug)]
pub struct MockChain {
    state: watch::Sender<ChainState>,
    blocks_per_publish: u32,
    max_stream_events: Option<usize>,
}

impl MockChain {
    /// Create a chain at height `tip`. Publishing a transaction mines one block.
    pub fn new(tip: u32) -> Self {
        let (state, _) = watch::channel(ChainState {
            tip,
            ..Default::default()
        });
        Self {
            state,
            blocks_per_publish: 1,
            max_stream_events: None,
        }
    }

    /// Number of blocks mined right after a deposit is published, zero leaves it in the mempool.
    pub fn with_blocks_per_publish(mut self, blocks: u32) -> Self {
        self.blocks_per_publish = blocks;
        self
    }

    /// End every confirmation stream after `events` statuses.
    pub fn with_max_stream_events(mut self, events: usize) -> Self {
        self.max_stream_events = Some(events);
        self
    }

    pub fn tip(&self) -> u32 {
        self.state.borrow().tip
    }

    /// Publish a deposit transaction. Publishing the same transaction again is a no-op.
    pub fn publish(&self, tx: RawTx) -> Txid {
        let txid = tx.txid();
        let blocks = self.blocks_per_publish;
        self.state.send_modify(|state| {
            if state.deposits.contains_key(&txid) {
                return;
            }
            let height = state.tip + 1;
            state.deposits.insert(txid, (tx, height));
            state.tip += blocks;
        });
        debug!(%txid, "deposit tx published");
        txid
    }

    /// Mine `blocks` empty blocks.
    pub fn mine(&self, blocks: u32) {
        self.state.send_modify(|state| state.tip += blocks);
    }

    /// Publish `swap_tx` as the spend of the deposit `deposit_txid`.
    pub fn publish_spend(&self, deposit_txid: Txid, swap_tx: RawTx) {
        self.state.send_modify(|state| {
            state.spends.entry(deposit_txid).or_insert(swap_tx);
        });
        debug!(%deposit_txid, "swap tx published");
    }

    pub fn is_published(&self, txid: &Txid) -> bool {
        self.state.borrow().deposits.contains_key(txid)
    }

    /// Stream the confirmation status of `txid`, one event per change of its depth. The stream
    /// waits until the transaction is published.
    pub fn confirmations(&self, txid: Txid) -> ConfirmationStream {
        let receiver = self.state.subscribe();
        let max_events = self.max_stream_events;
        stream::unfold(
            (receiver, None::<u32>, 0usize),
            move |(mut receiver, last, emitted)| async move {
                if max_events.map_or(false, |max| emitted >= max) {
                    return None;
                }
                loop {
                    let event = receiver.borrow_and_update().event(&txid);
                    if let Some(event) = event {
                        if last != Some(event.num_confirmations) {
                            let depth = event.num_confirmations;
                            return Some((Ok(event), (receiver, Some(depth), emitted + 1)));
                        }
                    }
                    if receiver.changed().await.is_err() {
                        return None;
                    }
                }
            },
        )
        .boxed()
    }
}

#[async_trait]
impl SpendWatcher for MockChain {
    async fn watch_swap_tx(&self, deposit_txid: Txid) -> Result<RawTx, syncer::Error> {
        let mut receiver = self.state.subscribe();
        loop {
            let spend = receiver.borrow_and_update().spends.get(&deposit_txid).cloned();
            if let Some(swap_tx) = spend {
                return Ok(swap_tx);
            }
            if receiver.changed().await.is_err() {
                return Err(syncer::Error::StreamEnded);
            }
        }
    }
}

/// Requests received by a [`MockSigner`], in order.
#[derive(Debug, Clone, Default)]
pub struct SignerJournal {
    pub nonce_requests: Vec<NonceSharesRequest>,
    pub deposit_requests: Vec<DepositTxSignatureRequest>,
    pub close_requests: Vec<CloseTradeRequest>,
}

#[derive(Debug)]
struct MockTrade {
    role: Role,
    buyer_output_prv: [u8; 32],
    seller_output_prv: [u8; 32],
    peer_pub_key_shares: Option<PubKeyShareSet>,
    terms: Option<TradeTerms>,
    my_nonces: Option<NonceShareSet>,
    peer_nonces: Option<NonceShareSet>,
    my_partials: Option<PartialSignatureSet>,
    deposit_tx: Option<RawTx>,
    swap_tx: Option<RawTx>,
    closed: bool,
}

impl MockTrade {
    fn my_output_prv(&self) -> &[u8; 32] {
        match self.role {
            Role::BuyerAsTaker => &self.buyer_output_prv,
            Role::SellerAsMaker => &self.seller_output_prv,
        }
    }

    fn peer_output_prv(&self) -> &[u8; 32] {
        match self.role {
            Role::BuyerAsTaker => &self.seller_output_prv,
            Role::SellerAsMaker => &self.buyer_output_prv,
        }
    }

    fn deposit_txid(&self) -> Result<Txid, Error> {
        self.deposit_tx
            .as_ref()
            .map(RawTx::txid)
            .ok_or_else(|| Error::InvalidState("deposit tx not signed".to_string()))
    }

    fn nonces(&self) -> Result<(&NonceShareSet, &NonceShareSet), Error> {
        match (&self.my_nonces, &self.peer_nonces) {
            (Some(mine), Some(peer)) => Ok((mine, peer)),
            _ => Err(Error::InvalidState(
                "nonce shares not exchanged".to_string(),
            )),
        }
    }
}

/// Partial signature of `signer_nonce` over one input, checkable by the holder of the other nonce.
fn partial_signature(
    kind: &[u8],
    signer_nonce: &NonceShare,
    other_nonce: &NonceShare,
) -> PartialSignature {
    PartialSignature::new(
        keccak(&[b"sig", kind, signer_nonce.as_bytes(), other_nonce.as_bytes()]).to_vec(),
    )
}

/// A deterministic in-memory signer. Each party uses its own instance.
#[derive(Debug)]
pub struct MockSigner {
    seed: String,
    chain: Arc<MockChain>,
    available: AtomicBool,
    trades: Mutex<HashMap<TradeId, MockTrade>>,
    journal: Mutex<SignerJournal>,
}

impl MockSigner {
    /// Create a signer deriving its material from `seed` and publishing to `chain`.
    pub fn new(seed: impl Into<String>, chain: Arc<MockChain>) -> Self {
        Self {
            seed: seed.into(),
            chain,
            available: AtomicBool::new(true),
            trades: Mutex::new(HashMap::new()),
            journal: Mutex::new(SignerJournal::default()),
        }
    }

    /// Make every subsequent call fail with [`Error::Unavailable`], or recover.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn journal(&self) -> SignerJournal {
        self.journal.lock().await.clone()
    }

    pub fn chain(&self) -> &Arc<MockChain> {
        &self.chain
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable(format!("signer {} is offline", self.seed)))
        }
    }

    fn derive(&self, label: &[u8], trade_id: &TradeId) -> [u8; 32] {
        keccak(&[label, self.seed.as_bytes(), trade_id.as_str().as_bytes()])
    }
}

macro_rules! trade_mut {
    ($trades:expr, $trade_id:expr) => {
        $trades
            .get_mut($trade_id)
            .ok_or_else(|| Error::UnknownTrade($trade_id.clone()))?
    };
}

#[async_trait]
impl SignerService for MockSigner {
    async fn init_trade(&self, request: PubKeySharesRequest) -> Result<PubKeyShareSet, Error> {
        self.check_available()?;
        let mut trades = self.trades.lock().await;
        if trades.contains_key(&request.trade_id) {
            return Err(Error::AlreadyInitialized(request.trade_id));
        }
        let trade = MockTrade {
            role: request.my_role,
            buyer_output_prv: self.derive(b"buyer-output", &request.trade_id),
            seller_output_prv: self.derive(b"seller-output", &request.trade_id),
            peer_pub_key_shares: None,
            terms: None,
            my_nonces: None,
            peer_nonces: None,
            my_partials: None,
            deposit_tx: None,
            swap_tx: None,
            closed: false,
        };
        let shares = PubKeyShareSet {
            buyer_output_pub_key_share: pub_key_share(&trade.buyer_output_prv),
            seller_output_pub_key_share: pub_key_share(&trade.seller_output_prv),
            current_block_height: self.chain.tip(),
        };
        info!(trade_id = %request.trade_id, role = %request.my_role, "trade initialized");
        trades.insert(request.trade_id, trade);
        Ok(shares)
    }

    async fn get_nonce_shares(&self, request: NonceSharesRequest) -> Result<NonceShareSet, Error> {
        self.check_available()?;
        self.journal.lock().await.nonce_requests.push(request.clone());
        let fingerprint = request
            .trade_terms
            .fingerprint()
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        let mut trades = self.trades.lock().await;
        let trade = trade_mut!(trades, &request.trade_id);
        if trade.my_nonces.is_some() {
            return Err(Error::InvalidState("nonce shares already derived".to_string()));
        }
        let peer = &request.peer_pub_key_shares;
        if peer.buyer_output_pub_key_share.is_empty() || peer.seller_output_pub_key_share.is_empty()
        {
            return Err(Error::InvalidRequest("empty peer public-key share".to_string()));
        }

        let mut half_deposit = fingerprint.as_bytes().to_vec();
        half_deposit.extend_from_slice(&keccak(&[b"half-deposit", trade.my_output_prv()]));
        let nonce = |kind: &[u8]| {
            NonceShare::new(keccak(&[b"nonce", kind, trade.my_output_prv()]).to_vec())
        };
        let nonces = NonceShareSet {
            half_deposit_psbt: Psbt::new(half_deposit),
            deposit_tx_input_nonce_share: nonce(b"deposit"),
            swap_tx_input_nonce_share: nonce(b"swap"),
        };
        trade.peer_pub_key_shares = Some(request.peer_pub_key_shares);
        trade.terms = Some(request.trade_terms);
        trade.my_nonces = Some(nonces.clone());
        Ok(nonces)
    }

    async fn get_partial_signatures(
        &self,
        request: PartialSignaturesRequest,
    ) -> Result<PartialSignatureSet, Error> {
        self.check_available()?;
        let mut trades = self.trades.lock().await;
        let trade = trade_mut!(trades, &request.trade_id);
        let terms = trade
            .terms
            .ok_or_else(|| Error::InvalidState("nonce shares not derived".to_string()))?;
        if trade.my_partials.is_some() {
            return Err(Error::InvalidState(
                "partial signatures already derived".to_string(),
            ));
        }
        let fingerprint = terms
            .fingerprint()
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        if !request
            .peers_nonce_shares
            .half_deposit_psbt
            .as_bytes()
            .starts_with(fingerprint.as_bytes())
        {
            return Err(Error::TermsMismatch);
        }
        if request.receivers.is_empty() {
            return Err(Error::InvalidRequest("no receivers".to_string()));
        }
        if Receiver::total(&request.receivers).is_none() {
            return Err(Error::InvalidRequest("receiver amounts overflow".to_string()));
        }

        trade.peer_nonces = Some(request.peers_nonce_shares);
        let (mine, peer) = trade.nonces()?;
        let partials = PartialSignatureSet {
            deposit_tx_input_partial_signature: partial_signature(
                b"deposit",
                &mine.deposit_tx_input_nonce_share,
                &peer.deposit_tx_input_nonce_share,
            ),
            swap_tx_input_partial_signature: Some(partial_signature(
                b"swap",
                &mine.swap_tx_input_nonce_share,
                &peer.swap_tx_input_nonce_share,
            )),
        };
        trade.my_partials = Some(partials.clone());
        Ok(partials)
    }

    async fn sign_deposit_tx(
        &self,
        request: DepositTxSignatureRequest,
    ) -> Result<DepositPsbt, Error> {
        self.check_available()?;
        self.journal.lock().await.deposit_requests.push(request.clone());
        let mut trades = self.trades.lock().await;
        let trade = trade_mut!(trades, &request.trade_id);
        if trade.my_partials.is_none() {
            return Err(Error::InvalidState(
                "partial signatures not derived".to_string(),
            ));
        }
        let (mine, peer) = trade.nonces()?;
        let peers = &request.peers_partial_signatures;
        let expected = partial_signature(
            b"deposit",
            &peer.deposit_tx_input_nonce_share,
            &mine.deposit_tx_input_nonce_share,
        );
        if peers.deposit_tx_input_partial_signature != expected {
            return Err(Error::InvalidRequest(
                "invalid deposit partial signature".to_string(),
            ));
        }
        if trade.role.is_taker() && peers.is_redacted() {
            return Err(Error::InvalidRequest(
                "peer swap partial signature missing".to_string(),
            ));
        }

        let (a, b) = (
            mine.half_deposit_psbt.as_bytes(),
            peer.half_deposit_psbt.as_bytes(),
        );
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let deposit_tx = RawTx::new([DEPOSIT_TX_PREFIX, low, high].concat());
        let mut psbt = deposit_tx.as_bytes().to_vec();
        psbt.extend_from_slice(peers.deposit_tx_input_partial_signature.as_bytes());
        debug!(trade_id = %request.trade_id, txid = %deposit_tx.txid(), "deposit tx signed");
        trade.deposit_tx = Some(deposit_tx);
        Ok(DepositPsbt {
            deposit_psbt: Psbt::new(psbt),
        })
    }

    async fn publish_deposit_tx(&self, trade_id: &TradeId) -> Result<ConfirmationStream, Error> {
        self.check_available()?;
        let mut trades = self.trades.lock().await;
        let trade = trade_mut!(trades, trade_id);
        let deposit_tx = trade
            .deposit_tx
            .clone()
            .ok_or_else(|| Error::InvalidState("deposit tx not signed".to_string()))?;
        let txid = self.chain.publish(deposit_tx);
        Ok(self.chain.confirmations(txid))
    }

    async fn subscribe_tx_confirmation_status(
        &self,
        trade_id: &TradeId,
    ) -> Result<ConfirmationStream, Error> {
        self.check_available()?;
        let mut trades = self.trades.lock().await;
        let trade = trade_mut!(trades, trade_id);
        let txid = trade.deposit_txid()?;
        Ok(self.chain.confirmations(txid))
    }

    async fn sign_swap_tx(
        &self,
        request: SwapTxSignatureRequest,
    ) -> Result<SwapTxSignatureResult, Error> {
        self.check_available()?;
        let mut trades = self.trades.lock().await;
        let trade = trade_mut!(trades, &request.trade_id);
        if !trade.role.is_maker() {
            return Err(Error::InvalidRequest(
                "only the maker signs the swap tx".to_string(),
            ));
        }
        let deposit_txid = trade.deposit_txid()?;
        let (mine, peer) = trade.nonces()?;
        let expected = partial_signature(
            b"swap",
            &peer.swap_tx_input_nonce_share,
            &mine.swap_tx_input_nonce_share,
        );
        if request.swap_tx_input_peers_partial_signature != expected {
            return Err(Error::InvalidRequest(
                "invalid swap partial signature".to_string(),
            ));
        }
        let own = partial_signature(
            b"swap",
            &mine.swap_tx_input_nonce_share,
            &peer.swap_tx_input_nonce_share,
        );
        let swap_tx = RawTx::new(
            [
                SWAP_TX_PREFIX,
                &deposit_txid.into_inner()[..],
                own.as_bytes(),
                expected.as_bytes(),
            ]
            .concat(),
        );
        trade.swap_tx = Some(swap_tx.clone());
        Ok(SwapTxSignatureResult {
            swap_tx,
            peer_output_prv_key_share: PrvKeyShare::new(trade.peer_output_prv().to_vec()),
        })
    }

    async fn close_trade(&self, request: CloseTradeRequest) -> Result<CloseTradeResponse, Error> {
        self.check_available()?;
        self.journal.lock().await.close_requests.push(request.clone());
        let mut trades = self.trades.lock().await;
        let trade = trade_mut!(trades, &request.trade_id);
        if trade.closed {
            return Err(Error::InvalidState("trade already closed".to_string()));
        }
        let deposit_txid = trade.deposit_txid()?;

        match (&request.my_output_peers_prv_key_share, &request.swap_tx) {
            (Some(share), _) => {
                let peer = trade
                    .peer_pub_key_shares
                    .as_ref()
                    .ok_or_else(|| Error::InvalidState("no peer key shares".to_string()))?;
                let expected = match trade.role {
                    Role::BuyerAsTaker => &peer.buyer_output_pub_key_share,
                    Role::SellerAsMaker => &peer.seller_output_pub_key_share,
                };
                if &pub_key_share(share.as_bytes()) != expected {
                    return Err(Error::InvalidRequest(
                        "private-key share does not match the peer's public-key share".to_string(),
                    ));
                }
                info!(trade_id = %request.trade_id, "trade closed cooperatively");
            }
            (None, Some(swap_tx)) => {
                let prefix = [SWAP_TX_PREFIX, &deposit_txid.into_inner()[..]].concat();
                if !swap_tx.as_bytes().starts_with(&prefix) {
                    return Err(Error::InvalidRequest(
                        "swap tx does not spend the deposit".to_string(),
                    ));
                }
                info!(trade_id = %request.trade_id, "trade closed from the swap tx");
            }
            (None, None) => {
                let swap_tx = trade
                    .swap_tx
                    .clone()
                    .ok_or_else(|| Error::InvalidState("swap tx not signed".to_string()))?;
                self.chain.publish_spend(deposit_txid, swap_tx);
                info!(trade_id = %request.trade_id, "trade force-closed, swap tx published");
            }
        }
        trade.closed = true;
        Ok(CloseTradeResponse {
            peer_output_prv_key_share: PrvKeyShare::new(trade.peer_output_prv().to_vec()),
        })
    }
}
