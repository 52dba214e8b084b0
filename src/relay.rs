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


//! Peer message transport. The protocol drivers only need an ordered, point-to-point channel to
//! the counterparty, described by [`PeerMessageRelay`]. [`InMemoryRelay`] connects the two parties
//! of a simulated trade through tokio channels carrying consensus encoded messages and keeps a
//! shared [`Transcript`] of everything sent.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::consensus;
use crate::protocol_message::{MessageLabel, PeerMessage};
use crate::role::Role;
use crate::{Error, Res};

/// Ordered, point-to-point channel to the counterparty.
#[async_trait]
pub trait PeerMessageRelay: Send {
    /// Send a message to the peer. A peer that went away is not an error for the sender.
    async fn send(&mut self, message: PeerMessage) -> Res<()>;

    /// Wait at most `timeout` for the next message, which must carry the `expected` label.
    async fn receive(&mut self, expected: MessageLabel, timeout: Duration) -> Res<PeerMessage>;
}

/// A message as handed to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub sender: Role,
    pub message: PeerMessage,
    /// The bytes put on the wire.
    pub payload: Vec<u8>,
    /// `false` when the relay dropped the message instead of delivering it.
    pub delivered: bool,
}

/// Log of every message sent through a pair of relays, shared by both endpoints.
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<TranscriptEntry>>>);

impl Transcript {
    pub async fn entries(&self) -> Vec<TranscriptEntry> {
        self.0.lock().await.clone()
    }

    /// The labels of the delivered messages, in sending order.
    pub async fn delivered_labels(&self) -> Vec<MessageLabel> {
        self.0
            .lock()
            .await
            .iter()
            .filter(|entry| entry.delivered)
            .map(|entry| entry.message.label())
            .collect()
    }

    async fn record(&self, entry: TranscriptEntry) {
        self.0.lock().await.push(entry);
    }
}

/// One endpoint of an in-memory relay pair.
#[derive(Debug)]
pub struct InMemoryRelay {
    role: Role,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    discarded: HashSet<MessageLabel>,
    transcript: Transcript,
}

impl InMemoryRelay {
    /// Create the connected buyer and seller endpoints.
    pub fn pair() -> (Self, Self) {
        let (to_seller, from_buyer) = mpsc::unbounded_channel();
        let (to_buyer, from_seller) = mpsc::unbounded_channel();
        let transcript = Transcript::default();
        let buyer = Self {
            role: Role::BuyerAsTaker,
            outbound: to_seller,
            inbound: from_seller,
            discarded: HashSet::new(),
            transcript: transcript.clone(),
        };
        let seller = Self {
            role: Role::SellerAsMaker,
            outbound: to_buyer,
            inbound: from_buyer,
            discarded: HashSet::new(),
            transcript,
        };
        (buyer, seller)
    }

    /// Silently drop every message with `label` sent from this endpoint.
    pub fn discard(&mut self, label: MessageLabel) {
        self.discarded.insert(label);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }
}

#[async_trait]
impl PeerMessageRelay for InMemoryRelay {
    async fn send(&mut self, message: PeerMessage) -> Res<()> {
        let label = message.label();
        let payload = consensus::serialize(&message)?;
        let delivered = !self.discarded.contains(&label);
        trace!(sender = %self.role, %label, bytes = payload.len(), "sending peer message");
        self.transcript
            .record(TranscriptEntry {
                sender: self.role,
                message,
                payload: payload.clone(),
                delivered,
            })
            .await;
        if !delivered {
            debug!(sender = %self.role, %label, "peer message discarded");
            return Ok(());
        }
        if self.outbound.send(payload).is_err() {
            warn!(sender = %self.role, %label, "peer is gone, message {} not delivered", label);
        }
        Ok(())
    }

    async fn receive(&mut self, expected: MessageLabel, timeout: Duration) -> Res<PeerMessage> {
        let payload = match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(receiver = %self.role, %expected, "peer closed the relay");
                return Err(Error::PeerMessageMissing(expected));
            }
            Err(_) => {
                debug!(receiver = %self.role, %expected, "no peer message after {:?}", timeout);
                return Err(Error::PeerMessageMissing(expected));
            }
        };
        let message: PeerMessage = consensus::deserialize(&payload)?;
        if message.label() != expected {
            return Err(Error::UnexpectedMessage {
                expected,
                received: message.label(),
            });
        }
        Ok(message)
    }
}
