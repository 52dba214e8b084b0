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

//! MuSig trade core library: the protocol state machine driving a two-party, non-custodial
//! bitcoin trade secured by 2-of-2 collaborative signatures.
//!
//! A buyer (taker) and a seller (maker) each own a [`session::TradeSession`] wrapping their own
//! [`signer::SignerService`]. The sessions exchange the protocol messages A to G defined in
//! [`protocol_message`] through a [`relay::PeerMessageRelay`], wait for the deposit confirmation
//! with a [`syncer::ConfirmationWatcher`], and close the trade cooperatively or not. The
//! [`orchestrator::TradeOrchestrator`] runs both parties of a trade concurrently.

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate serde;

use thiserror::Error;

#[macro_use]
pub mod consensus;

pub mod bundle;
pub mod config;
pub mod datum;
pub mod orchestrator;
pub mod protocol;
pub mod protocol_message;
pub mod relay;
pub mod role;
pub mod session;
pub mod signer;
pub mod syncer;
pub mod trade;

use crate::protocol_message::MessageLabel;
use crate::session::{Operation, SessionState};
use crate::trade::TradeId;

/// A list of possible errors when running a MuSig trade session. Signer failures are mapped onto
/// the protocol level variants, any other failure keeps its origin.
#[derive(Error, Debug)]
pub enum Error {
    /// The session (or the signer's trade) has already been initialized.
    #[error("Trade {0} is already initialized")]
    AlreadyInitialized(TradeId),
    /// An operation was called out of round order.
    #[error("Operation {operation} is not allowed in state {state}")]
    InvalidState {
        /// The rejected operation.
        operation: Operation,
        /// The state the session was in.
        state: SessionState,
    },
    /// The economic terms supplied by the peer disagree with ours, detected by the signer.
    #[error("Trade terms mismatch with the counterparty")]
    TermsMismatch,
    /// The signer backend cannot be reached or failed to serve the request.
    #[error("Signer unavailable: {0}")]
    SignerUnavailable(String),
    /// The deposit confirmation stream ended, or the wait expired, without reaching the required
    /// depth on every attempt.
    #[error("Deposit not confirmed after {attempts} subscription attempt(s)")]
    ConfirmationTimeout {
        /// Number of subscriptions consumed.
        attempts: u32,
    },
    /// An expected peer message never arrived.
    #[error("Peer message {0} is missing")]
    PeerMessageMissing(MessageLabel),
    /// The relay delivered a message other than the one expected in this round.
    #[error("Unexpected peer message {received}, expected {expected}")]
    UnexpectedMessage {
        /// The label the round waits for.
        expected: MessageLabel,
        /// The label actually received.
        received: MessageLabel,
    },
    /// The buyer's payment was not confirmed in time, message E is withheld.
    #[error("Payment not confirmed in time")]
    PaymentUnconfirmed,
    /// The swap transaction was never observed spending the deposit.
    #[error("Swap transaction not observed on-chain")]
    SwapTxUnobserved,
    /// Any other signer rejection.
    #[error("Signer error: {0}")]
    Signer(signer::Error),
    /// A consensus error while encoding or decoding a peer message.
    #[error("Consensus error: {0}")]
    Consensus(#[from] consensus::Error),
}

impl From<signer::Error> for Error {
    fn from(err: signer::Error) -> Self {
        match err {
            signer::Error::AlreadyInitialized(id) => Error::AlreadyInitialized(id),
            signer::Error::TermsMismatch => Error::TermsMismatch,
            signer::Error::Unavailable(reason) => Error::SignerUnavailable(reason),
            other => Error::Signer(other),
        }
    }
}

/// Result type used across the library.
pub type Res<T> = Result<T, Error>;
