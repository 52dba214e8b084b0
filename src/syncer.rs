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


//! Syncers keep a session in sync with the blockchain: a [`ConfirmationWatcher`] consumes the
//! deposit confirmation stream returned by the signer until the required depth is reached, a
//! [`SpendWatcher`] reports the swap transaction once it spends the deposit.
//!
//! Every wait is bounded. Dropping the future returned by a watcher cancels the wait.

use async_trait::async_trait;
use bitcoin::Txid;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tracing::debug;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::datum::RawTx;
use crate::signer;

/// Errors encountered while watching the chain.
#[derive(Error, Debug)]
pub enum Error {
    /// The stream terminated before the required depth was reached.
    #[error("Confirmation stream ended before the required depth")]
    StreamEnded,
    /// The wait deadline elapsed.
    #[error("Wait expired after {0:?}")]
    Elapsed(Duration),
    /// The signer failed while producing the stream.
    #[error("Signer error: {0}")]
    Signer(#[from] signer::Error),
}

/// A confirmation status of the deposit transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationEvent {
    /// The raw deposit transaction.
    pub tx: RawTx,
    pub current_block_height: u32,
    pub num_confirmations: u32,
}

impl fmt::Display for ConfirmationEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} confirmation(s) at height {}",
            self.num_confirmations, self.current_block_height
        )
    }
}

/// Lazy, potentially unbounded stream of deposit confirmation statuses.
pub type ConfirmationStream = BoxStream<'static, Result<ConfirmationEvent, signer::Error>>;

/// How long and how often a session waits for its deposit to confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    /// Depth at which the deposit is considered confirmed.
    pub required_confirmations: u32,
    /// Deadline for one subscription.
    pub wait: Duration,
    /// Number of subscriptions consumed before giving up, at least one.
    pub max_attempts: u32,
}

/// Consumes one confirmation subscription. Consumption is sequential and not restartable, a new
/// watcher on a new subscription is needed after a failure.
pub struct ConfirmationWatcher {
    stream: ConfirmationStream,
    required_confirmations: u32,
    wait: Duration,
}

impl ConfirmationWatcher {
    pub fn new(stream: ConfirmationStream, policy: &ConfirmationPolicy) -> Self {
        Self {
            stream,
            required_confirmations: policy.required_confirmations,
            wait: policy.wait,
        }
    }

    /// Wait for the first event reaching the required depth.
    pub async fn wait_for_confirmation(self) -> Result<ConfirmationEvent, Error> {
        let ConfirmationWatcher {
            mut stream,
            required_confirmations,
            wait,
        } = self;
        let consume = async move {
            while let Some(event) = stream.next().await {
                let event = event?;
                debug!(
                    confirmations = event.num_confirmations,
                    height = event.current_block_height,
                    "deposit confirmation status"
                );
                if event.num_confirmations >= required_confirmations {
                    return Ok(event);
                }
            }
            Err(Error::StreamEnded)
        };
        match tokio::time::timeout(wait, consume).await {
            Ok(res) => res,
            Err(_) => Err(Error::Elapsed(wait)),
        }
    }
}

/// Observes the chain for the swap transaction spending a deposit. Callers bound the wait.
#[async_trait]
pub trait SpendWatcher: Send + Sync {
    /// Resolve to the raw swap transaction once it spends the deposit `deposit_txid`.
    async fn watch_swap_tx(&self, deposit_txid: Txid) -> Result<RawTx, Error>;
}

#[async_trait]
impl<T> SpendWatcher for Arc<T>
where
    T: SpendWatcher + ?Sized,
{
    async fn watch_swap_tx(&self, deposit_txid: Txid) -> Result<RawTx, Error> {
        (**self).watch_swap_tx(deposit_txid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn event(num_confirmations: u32) -> Result<ConfirmationEvent, signer::Error> {
        Ok(ConfirmationEvent {
            tx: RawTx::new(vec![0x01]),
            current_block_height: 100 + num_confirmations,
            num_confirmations,
        })
    }

    fn policy(required_confirmations: u32) -> ConfirmationPolicy {
        ConfirmationPolicy {
            required_confirmations,
            wait: Duration::from_secs(60),
            max_attempts: 1,
        }
    }

    #[tokio::test]
    async fn stops_at_the_first_sufficient_event() {
        let events = stream::iter(vec![event(0), event(1), event(2), event(3)]).boxed();
        let res = ConfirmationWatcher::new(events, &policy(2))
            .wait_for_confirmation()
            .await
            .unwrap();
        assert_eq!(res.num_confirmations, 2);
    }

    #[tokio::test]
    async fn ended_stream_is_reported() {
        let events = stream::iter(vec![event(0), event(1)]).boxed();
        let res = ConfirmationWatcher::new(events, &policy(2))
            .wait_for_confirmation()
            .await;
        assert!(matches!(res, Err(Error::StreamEnded)));
    }

    #[tokio::test]
    async fn signer_failure_is_propagated() {
        let events = stream::iter(vec![
            event(0),
            Err(signer::Error::Unavailable("connection reset".into())),
        ])
        .boxed();
        let res = ConfirmationWatcher::new(events, &policy(1))
            .wait_for_confirmation()
            .await;
        assert!(matches!(res, Err(Error::Signer(signer::Error::Unavailable(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_is_bounded_by_the_deadline() {
        let events = stream::pending::<Result<ConfirmationEvent, signer::Error>>().boxed();
        let res = ConfirmationWatcher::new(events, &policy(1))
            .wait_for_confirmation()
            .await;
        assert!(matches!(res, Err(Error::Elapsed(d)) if d == Duration::from_secs(60)));
    }
}
