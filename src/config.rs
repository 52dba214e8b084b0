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


//! Runtime configuration of the protocol drivers. Every field has a default, a configuration file
//! only lists what it overrides:
//!
//! ```yaml
//! required_confirmations: 2
//! cooperative_close_timeout_ms: 5000
//! ```

use thiserror::Error;

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::syncer::ConfirmationPolicy;

/// Errors raised while loading a configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Timeouts and confirmation depth used by both parties of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TradeConfig {
    /// Depth at which the deposit tx is considered confirmed.
    pub required_confirmations: u32,
    /// Deadline of one confirmation subscription.
    pub confirmation_wait_ms: u64,
    /// Subscriptions consumed before reporting a confirmation timeout.
    pub max_confirmation_attempts: u32,
    /// Deadline for each required peer message, A to D.
    pub peer_message_timeout_ms: u64,
    /// Deadline for the buyer's payment, bounding both the payment confirmation and the wait for
    /// message E.
    pub payment_timeout_ms: u64,
    /// Deadline for the cooperative closure messages F and G.
    pub cooperative_close_timeout_ms: u64,
    /// Deadline for the buyer to observe the swap tx after a missing F.
    pub swap_tx_timeout_ms: u64,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            required_confirmations: 1,
            confirmation_wait_ms: 30_000,
            max_confirmation_attempts: 3,
            peer_message_timeout_ms: 30_000,
            payment_timeout_ms: 86_400_000,
            cooperative_close_timeout_ms: 10_000,
            swap_tx_timeout_ms: 60_000,
        }
    }
}

impl TradeConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(s: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.required_confirmations == 0 {
            return Err(Error::Invalid("required_confirmations must be at least 1"));
        }
        if self.max_confirmation_attempts == 0 {
            return Err(Error::Invalid("max_confirmation_attempts must be at least 1"));
        }
        if self.confirmation_wait_ms == 0
            || self.peer_message_timeout_ms == 0
            || self.payment_timeout_ms == 0
            || self.cooperative_close_timeout_ms == 0
            || self.swap_tx_timeout_ms == 0
        {
            return Err(Error::Invalid("timeouts must be positive"));
        }
        Ok(())
    }

    pub fn peer_message_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_message_timeout_ms)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_millis(self.payment_timeout_ms)
    }

    pub fn cooperative_close_timeout(&self) -> Duration {
        Duration::from_millis(self.cooperative_close_timeout_ms)
    }

    pub fn swap_tx_timeout(&self) -> Duration {
        Duration::from_millis(self.swap_tx_timeout_ms)
    }

    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            required_confirmations: self.required_confirmations,
            wait: Duration::from_millis(self.confirmation_wait_ms),
            max_attempts: self.max_confirmation_attempts,
        }
    }
}
