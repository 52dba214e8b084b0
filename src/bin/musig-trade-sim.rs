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


//! Simulate MuSig trades between two in-memory signers sharing a mock chain.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use musig_trade_core::config::TradeConfig;
use musig_trade_core::orchestrator::{TradeOrchestrator, TradeSetup};
use musig_trade_core::signer::mock::{MockChain, MockSigner};
use musig_trade_core::trade::{ClosureType, Receiver, TradeTerms};

#[derive(Parser, Debug)]
#[clap(name = "musig-trade-sim", about = "Run simulated MuSig trades end-to-end")]
struct Opts {
    /// Closure to simulate, both are run when omitted.
    #[clap(long)]
    closure: Option<ClosureType>,

    /// YAML configuration file.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Number of trades per closure type.
    #[clap(long, default_value = "1")]
    trades: u32,

    /// Height of the mock chain tip at start.
    #[clap(long, default_value = "800000")]
    start_height: u32,
}

fn mock_receivers() -> Vec<Receiver> {
    vec![
        Receiver::new(
            "tb1pwxlp4v9v7v03nx0e7vunlc87d4936wnyqegw0fuahudypan64wys5stxh7",
            200_000,
        ),
        Receiver::new("tb1qpg889v22f3gefuvwpe3963t5a00nvfmkhlgqw5", 80_000),
        Receiver::new("2N2x2bA28AsLZZEHss4SjFoyToQV5YYZsJM", 12_345),
    ]
}

fn mock_terms() -> TradeTerms {
    TradeTerms {
        trade_amount: 200_000,
        buyers_security_deposit: 30_000,
        sellers_security_deposit: 30_000,
        deposit_tx_fee_rate: 50_000,
        prepared_tx_fee_rate: 40_000,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let opts = Opts::parse();
    let config = match &opts.config {
        Some(path) => TradeConfig::from_file(path)?,
        None => TradeConfig::default(),
    };
    let closures = match opts.closure {
        Some(closure) => vec![closure],
        None => vec![ClosureType::Cooperative, ClosureType::Uncooperative],
    };

    let chain = Arc::new(MockChain::new(opts.start_height));
    let buyer = Arc::new(MockSigner::new("buyer", chain.clone()));
    let seller = Arc::new(MockSigner::new("seller", chain.clone()));
    let orchestrator = TradeOrchestrator::new(buyer, seller, chain, config);

    let mut failures = 0;
    for closure in closures {
        for _ in 0..opts.trades {
            let setup = TradeSetup::new(mock_terms(), mock_receivers());
            match orchestrator.execute(setup, closure).await {
                Ok(report) => info!(
                    "{} trade done: buyer {} ({}), seller {} ({}), {} messages",
                    closure,
                    report.buyer.state,
                    report.buyer.trade_id,
                    report.seller.state,
                    report.seller.trade_id,
                    report.transcript.len()
                ),
                Err(err) => {
                    error!("{} trade failed: {}", closure, err);
                    failures += 1;
                }
            }
        }
    }

    if failures > 0 {
        return Err(format!("{} trade(s) failed", failures).into());
    }
    Ok(())
}
