// Copyright 2025 Waypoint Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use waypoint::config::GatewayConfig;
use waypoint::filter::FilterRegistry;
use waypoint::limiter::{KeyResolverRegistry, RequestRateLimiterFactory, TokenBucketLimiter};
use waypoint::metrics::NoopObserver;
use waypoint::predicate::PredicateRegistry;
use waypoint::routes::RouteTable;

/// Waypoint - validate gateway route rules and dump the assembled route table
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    // Load configuration
    let config = match GatewayConfig::from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from {}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    config.validate()?;

    // Build the table exactly as a gateway host would, so every
    // predicate and filter argument is checked, not just the syntax
    let mut filters = FilterRegistry::with_builtins();
    filters.register(Arc::new(RequestRateLimiterFactory::new(
        Arc::new(TokenBucketLimiter::new()),
        Arc::new(KeyResolverRegistry::with_builtins()),
        Arc::new(NoopObserver),
    )));

    let table = RouteTable::build(&config, &PredicateRegistry::with_builtins(), &filters)?;
    info!("Loaded {} routes from {}", table.len(), args.config);

    println!("{}", serde_json::to_string_pretty(&table.describe())?);

    Ok(())
}
