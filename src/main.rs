mod api;
mod chains;
mod config;
mod context;
mod db;
mod deposits;
mod ledger;
mod scanner;
mod types;
mod utils;
mod wallets;
mod withdrawals;

use clap::Parser;
use dotenvy::dotenv;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::{
    chains::{keys::KeyProvider, Chains},
    config::TreasuryConfig,
    context::TreasuryContext,
    deposits::pipeline::deposit_cycle_task,
    types::network::Network,
    withdrawals::pipeline::withdrawal_sender_task,
};

#[derive(Parser, Debug)]
#[command(name = "treasury", about = "Chain deposit and withdrawal reconciliation service")]
struct Args {
    /// Port the HTTP API listens on
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Serve the API without the background cycle tasks
    #[arg(long)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    dotenv().ok();

    let args = Args::parse();
    let config = TreasuryConfig::new();

    let pool = db::init_pool(config.database_url())
        .await
        .expect("database pool");
    db::run_migrations(&pool).await.expect("migrations apply");

    let chains = Chains::new(&config);
    let keys = KeyProvider::from_env();
    let ctx = Arc::new(TreasuryContext::new(config, pool, chains, keys));

    if !args.no_scheduler {
        for network in Network::ALL {
            tokio::spawn({
                let ctx = Arc::clone(&ctx);
                async move {
                    deposit_cycle_task(ctx, network).await;
                }
            });
        }

        tokio::spawn({
            let ctx = Arc::clone(&ctx);
            async move {
                withdrawal_sender_task(ctx).await;
            }
        });
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = api::router(Arc::clone(&ctx)).layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!(%addr, "Server running at http://");

    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
