// =============================================================================
// Prop-trading evaluation engine — Main Entry Point
// =============================================================================
//
// Startup order mirrors the teacher's: load config, connect storage, seed and
// stream market data, construct the domain components, then bring up the API
// server last so no request can be served before the components it depends
// on exist. Every long-running loop (price stream, kline stream, risk
// evaluator tick) is spawned and left running; the server itself blocks
// `main` until shutdown.
// =============================================================================

mod api;
mod app_state;
mod cache;
mod config;
mod db;
mod errors;
mod leaderboard;
mod market_data;
mod payout_ledger;
mod phase_state_machine;
mod price_feed;
mod push_channel;
mod risk_evaluator;
mod session_gateway;
mod trade_ledger;
mod types;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::cache::Cache;
use crate::config::RuntimeConfig;
use crate::leaderboard::Leaderboard;
use crate::market_data::candle_buffer::CandleBuffer;
use crate::payout_ledger::PayoutLedger;
use crate::price_feed::PriceFeed;
use crate::push_channel::PushChannel;
use crate::risk_evaluator::RiskEvaluator;
use crate::session_gateway::SessionGateway;
use crate::trade_ledger::TradeLedger;

const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("evaluation engine starting up");

    let config = config::load_or_default(RUNTIME_CONFIG_PATH);
    info!(symbols = ?config.symbols, trading_mode = %config.trading_mode, "runtime config loaded");

    // ── 1. Storage ────────────────────────────────────────────────────────
    let database_url = std::env::var("DB_URL").expect("DB_URL must be set");
    let cache_url = std::env::var("CACHE_URL").expect("CACHE_URL must be set");

    let pool = db::connect(&database_url).await?;
    let pg = db::PgStore::new(pool);
    let cache = Cache::connect(&cache_url).await?;

    // ── 2. Price Feed ─────────────────────────────────────────────────────
    let exchange_rest_url =
        std::env::var("EXCHANGE_REST_URL").unwrap_or_else(|_| "https://api.binance.com".into());

    let price_feed = Arc::new(PriceFeed::new(
        config.symbols.clone(),
        config.price_stale(),
    ));

    let rest_client = reqwest::Client::new();
    price_feed.seed_from_rest(&rest_client, &exchange_rest_url).await;

    for symbol in price_feed.tracked_symbols() {
        tokio::spawn(price_feed::run_price_stream_forever(
            symbol.clone(),
            price_feed.clone(),
        ));
    }
    info!(count = price_feed.tracked_symbols().len(), "price feed streaming");

    // ── 3. Candle Buffer ──────────────────────────────────────────────────
    let candle_buffer = Arc::new(CandleBuffer::new(500));
    for symbol in price_feed.tracked_symbols() {
        for interval in ["1m", "5m", "15m", "1h"] {
            let cb = candle_buffer.clone();
            let sym = symbol.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = market_data::candle_buffer::run_kline_stream(&sym, interval, &cb).await {
                        error!(symbol = %sym, interval, error = %e, "kline stream error — reconnecting in 5s");
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            });
        }
    }

    // ── 4. Domain components ─────────────────────────────────────────────
    let push = Arc::new(PushChannel::new());
    let trade_ledger = Arc::new(TradeLedger::new(pg.clone(), price_feed.clone(), push.clone()));

    let max_eval_concurrency = std::env::var("MAX_EVAL_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as u32;
            (cpus * 2).min(32)
        });

    let risk_evaluator = Arc::new(RiskEvaluator::new(
        pg.clone(),
        price_feed.clone(),
        trade_ledger.clone(),
        push.clone(),
        max_eval_concurrency,
    ));
    tokio::spawn(risk_evaluator.clone().run_forever(config.eval_tick()));
    info!(max_eval_concurrency, tick_ms = config.eval_tick_ms, "risk evaluator running");

    let payout_ledger = Arc::new(PayoutLedger::new(pg.clone(), push.clone()));
    let leaderboard = Arc::new(Leaderboard::new(pg.clone(), cache.clone(), config.leaderboard_cache_ttl_s));

    let jwt_secret = std::env::var("JWT_SIGNING_KEY").expect("JWT_SIGNING_KEY must be set");
    let bot_token = std::env::var("PLATFORM_BOT_TOKEN").expect("PLATFORM_BOT_TOKEN must be set");
    let session_gateway = SessionGateway::new(
        pg.clone(),
        jwt_secret,
        bot_token,
        config.access_ttl_s,
        config.refresh_ttl_s,
    );

    let allowed_origins = config.allowed_origins.clone();

    let state = Arc::new(AppState::new(
        pg,
        cache,
        price_feed,
        candle_buffer,
        trade_ledger,
        risk_evaluator,
        payout_ledger,
        leaderboard,
        push,
        session_gateway,
        config,
    ));

    // ── 5. API server ─────────────────────────────────────────────────────
    let cors = if allowed_origins.is_empty() {
        warn!("ALLOWED_ORIGINS not set — CORS disabled (same-origin only)");
        CorsLayer::new()
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(tower_http::cors::Any)
    };

    let app = Router::new()
        .nest("/api/v1", api::rest::router())
        .route("/ws/trading/ws/:challenge_id", get(api::ws::handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state.clone());

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("all subsystems running");
    server.await?;

    // ── 6. Graceful shutdown ──────────────────────────────────────────────
    // Give the risk evaluator's in-flight tick up to 10s to finish its
    // writer-lock-held work before we persist and exit (spec.md §5).
    tokio::time::sleep(Duration::from_secs(10)).await;

    if let Err(e) = state.config.read().save(RUNTIME_CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("evaluation engine shut down complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install ctrl-c handler");
        return;
    }
    warn!("shutdown signal received — stopping gracefully");
}
