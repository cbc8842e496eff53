// =============================================================================
// AppState — shared handles threaded through every Axum extractor
// =============================================================================
//
// Follows the teacher's `app_state::AppState` shape (one struct behind a
// single `Arc`, handed to `axum::Router::with_state`) but the fields are the
// engine's actual components instead of a dashboard snapshot: every
// component in §2 of the evaluation engine lives here as a shared handle,
// constructed once in `main.rs` and cloned cheaply per request.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::cache::Cache;
use crate::config::RuntimeConfig;
use crate::db::PgStore;
use crate::leaderboard::Leaderboard;
use crate::market_data::candle_buffer::CandleBuffer;
use crate::payout_ledger::PayoutLedger;
use crate::price_feed::PriceFeed;
use crate::push_channel::PushChannel;
use crate::risk_evaluator::RiskEvaluator;
use crate::session_gateway::SessionGateway;
use crate::trade_ledger::TradeLedger;

pub struct AppState {
    pub pg: PgStore,
    pub cache: Cache,
    pub price_feed: Arc<PriceFeed>,
    pub candle_buffer: Arc<CandleBuffer>,
    pub trade_ledger: Arc<TradeLedger>,
    pub risk_evaluator: Arc<RiskEvaluator>,
    pub payout_ledger: Arc<PayoutLedger>,
    pub leaderboard: Arc<Leaderboard>,
    pub push: Arc<PushChannel>,
    pub session_gateway: SessionGateway,
    pub config: RwLock<RuntimeConfig>,
    start_time: Instant,
}

#[allow(clippy::too_many_arguments)]
impl AppState {
    pub fn new(
        pg: PgStore,
        cache: Cache,
        price_feed: Arc<PriceFeed>,
        candle_buffer: Arc<CandleBuffer>,
        trade_ledger: Arc<TradeLedger>,
        risk_evaluator: Arc<RiskEvaluator>,
        payout_ledger: Arc<PayoutLedger>,
        leaderboard: Arc<Leaderboard>,
        push: Arc<PushChannel>,
        session_gateway: SessionGateway,
        config: RuntimeConfig,
    ) -> Self {
        Self {
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
            config: RwLock::new(config),
            start_time: Instant::now(),
        }
    }

    /// Engine-wide maintenance switch (spec.md §9 "Global mutable state" —
    /// distinct from any single challenge's own lifecycle). Checked by the
    /// trading endpoints before touching the Trade Ledger.
    pub fn trading_mode(&self) -> crate::types::TradingMode {
        self.config.read().trading_mode
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
