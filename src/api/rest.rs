// =============================================================================
// REST API — HTTP/JSON surface under `/api/v1` (spec.md §6)
// =============================================================================
//
// Grounded on the teacher's `api::rest` router shape (one `axum::Router`
// built from a flat list of routes, every handler returning `AppResult<impl
// IntoResponse>`) but every handler here wraps a call into a domain
// component instead of reading `AppState`'s dashboard snapshot directly.
// Every success response goes through `ok()`, which matches the
// `{success, data, message}` envelope `errors::AppError`'s `IntoResponse`
// impl uses for failures, so a client sees one shape regardless of outcome.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::api::auth::{AdminPrincipal, Principal};
use crate::app_state::AppState;
use crate::db::models::Challenge;
use crate::errors::{AppError, AppResult};
use crate::market_data::candle_buffer::CandleKey;
use crate::trade_ledger::HistoryFilters;
use crate::types::{AccountMode, ChallengeStatus, CloseReason, PayoutNetwork, Side};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/auth/telegram", post(auth_telegram))
        .route("/auth/refresh", post(auth_refresh))
        .route("/challenges", get(list_challenge_types))
        .route("/challenges/purchase", post(purchase_challenge))
        .route("/challenges/my", get(my_challenges))
        .route("/challenges/:id", get(challenge_detail))
        .route("/challenges/:id/rules", get(challenge_rules))
        .route("/trading/order", post(open_order))
        .route("/trading/order/:id", delete(close_order))
        .route("/trading/positions", get(list_positions))
        .route("/trading/positions/all", delete(close_all_positions))
        .route("/trading/history", get(trading_history))
        .route("/trading/kline", get(trading_kline))
        .route("/stats/dashboard", get(stats_dashboard))
        .route("/stats/equity-curve", get(stats_equity_curve))
        .route("/payouts/available", get(payouts_available))
        .route("/payouts/request", post(payouts_request))
        .route("/payouts", get(payouts_list))
        .route("/leaderboard/monthly", get(leaderboard_monthly))
        .route("/leaderboard/alltime", get(leaderboard_alltime))
        .route("/admin/payouts/pending", get(admin_payouts_pending))
        .route("/admin/payouts/:id/approve", post(admin_payout_approve))
        .route("/admin/payouts/:id/reject", post(admin_payout_reject))
        .route("/admin/payouts/:id/sent", post(admin_payout_sent))
        .route("/admin/users/:id/block", post(admin_block_user))
        .route("/admin/users/:id/unblock", post(admin_unblock_user))
        .route("/admin/challenges", get(admin_list_active_challenges))
}

/// Wraps a successful payload in the `{success, data, message}` envelope.
fn ok<T: Serialize>(data: T) -> impl IntoResponse {
    Json(json!({ "success": true, "data": data, "message": null }))
}

async fn own_challenge(state: &AppState, principal: &Principal, challenge_id: Uuid) -> AppResult<Challenge> {
    let challenge = state
        .pg
        .get_challenge(challenge_id)
        .await?
        .ok_or_else(|| AppError::NotFound("challenge not found".into()))?;
    if !principal.is_owner_or_admin(challenge.user_id) {
        return Err(AppError::NotFound("challenge not found".into()));
    }
    Ok(challenge)
}

// -----------------------------------------------------------------------
// Health
// -----------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ok(json!({ "status": "ok", "uptime_s": state.uptime_secs(), "trading_mode": state.trading_mode().to_string() }))
}

// -----------------------------------------------------------------------
// Session Gateway
// -----------------------------------------------------------------------

#[derive(Deserialize)]
struct TelegramAuthBody {
    init_data: String,
    referral_code: Option<String>,
}

async fn auth_telegram(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TelegramAuthBody>,
) -> AppResult<impl IntoResponse> {
    let (tokens, is_new) = state
        .session_gateway
        .authenticate(&body.init_data, body.referral_code.as_deref())
        .await?;
    Ok(ok(json!({
        "access_token": tokens.access_token,
        "refresh_token": tokens.refresh_token,
        "expires_in": tokens.expires_in,
        "is_new": is_new,
    })))
}

#[derive(Deserialize)]
struct RefreshBody {
    refresh_token: String,
}

async fn auth_refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshBody>,
) -> AppResult<impl IntoResponse> {
    let tokens = state.session_gateway.refresh(&body.refresh_token).await?;
    Ok(ok(json!({
        "access_token": tokens.access_token,
        "refresh_token": tokens.refresh_token,
        "expires_in": tokens.expires_in,
    })))
}

// -----------------------------------------------------------------------
// Challenges
// -----------------------------------------------------------------------

async fn list_challenge_types(State(state): State<Arc<AppState>>) -> AppResult<impl IntoResponse> {
    let types = state.pg.list_active_challenge_types().await?;
    Ok(ok(types))
}

#[derive(Deserialize)]
struct PurchaseBody {
    challenge_type_id: Uuid,
}

async fn purchase_challenge(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(body): Json<PurchaseBody>,
) -> AppResult<impl IntoResponse> {
    if state.pg.get_active_challenge_for_user(principal.user_id).await?.is_some() {
        return Err(AppError::Conflict(
            "an active challenge already exists for this user".into(),
        ));
    }
    let challenge_type = state
        .pg
        .get_challenge_type(body.challenge_type_id)
        .await?
        .filter(|t| t.active)
        .ok_or_else(|| AppError::NotFound("challenge type not found".into()))?;

    let attempt_number = state
        .pg
        .next_attempt_number(principal.user_id, challenge_type.id)
        .await?;
    let status = if challenge_type.is_instant {
        ChallengeStatus::Funded
    } else {
        ChallengeStatus::Phase1
    };
    let account_mode = if challenge_type.is_instant {
        AccountMode::Funded
    } else {
        AccountMode::Demo
    };
    let challenge = state
        .pg
        .create_challenge(
            principal.user_id,
            challenge_type.id,
            status,
            account_mode,
            challenge_type.account_size,
            attempt_number,
        )
        .await?;
    Ok(ok(challenge))
}

#[derive(Deserialize)]
struct MyChallengesQuery {
    status: Option<String>,
}

async fn my_challenges(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(q): Query<MyChallengesQuery>,
) -> AppResult<impl IntoResponse> {
    let mut challenges = state.pg.list_challenges_for_user(principal.user_id).await?;
    if let Some(raw) = q.status {
        let status: ChallengeStatus = raw
            .parse()
            .map_err(|_| AppError::InvalidInput(format!("unknown status '{raw}'")))?;
        challenges.retain(|c| c.status == status);
    }
    Ok(ok(challenges))
}

async fn challenge_detail(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let challenge = own_challenge(&state, &principal, id).await?;
    Ok(ok(challenge))
}

async fn challenge_rules(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let challenge = own_challenge(&state, &principal, id).await?;
    let challenge_type = state
        .pg
        .get_challenge_type(challenge.type_id)
        .await?
        .ok_or_else(|| AppError::Internal("challenge type missing for existing challenge".into()))?;

    let open_positions = state.trade_ledger.list_open(id).await?;
    let unrealized: f64 = open_positions
        .iter()
        .filter_map(|p| state.price_feed.latest(&p.symbol).map(|mark| p.unrealized_pnl(mark)))
        .sum();
    let equity = challenge.equity(unrealized);
    let daily_drawdown_pct = (challenge.daily_anchor_equity - equity) / challenge.daily_anchor_equity * 100.0;
    let trailing_basis = match challenge_type.drawdown_type {
        crate::types::DrawdownType::Trailing => challenge.peak_equity,
        crate::types::DrawdownType::Static => challenge.initial_balance,
    };
    let trailing_drawdown_pct = (trailing_basis - equity) / trailing_basis * 100.0;

    Ok(ok(json!({
        "challenge_id": challenge.id,
        "status": challenge.status,
        "equity": equity,
        "daily_drawdown_pct": daily_drawdown_pct,
        "max_daily_loss_pct": challenge_type.max_daily_loss_pct,
        "trailing_drawdown_pct": trailing_drawdown_pct,
        "max_total_loss_pct": challenge_type.max_total_loss_pct,
        "trading_days_count": challenge.trading_days_count,
        "min_trading_days": challenge_type.min_trading_days,
        "profit_target_p1": challenge_type.profit_target_p1,
        "profit_target_p2": challenge_type.profit_target_p2,
    })))
}

// -----------------------------------------------------------------------
// Trading
// -----------------------------------------------------------------------

#[derive(Deserialize)]
struct OpenOrderBody {
    challenge_id: Uuid,
    symbol: String,
    side: Side,
    qty: f64,
    leverage: i32,
    take_profit: Option<f64>,
    stop_loss: Option<f64>,
}

async fn open_order(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(body): Json<OpenOrderBody>,
) -> AppResult<impl IntoResponse> {
    if state.trading_mode() != crate::types::TradingMode::Live {
        return Err(AppError::Unavailable("trading is paused engine-wide".into()));
    }
    own_challenge(&state, &principal, body.challenge_id).await?;
    let position = state
        .trade_ledger
        .open_position(
            body.challenge_id,
            &body.symbol,
            body.side,
            body.qty,
            body.leverage,
            body.take_profit,
            body.stop_loss,
        )
        .await?;
    Ok(ok(position))
}

async fn close_order(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(position_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let position = state
        .pg
        .get_position(position_id)
        .await?
        .ok_or_else(|| AppError::NotFound("position not found".into()))?;
    own_challenge(&state, &principal, position.challenge_id).await?;
    let closed = state
        .trade_ledger
        .close_position(position_id, CloseReason::Manual, None)
        .await?;
    Ok(ok(closed))
}

#[derive(Deserialize)]
struct ChallengeIdQuery {
    challenge_id: Uuid,
}

async fn list_positions(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(q): Query<ChallengeIdQuery>,
) -> AppResult<impl IntoResponse> {
    own_challenge(&state, &principal, q.challenge_id).await?;
    let positions = state.trade_ledger.list_open(q.challenge_id).await?;
    Ok(ok(positions))
}

async fn close_all_positions(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(q): Query<ChallengeIdQuery>,
) -> AppResult<impl IntoResponse> {
    let challenge = own_challenge(&state, &principal, q.challenge_id).await?;
    let lock = state.trade_ledger.writer_lock(challenge.id);
    let _guard = lock.lock().await;
    let closed = state
        .trade_ledger
        .force_close_all_locked(&challenge, CloseReason::Manual)
        .await;
    Ok(ok(closed))
}

#[derive(Deserialize)]
struct HistoryQuery {
    challenge_id: Uuid,
    cursor: Option<DateTime<Utc>>,
    limit: Option<i64>,
    side: Option<String>,
    symbol: Option<String>,
}

async fn trading_history(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(q): Query<HistoryQuery>,
) -> AppResult<impl IntoResponse> {
    own_challenge(&state, &principal, q.challenge_id).await?;
    let side = q
        .side
        .map(|s| s.parse::<Side>())
        .transpose()
        .map_err(|_| AppError::InvalidInput("unknown side filter".into()))?;
    let filters = HistoryFilters {
        symbol: q.symbol,
        side,
    };
    let page = state
        .trade_ledger
        .history(q.challenge_id, q.cursor, q.limit.unwrap_or(50), filters)
        .await?;
    Ok(ok(page))
}

#[derive(Deserialize)]
struct KlineQuery {
    symbol: String,
    interval: String,
    limit: Option<usize>,
}

async fn trading_kline(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    Query(q): Query<KlineQuery>,
) -> AppResult<impl IntoResponse> {
    let key = CandleKey {
        symbol: q.symbol,
        interval: q.interval,
    };
    let candles = state.candle_buffer.get_closed(&key, q.limit.unwrap_or(200));
    Ok(ok(candles))
}

// -----------------------------------------------------------------------
// Stats
// -----------------------------------------------------------------------

async fn stats_dashboard(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(q): Query<ChallengeIdQuery>,
) -> AppResult<impl IntoResponse> {
    let challenge = own_challenge(&state, &principal, q.challenge_id).await?;
    let open_positions = state.trade_ledger.list_open(q.challenge_id).await?;
    let unrealized: f64 = open_positions
        .iter()
        .filter_map(|p| state.price_feed.latest(&p.symbol).map(|mark| p.unrealized_pnl(mark)))
        .sum();
    Ok(ok(json!({
        "challenge_id": challenge.id,
        "status": challenge.status,
        "current_balance": challenge.current_balance,
        "equity": challenge.equity(unrealized),
        "unrealized_pnl": unrealized,
        "daily_pnl_realized": challenge.daily_pnl_realized,
        "total_pnl_realized": challenge.total_pnl_realized,
        "open_position_count": open_positions.len(),
        "peak_equity": challenge.peak_equity,
        "trading_days_count": challenge.trading_days_count,
    })))
}

#[derive(Deserialize)]
struct EquityCurveQuery {
    challenge_id: Uuid,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

async fn stats_equity_curve(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(q): Query<EquityCurveQuery>,
) -> AppResult<impl IntoResponse> {
    own_challenge(&state, &principal, q.challenge_id).await?;
    let to = q.to.unwrap_or_else(|| Utc::now().date_naive());
    let from = q.from.unwrap_or_else(|| to - chrono::Duration::days(90));
    let curve = state.pg.equity_curve(q.challenge_id, from, to).await?;
    Ok(ok(curve))
}

// -----------------------------------------------------------------------
// Payouts
// -----------------------------------------------------------------------

async fn payouts_available(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(q): Query<ChallengeIdQuery>,
) -> AppResult<impl IntoResponse> {
    let challenge = own_challenge(&state, &principal, q.challenge_id).await?;
    let challenge_type = state
        .pg
        .get_challenge_type(challenge.type_id)
        .await?
        .ok_or_else(|| AppError::Internal("challenge type missing for existing challenge".into()))?;
    let available = state
        .payout_ledger
        .available(&challenge, challenge_type.profit_split_pct)
        .await?;
    Ok(ok(json!({
        "available_amount": available,
        "min_payout": challenge_type.min_payout,
        "profit_split_pct": challenge_type.profit_split_pct,
    })))
}

#[derive(Deserialize)]
struct PayoutRequestBody {
    challenge_id: Uuid,
    amount: f64,
    wallet_address: String,
    network: PayoutNetwork,
}

async fn payouts_request(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(body): Json<PayoutRequestBody>,
) -> AppResult<impl IntoResponse> {
    let challenge = own_challenge(&state, &principal, body.challenge_id).await?;
    let challenge_type = state
        .pg
        .get_challenge_type(challenge.type_id)
        .await?
        .ok_or_else(|| AppError::Internal("challenge type missing for existing challenge".into()))?;
    let payout = state
        .payout_ledger
        .request(
            &challenge,
            challenge_type.profit_split_pct,
            challenge_type.min_payout,
            body.amount,
            &body.wallet_address,
            body.network,
        )
        .await?;
    Ok(ok(payout))
}

async fn payouts_list(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Query(q): Query<ChallengeIdQuery>,
) -> AppResult<impl IntoResponse> {
    own_challenge(&state, &principal, q.challenge_id).await?;
    let payouts = state.pg.list_payouts_for_challenge(q.challenge_id).await?;
    Ok(ok(payouts))
}

// -----------------------------------------------------------------------
// Leaderboard
// -----------------------------------------------------------------------

#[derive(Deserialize)]
struct LeaderboardQuery {
    limit: Option<i64>,
}

async fn leaderboard_monthly(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LeaderboardQuery>,
) -> AppResult<impl IntoResponse> {
    let entries = state.leaderboard.monthly(q.limit.unwrap_or(50)).await?;
    Ok(ok(entries))
}

async fn leaderboard_alltime(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LeaderboardQuery>,
) -> AppResult<impl IntoResponse> {
    let entries = state.leaderboard.all_time(q.limit.unwrap_or(50)).await?;
    Ok(ok(entries))
}

// -----------------------------------------------------------------------
// Admin
// -----------------------------------------------------------------------

async fn admin_payouts_pending(
    State(state): State<Arc<AppState>>,
    AdminPrincipal(principal): AdminPrincipal,
) -> AppResult<impl IntoResponse> {
    let payouts = state.payout_ledger.list_pending(principal.role).await?;
    Ok(ok(payouts))
}

async fn admin_payout_approve(
    State(state): State<Arc<AppState>>,
    AdminPrincipal(_): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let payout = state.payout_ledger.approve(id).await?;
    Ok(ok(payout))
}

async fn admin_payout_reject(
    State(state): State<Arc<AppState>>,
    AdminPrincipal(_): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let payout = state.payout_ledger.reject(id).await?;
    Ok(ok(payout))
}

#[derive(Deserialize)]
struct MarkSentBody {
    tx_hash: String,
}

async fn admin_payout_sent(
    State(state): State<Arc<AppState>>,
    AdminPrincipal(_): AdminPrincipal,
    Path(id): Path<Uuid>,
    Json(body): Json<MarkSentBody>,
) -> AppResult<impl IntoResponse> {
    let payout = state.payout_ledger.mark_sent(id, &body.tx_hash).await?;
    Ok(ok(payout))
}

async fn admin_block_user(
    State(state): State<Arc<AppState>>,
    AdminPrincipal(_): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    state.pg.set_user_blocked(id, true).await?;
    Ok(ok(json!({ "blocked": true })))
}

async fn admin_unblock_user(
    State(state): State<Arc<AppState>>,
    AdminPrincipal(_): AdminPrincipal,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    state.pg.set_user_blocked(id, false).await?;
    Ok(ok(json!({ "blocked": false })))
}

async fn admin_list_active_challenges(
    State(state): State<Arc<AppState>>,
    AdminPrincipal(_): AdminPrincipal,
) -> AppResult<impl IntoResponse> {
    let challenges = state.pg.list_active_challenges().await?;
    Ok(ok(challenges))
}
