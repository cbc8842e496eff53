// =============================================================================
// Domain models backing the relational schema (migrations/0001_init.sql)
// =============================================================================
//
// Each domain struct has a companion `*Row` that mirrors the database's
// column types exactly (enums as `String`) plus a `TryFrom<Row>` conversion
// into the domain type with its typed enums. This keeps sqlx's `FromRow`
// derive mechanical while still giving the rest of the engine exhaustively
// matched tagged enums (spec.md §9: "Polymorphism ... modelled as tagged
// variants with exhaustive matching").
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::str::FromStr;
use uuid::Uuid;

use crate::types::{
    AccountMode, ChallengeStatus, CloseReason, DrawdownType, FailedReason, PayoutNetwork,
    PayoutStatus, Role, Side,
};

fn parse_enum<T: FromStr>(raw: &str, field: &'static str) -> anyhow::Result<T> {
    T::from_str(raw).map_err(|_| anyhow::anyhow!("invalid value '{raw}' for column '{field}'"))
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub external_id: String,
    pub display_name: String,
    pub role: Role,
    pub blocked: bool,
    pub referral_code: Option<String>,
    pub referred_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub external_id: String,
    pub display_name: String,
    pub role: String,
    pub blocked: bool,
    pub referral_code: Option<String>,
    pub referred_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(r: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: r.id,
            external_id: r.external_id,
            display_name: r.display_name,
            role: parse_enum(&r.role, "role")?,
            blocked: r.blocked,
            referral_code: r.referral_code,
            referred_by: r.referred_by,
            created_at: r.created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// ChallengeType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeType {
    pub id: Uuid,
    pub name: String,
    pub account_size: f64,
    pub price: f64,
    pub profit_target_p1: f64,
    pub profit_target_p2: f64,
    pub max_daily_loss_pct: f64,
    pub max_total_loss_pct: f64,
    pub min_trading_days: i32,
    pub drawdown_type: DrawdownType,
    pub max_leverage: i32,
    pub profit_split_pct: f64,
    pub is_one_phase: bool,
    pub is_instant: bool,
    pub min_payout: f64,
    pub active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChallengeTypeRow {
    pub id: Uuid,
    pub name: String,
    pub account_size: f64,
    pub price: f64,
    pub profit_target_p1: f64,
    pub profit_target_p2: f64,
    pub max_daily_loss_pct: f64,
    pub max_total_loss_pct: f64,
    pub min_trading_days: i32,
    pub drawdown_type: String,
    pub max_leverage: i32,
    pub profit_split_pct: f64,
    pub is_one_phase: bool,
    pub is_instant: bool,
    pub min_payout: f64,
    pub active: bool,
}

impl TryFrom<ChallengeTypeRow> for ChallengeType {
    type Error = anyhow::Error;

    fn try_from(r: ChallengeTypeRow) -> Result<Self, Self::Error> {
        Ok(ChallengeType {
            id: r.id,
            name: r.name,
            account_size: r.account_size,
            price: r.price,
            profit_target_p1: r.profit_target_p1,
            profit_target_p2: r.profit_target_p2,
            max_daily_loss_pct: r.max_daily_loss_pct,
            max_total_loss_pct: r.max_total_loss_pct,
            min_trading_days: r.min_trading_days,
            drawdown_type: parse_enum(&r.drawdown_type, "drawdown_type")?,
            max_leverage: r.max_leverage,
            profit_split_pct: r.profit_split_pct,
            is_one_phase: r.is_one_phase,
            is_instant: r.is_instant,
            min_payout: r.min_payout,
            active: r.active,
        })
    }
}

// ---------------------------------------------------------------------------
// Challenge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Challenge {
    pub id: Uuid,
    pub user_id: Uuid,
    pub type_id: Uuid,
    pub status: ChallengeStatus,
    pub account_mode: AccountMode,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub peak_equity: f64,
    pub daily_anchor_equity: f64,
    pub daily_pnl_realized: f64,
    pub total_pnl_realized: f64,
    pub trading_days_count: i32,
    pub scaling_step: i32,
    pub attempt_number: i32,
    pub failed_reason: Option<FailedReason>,
    pub started_at: DateTime<Utc>,
    pub transitioned_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_daily_rollover_at: NaiveDate,
    /// `total_pnl_realized` at the instant this challenge became funded;
    /// the Payout Ledger subtracts this out so phase1/phase2 paper gains
    /// are never counted toward the profit split (spec.md §4.5).
    pub funded_pnl_baseline: f64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChallengeRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub type_id: Uuid,
    pub status: String,
    pub account_mode: String,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub peak_equity: f64,
    pub daily_anchor_equity: f64,
    pub daily_pnl_realized: f64,
    pub total_pnl_realized: f64,
    pub trading_days_count: i32,
    pub scaling_step: i32,
    pub attempt_number: i32,
    pub failed_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub transitioned_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_daily_rollover_at: NaiveDate,
    pub funded_pnl_baseline: f64,
}

impl TryFrom<ChallengeRow> for Challenge {
    type Error = anyhow::Error;

    fn try_from(r: ChallengeRow) -> Result<Self, Self::Error> {
        Ok(Challenge {
            id: r.id,
            user_id: r.user_id,
            type_id: r.type_id,
            status: parse_enum(&r.status, "status")?,
            account_mode: parse_enum(&r.account_mode, "account_mode")?,
            initial_balance: r.initial_balance,
            current_balance: r.current_balance,
            peak_equity: r.peak_equity,
            daily_anchor_equity: r.daily_anchor_equity,
            daily_pnl_realized: r.daily_pnl_realized,
            total_pnl_realized: r.total_pnl_realized,
            trading_days_count: r.trading_days_count,
            scaling_step: r.scaling_step,
            attempt_number: r.attempt_number,
            failed_reason: r.failed_reason.map(|s| parse_enum(&s, "failed_reason")).transpose()?,
            started_at: r.started_at,
            transitioned_at: r.transitioned_at,
            failed_at: r.failed_at,
            last_daily_rollover_at: r.last_daily_rollover_at,
            funded_pnl_baseline: r.funded_pnl_baseline,
        })
    }
}

impl Challenge {
    /// Current equity given a sum of unrealized PnL over open positions
    /// (spec.md §4.3 step 3 / GLOSSARY "Equity").
    pub fn equity(&self, unrealized_pnl_sum: f64) -> f64 {
        self.current_balance + unrealized_pnl_sum
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub leverage: i32,
    pub entry_price: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub margin_used: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
    pub close_reason: Option<CloseReason>,
    pub realized_pnl: Option<f64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PositionRow {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub leverage: i32,
    pub entry_price: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub margin_used: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
    pub close_reason: Option<String>,
    pub realized_pnl: Option<f64>,
}

impl TryFrom<PositionRow> for Position {
    type Error = anyhow::Error;

    fn try_from(r: PositionRow) -> Result<Self, Self::Error> {
        Ok(Position {
            id: r.id,
            challenge_id: r.challenge_id,
            symbol: r.symbol,
            side: parse_enum(&r.side, "side")?,
            qty: r.qty,
            leverage: r.leverage,
            entry_price: r.entry_price,
            take_profit: r.take_profit,
            stop_loss: r.stop_loss,
            margin_used: r.margin_used,
            opened_at: r.opened_at,
            closed_at: r.closed_at,
            close_price: r.close_price,
            close_reason: r.close_reason.map(|s| parse_enum(&s, "close_reason")).transpose()?,
            realized_pnl: r.realized_pnl,
        })
    }
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Unrealized PnL at `mark` (spec.md §4.3 step 2).
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        self.qty * (mark - self.entry_price) * self.side.sign()
    }
}

// ---------------------------------------------------------------------------
// EquitySnapshot
// ---------------------------------------------------------------------------

/// One day's closing equity for a challenge, recorded at the UTC day
/// boundary (spec.md §4.3). Backs `/stats/equity-curve` and the
/// Leaderboard's "balance at start of month" lookup.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EquitySnapshot {
    pub challenge_id: Uuid,
    pub day: NaiveDate,
    pub equity: f64,
    pub current_balance: f64,
}

// ---------------------------------------------------------------------------
// DailyCounter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DailyCounter {
    pub challenge_id: Uuid,
    pub day: NaiveDate,
    pub realized_pnl: f64,
    pub worst_equity_drop_pct: f64,
    pub trades_opened: i32,
}

// ---------------------------------------------------------------------------
// PayoutRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PayoutRequest {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub amount: f64,
    pub wallet_address: String,
    pub network: PayoutNetwork,
    pub status: PayoutStatus,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PayoutRequestRow {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub amount: f64,
    pub wallet_address: String,
    pub network: String,
    pub status: String,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PayoutRequestRow> for PayoutRequest {
    type Error = anyhow::Error;

    fn try_from(r: PayoutRequestRow) -> Result<Self, Self::Error> {
        Ok(PayoutRequest {
            id: r.id,
            challenge_id: r.challenge_id,
            amount: r.amount,
            wallet_address: r.wallet_address,
            network: parse_enum(&r.network, "network")?,
            status: parse_enum(&r.status, "status")?,
            tx_hash: r.tx_hash,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_unrealized_pnl_long() {
        let row = PositionRow {
            id: Uuid::new_v4(),
            challenge_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            side: "long".into(),
            qty: 2.0,
            leverage: 5,
            entry_price: 100.0,
            take_profit: None,
            stop_loss: None,
            margin_used: 40.0,
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            close_reason: None,
            realized_pnl: None,
        };
        let pos: Position = row.try_into().unwrap();
        assert_eq!(pos.unrealized_pnl(110.0), 20.0);
        assert!(pos.is_open());
    }

    #[test]
    fn position_unrealized_pnl_short() {
        let row = PositionRow {
            id: Uuid::new_v4(),
            challenge_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            side: "short".into(),
            qty: 2.0,
            leverage: 5,
            entry_price: 100.0,
            take_profit: None,
            stop_loss: None,
            margin_used: 40.0,
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            close_reason: None,
            realized_pnl: None,
        };
        let pos: Position = row.try_into().unwrap();
        assert_eq!(pos.unrealized_pnl(90.0), 20.0);
    }

    #[test]
    fn invalid_enum_value_rejected() {
        let row = PositionRow {
            id: Uuid::new_v4(),
            challenge_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            side: "sideways".into(),
            qty: 1.0,
            leverage: 1,
            entry_price: 1.0,
            take_profit: None,
            stop_loss: None,
            margin_used: 1.0,
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            close_reason: None,
            realized_pnl: None,
        };
        let result: anyhow::Result<Position> = row.try_into();
        assert!(result.is_err());
    }
}
