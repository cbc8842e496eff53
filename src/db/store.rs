// =============================================================================
// PgStore — relational repository layer
// =============================================================================
//
// Every query goes through the non-macro `sqlx::query`/`query_as` builder API
// rather than the `query!`/`query_as!` compile-time-checked macros, since
// there is no live database reachable while this crate is authored (see
// DESIGN.md). Each method maps its `*Row` result into the domain type with
// `TryFrom`, surfacing a malformed CHECK-constrained column as an internal
// error rather than a panic.
// =============================================================================

use chrono::{NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::types::{ChallengeStatus, FailedReason, PayoutStatus};

use super::models::{
    Challenge, ChallengeRow, ChallengeType, ChallengeTypeRow, DailyCounter, EquitySnapshot,
    PayoutRequest, PayoutRequestRow, Position, PositionRow, User, UserRow,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn internal(context: &'static str) -> impl Fn(sqlx::Error) -> AppError {
        move |e| AppError::Internal(format!("{context}: {e}"))
    }

    // -------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------

    pub async fn get_user(&self, id: Uuid) -> AppResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::internal("get_user"))?;
        row.map(User::try_from)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn get_user_by_external_id(&self, external_id: &str) -> AppResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::internal("get_user_by_external_id"))?;
        row.map(User::try_from)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    /// `referral_code` is this user's own shareable code (spec.md's
    /// data-model-only referral program); `referred_by` is the referrer
    /// resolved from an inbound code, if any.
    pub async fn create_user(
        &self,
        external_id: &str,
        display_name: &str,
        referral_code: &str,
        referred_by: Option<Uuid>,
    ) -> AppResult<User> {
        let row: UserRow = sqlx::query_as(
            "INSERT INTO users (external_id, display_name, referral_code, referred_by)
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(external_id)
        .bind(display_name)
        .bind(referral_code)
        .bind(referred_by)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::internal("create_user"))?;
        User::try_from(row).map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn get_user_by_referral_code(&self, code: &str) -> AppResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE referral_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::internal("get_user_by_referral_code"))?;
        row.map(User::try_from)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn set_user_blocked(&self, id: Uuid, blocked: bool) -> AppResult<()> {
        sqlx::query("UPDATE users SET blocked = $2 WHERE id = $1")
            .bind(id)
            .bind(blocked)
            .execute(&self.pool)
            .await
            .map_err(Self::internal("set_user_blocked"))?;
        Ok(())
    }

    /// Promotes a user to `funded_trader` on the phase2 -> funded transition
    /// (spec.md §4.4). Never demotes — a later failed/funded challenge does
    /// not strip the role from a user who is still funded on another one.
    pub async fn set_user_role(&self, id: Uuid, role: crate::types::Role) -> AppResult<()> {
        sqlx::query("UPDATE users SET role = $2 WHERE id = $1")
            .bind(id)
            .bind(role.to_string())
            .execute(&self.pool)
            .await
            .map_err(Self::internal("set_user_role"))?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Challenge types
    // -------------------------------------------------------------------

    pub async fn list_active_challenge_types(&self) -> AppResult<Vec<ChallengeType>> {
        let rows: Vec<ChallengeTypeRow> =
            sqlx::query_as("SELECT * FROM challenge_types WHERE active ORDER BY account_size")
                .fetch_all(&self.pool)
                .await
                .map_err(Self::internal("list_active_challenge_types"))?;
        rows.into_iter()
            .map(ChallengeType::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn get_challenge_type(&self, id: Uuid) -> AppResult<Option<ChallengeType>> {
        let row: Option<ChallengeTypeRow> =
            sqlx::query_as("SELECT * FROM challenge_types WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Self::internal("get_challenge_type"))?;
        row.map(ChallengeType::try_from)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    // -------------------------------------------------------------------
    // Challenges
    // -------------------------------------------------------------------

    pub async fn get_challenge(&self, id: Uuid) -> AppResult<Option<Challenge>> {
        let row: Option<ChallengeRow> = sqlx::query_as("SELECT * FROM challenges WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::internal("get_challenge"))?;
        row.map(Challenge::try_from)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    /// The caller's single active (phase1/phase2/funded) challenge, if any
    /// (spec.md §3 invariant — enforced again at the DB via
    /// `challenges_one_active_per_user`).
    pub async fn get_active_challenge_for_user(&self, user_id: Uuid) -> AppResult<Option<Challenge>> {
        let row: Option<ChallengeRow> = sqlx::query_as(
            "SELECT * FROM challenges WHERE user_id = $1
             AND status IN ('phase1', 'phase2', 'funded')",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::internal("get_active_challenge_for_user"))?;
        row.map(Challenge::try_from)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn list_challenges_for_user(&self, user_id: Uuid) -> AppResult<Vec<Challenge>> {
        let rows: Vec<ChallengeRow> = sqlx::query_as(
            "SELECT * FROM challenges WHERE user_id = $1 ORDER BY started_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::internal("list_challenges_for_user"))?;
        rows.into_iter()
            .map(Challenge::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    /// Duplicates the attempt-numbering the teacher's `arena::profile`
    /// module uses for re-attempts: `attempt_number` is one plus the count
    /// of prior challenges of the same user against the same catalog entry.
    pub async fn next_attempt_number(&self, user_id: Uuid, type_id: Uuid) -> AppResult<i32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM challenges WHERE user_id = $1 AND type_id = $2",
        )
        .bind(user_id)
        .bind(type_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::internal("next_attempt_number"))?;
        Ok(count as i32 + 1)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_challenge(
        &self,
        user_id: Uuid,
        type_id: Uuid,
        status: ChallengeStatus,
        account_mode: crate::types::AccountMode,
        initial_balance: f64,
        attempt_number: i32,
    ) -> AppResult<Challenge> {
        let today = Utc::now().date_naive();
        let row: ChallengeRow = sqlx::query_as(
            "INSERT INTO challenges
                (user_id, type_id, status, account_mode, initial_balance, current_balance,
                 peak_equity, daily_anchor_equity, attempt_number, last_daily_rollover_at)
             VALUES ($1, $2, $3, $4, $5, $5, $5, $5, $6, $7)
             RETURNING *",
        )
        .bind(user_id)
        .bind(type_id)
        .bind(status.as_str())
        .bind(account_mode.to_string())
        .bind(initial_balance)
        .bind(attempt_number)
        .bind(today)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::internal("create_challenge"))?;
        Challenge::try_from(row).map_err(|e| AppError::Internal(e.to_string()))
    }

    /// Persists the per-tick balance/equity bookkeeping the Risk Evaluator
    /// computes (spec.md §4.3 steps 2-3). Does not change `status`.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_challenge_marks(
        &self,
        id: Uuid,
        current_balance: f64,
        peak_equity: f64,
        daily_anchor_equity: f64,
        daily_pnl_realized: f64,
        total_pnl_realized: f64,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE challenges SET
                current_balance = $2, peak_equity = $3, daily_anchor_equity = $4,
                daily_pnl_realized = $5, total_pnl_realized = $6
             WHERE id = $1",
        )
        .bind(id)
        .bind(current_balance)
        .bind(peak_equity)
        .bind(daily_anchor_equity)
        .bind(daily_pnl_realized)
        .bind(total_pnl_realized)
        .execute(&self.pool)
        .await
        .map_err(Self::internal("update_challenge_marks"))?;
        Ok(())
    }

    /// Day-boundary rollover (spec.md §4.3 step 1): resets the daily anchor
    /// and realized counter, bumps `trading_days_count` if at least one
    /// trade was opened the prior day.
    pub async fn roll_daily_counters(
        &self,
        id: Uuid,
        new_anchor_equity: f64,
        today: NaiveDate,
        increment_trading_days: bool,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE challenges SET
                daily_anchor_equity = $2,
                daily_pnl_realized = 0,
                last_daily_rollover_at = $3,
                trading_days_count = trading_days_count + CASE WHEN $4 THEN 1 ELSE 0 END
             WHERE id = $1",
        )
        .bind(id)
        .bind(new_anchor_equity)
        .bind(today)
        .bind(increment_trading_days)
        .execute(&self.pool)
        .await
        .map_err(Self::internal("roll_daily_counters"))?;
        Ok(())
    }

    /// Phase/funded/scaling transition (spec.md §4.4). Every variant resets
    /// `daily_pnl_realized`/`trading_days_count` and re-anchors
    /// `peak_equity`/`daily_anchor_equity` to the current balance (DESIGN.md
    /// Open Question resolution). `new_initial_balance` is `Some` only for
    /// a funded scaling step; `new_funded_baseline` is `Some` only for the
    /// phase2 -> funded transition, snapshotting `total_pnl_realized` so the
    /// Payout Ledger can isolate profit earned while funded.
    pub async fn transition_challenge(
        &self,
        id: Uuid,
        status: ChallengeStatus,
        account_mode: crate::types::AccountMode,
        scaling_step: i32,
        new_initial_balance: Option<f64>,
        new_funded_baseline: Option<f64>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE challenges SET
                status = $2,
                account_mode = $3,
                scaling_step = $4,
                transitioned_at = now(),
                peak_equity = current_balance,
                daily_anchor_equity = current_balance,
                daily_pnl_realized = 0,
                trading_days_count = 0,
                initial_balance = COALESCE($5, initial_balance),
                funded_pnl_baseline = COALESCE($6, funded_pnl_baseline)
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(account_mode.to_string())
        .bind(scaling_step)
        .bind(new_initial_balance)
        .bind(new_funded_baseline)
        .execute(&self.pool)
        .await
        .map_err(Self::internal("transition_challenge"))?;
        Ok(())
    }

    pub async fn fail_challenge(&self, id: Uuid, reason: FailedReason) -> AppResult<()> {
        sqlx::query(
            "UPDATE challenges SET status = 'failed', failed_reason = $2, failed_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await
        .map_err(Self::internal("fail_challenge"))?;
        Ok(())
    }

    /// All challenges in an active status, for the Risk Evaluator's per-tick
    /// sweep (spec.md §4.3, §5 worker pool).
    pub async fn list_active_challenges(&self) -> AppResult<Vec<Challenge>> {
        let rows: Vec<ChallengeRow> = sqlx::query_as(
            "SELECT * FROM challenges WHERE status IN ('phase1', 'phase2', 'funded')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Self::internal("list_active_challenges"))?;
        rows.into_iter()
            .map(Challenge::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    // -------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------

    pub async fn get_position(&self, id: Uuid) -> AppResult<Option<Position>> {
        let row: Option<PositionRow> = sqlx::query_as("SELECT * FROM positions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::internal("get_position"))?;
        row.map(Position::try_from)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn list_open_positions(&self, challenge_id: Uuid) -> AppResult<Vec<Position>> {
        let rows: Vec<PositionRow> = sqlx::query_as(
            "SELECT * FROM positions WHERE challenge_id = $1 AND closed_at IS NULL
             ORDER BY opened_at",
        )
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::internal("list_open_positions"))?;
        rows.into_iter()
            .map(Position::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    /// All open positions across all challenges, for a single Risk Evaluator
    /// tick's mark-to-market pass (spec.md §4.3 step 2).
    pub async fn list_all_open_positions(&self) -> AppResult<Vec<Position>> {
        let rows: Vec<PositionRow> =
            sqlx::query_as("SELECT * FROM positions WHERE closed_at IS NULL")
                .fetch_all(&self.pool)
                .await
                .map_err(Self::internal("list_all_open_positions"))?;
        rows.into_iter()
            .map(Position::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn history(
        &self,
        challenge_id: Uuid,
        limit: i64,
        before: Option<chrono::DateTime<Utc>>,
    ) -> AppResult<Vec<Position>> {
        let rows: Vec<PositionRow> = match before {
            Some(ts) => {
                sqlx::query_as(
                    "SELECT * FROM positions WHERE challenge_id = $1 AND closed_at IS NOT NULL
                     AND opened_at < $2 ORDER BY opened_at DESC LIMIT $3",
                )
                .bind(challenge_id)
                .bind(ts)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM positions WHERE challenge_id = $1 AND closed_at IS NOT NULL
                     ORDER BY opened_at DESC LIMIT $2",
                )
                .bind(challenge_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(Self::internal("history"))?;
        rows.into_iter()
            .map(Position::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn open_position(
        &self,
        challenge_id: Uuid,
        symbol: &str,
        side: crate::types::Side,
        qty: f64,
        leverage: i32,
        entry_price: f64,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
        margin_used: f64,
    ) -> AppResult<Position> {
        let row: PositionRow = sqlx::query_as(
            "INSERT INTO positions
                (challenge_id, symbol, side, qty, leverage, entry_price, take_profit,
                 stop_loss, margin_used)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING *",
        )
        .bind(challenge_id)
        .bind(symbol)
        .bind(side.as_str())
        .bind(qty)
        .bind(leverage)
        .bind(entry_price)
        .bind(take_profit)
        .bind(stop_loss)
        .bind(margin_used)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::internal("open_position"))?;
        Position::try_from(row).map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn close_position(
        &self,
        id: Uuid,
        close_price: f64,
        reason: crate::types::CloseReason,
        realized_pnl: f64,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE positions SET
                closed_at = now(), close_price = $2, close_reason = $3, realized_pnl = $4
             WHERE id = $1 AND closed_at IS NULL",
        )
        .bind(id)
        .bind(close_price)
        .bind(reason.as_str())
        .bind(realized_pnl)
        .execute(&self.pool)
        .await
        .map_err(Self::internal("close_position"))?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Daily counters
    // -------------------------------------------------------------------

    pub async fn upsert_daily_counter(
        &self,
        challenge_id: Uuid,
        day: NaiveDate,
        realized_pnl_delta: f64,
        worst_equity_drop_pct: f64,
        trades_opened_delta: i32,
    ) -> AppResult<DailyCounter> {
        let row: DailyCounter = sqlx::query_as(
            "INSERT INTO daily_counters (challenge_id, day, realized_pnl, worst_equity_drop_pct, trades_opened)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (challenge_id, day) DO UPDATE SET
                realized_pnl = daily_counters.realized_pnl + EXCLUDED.realized_pnl,
                worst_equity_drop_pct = GREATEST(daily_counters.worst_equity_drop_pct, EXCLUDED.worst_equity_drop_pct),
                trades_opened = daily_counters.trades_opened + EXCLUDED.trades_opened
             RETURNING *",
        )
        .bind(challenge_id)
        .bind(day)
        .bind(realized_pnl_delta)
        .bind(worst_equity_drop_pct)
        .bind(trades_opened_delta)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::internal("upsert_daily_counter"))?;
        Ok(row)
    }

    // -------------------------------------------------------------------
    // Payout requests
    // -------------------------------------------------------------------

    pub async fn get_payout(&self, id: Uuid) -> AppResult<Option<PayoutRequest>> {
        let row: Option<PayoutRequestRow> =
            sqlx::query_as("SELECT * FROM payout_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Self::internal("get_payout"))?;
        row.map(PayoutRequest::try_from)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn get_pending_payout(&self, challenge_id: Uuid) -> AppResult<Option<PayoutRequest>> {
        let row: Option<PayoutRequestRow> = sqlx::query_as(
            "SELECT * FROM payout_requests WHERE challenge_id = $1 AND status = 'pending'",
        )
        .bind(challenge_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::internal("get_pending_payout"))?;
        row.map(PayoutRequest::try_from)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn create_payout(
        &self,
        challenge_id: Uuid,
        amount: f64,
        wallet_address: &str,
        network: crate::types::PayoutNetwork,
    ) -> AppResult<PayoutRequest> {
        let row: PayoutRequestRow = sqlx::query_as(
            "INSERT INTO payout_requests (challenge_id, amount, wallet_address, network)
             VALUES ($1, $2, $3, $4)
             RETURNING *",
        )
        .bind(challenge_id)
        .bind(amount)
        .bind(wallet_address)
        .bind(network.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(Self::internal("create_payout"))?;
        PayoutRequest::try_from(row).map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn update_payout_status(
        &self,
        id: Uuid,
        status: PayoutStatus,
        tx_hash: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE payout_requests SET status = $2, tx_hash = COALESCE($3, tx_hash), updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .map_err(Self::internal("update_payout_status"))?;
        Ok(())
    }

    pub async fn list_pending_payouts(&self) -> AppResult<Vec<PayoutRequest>> {
        let rows: Vec<PayoutRequestRow> = sqlx::query_as(
            "SELECT * FROM payout_requests WHERE status = 'pending' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Self::internal("list_pending_payouts"))?;
        rows.into_iter()
            .map(PayoutRequest::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn list_payouts_for_challenge(&self, challenge_id: Uuid) -> AppResult<Vec<PayoutRequest>> {
        let rows: Vec<PayoutRequestRow> = sqlx::query_as(
            "SELECT * FROM payout_requests WHERE challenge_id = $1 ORDER BY created_at DESC",
        )
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::internal("list_payouts_for_challenge"))?;
        rows.into_iter()
            .map(PayoutRequest::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    // -------------------------------------------------------------------
    // Refresh tokens
    // -------------------------------------------------------------------

    pub async fn insert_refresh_token(
        &self,
        token: &str,
        user_id: Uuid,
        expires_at: chrono::DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query("INSERT INTO refresh_tokens (token, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(token)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(Self::internal("insert_refresh_token"))?;
        Ok(())
    }

    pub async fn get_refresh_token_user(&self, token: &str) -> AppResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM refresh_tokens WHERE token = $1 AND expires_at > now()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::internal("get_refresh_token_user"))?;
        Ok(row.map(|(id,)| id))
    }

    pub async fn delete_refresh_token(&self, token: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM refresh_tokens WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(Self::internal("delete_refresh_token"))?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Equity snapshots
    // -------------------------------------------------------------------

    /// Idempotent per day: re-running the same day's rollover (e.g. after a
    /// restart) overwrites rather than duplicating (spec.md §4.3 day
    /// boundary).
    pub async fn insert_equity_snapshot(
        &self,
        challenge_id: Uuid,
        day: NaiveDate,
        equity: f64,
        current_balance: f64,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO equity_snapshots (challenge_id, day, equity, current_balance)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (challenge_id, day) DO UPDATE SET
                equity = EXCLUDED.equity, current_balance = EXCLUDED.current_balance",
        )
        .bind(challenge_id)
        .bind(day)
        .bind(equity)
        .bind(current_balance)
        .execute(&self.pool)
        .await
        .map_err(Self::internal("insert_equity_snapshot"))?;
        Ok(())
    }

    pub async fn equity_curve(
        &self,
        challenge_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<EquitySnapshot>> {
        sqlx::query_as(
            "SELECT * FROM equity_snapshots WHERE challenge_id = $1 AND day BETWEEN $2 AND $3
             ORDER BY day",
        )
        .bind(challenge_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::internal("equity_curve"))
    }

    /// Closing balance as of the last snapshot strictly before `month_start`,
    /// used by the Leaderboard to compute this-month profit without a
    /// dedicated "balance at month start" column.
    pub async fn equity_before(
        &self,
        challenge_id: Uuid,
        month_start: NaiveDate,
    ) -> AppResult<Option<f64>> {
        let row: Option<(f64,)> = sqlx::query_as(
            "SELECT current_balance FROM equity_snapshots
             WHERE challenge_id = $1 AND day < $2 ORDER BY day DESC LIMIT 1",
        )
        .bind(challenge_id)
        .bind(month_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::internal("equity_before"))?;
        Ok(row.map(|(b,)| b))
    }

    // -------------------------------------------------------------------
    // Leaderboard
    // -------------------------------------------------------------------

    /// Funded challenges eligible for the monthly leaderboard (spec.md §4.6):
    /// currently funded, so still actively trading. Ranking math (profit
    /// since month start) is computed by the Leaderboard module against
    /// `equity_before`.
    pub async fn list_funded_challenges(&self) -> AppResult<Vec<Challenge>> {
        let rows: Vec<ChallengeRow> =
            sqlx::query_as("SELECT * FROM challenges WHERE status = 'funded'")
                .fetch_all(&self.pool)
                .await
                .map_err(Self::internal("list_funded_challenges"))?;
        rows.into_iter()
            .map(Challenge::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    /// All-time leaderboard candidates (spec.md §4.6): every challenge that
    /// ever reached funded, plus any failed challenge that nonetheless had a
    /// payout sent before failing (a trader can fail after being paid out).
    pub async fn list_alltime_leaderboard_candidates(&self) -> AppResult<Vec<Challenge>> {
        let rows: Vec<ChallengeRow> = sqlx::query_as(
            "SELECT c.* FROM challenges c
             WHERE c.status = 'funded'
                OR EXISTS (
                    SELECT 1 FROM payout_requests p
                    WHERE p.challenge_id = c.id AND p.status = 'sent'
                )",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Self::internal("list_alltime_leaderboard_candidates"))?;
        rows.into_iter()
            .map(Challenge::try_from)
            .collect::<Result<_, _>>()
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn begin(&self) -> AppResult<Transaction<'_, Postgres>> {
        self.pool.begin().await.map_err(Self::internal("begin"))
    }
}
