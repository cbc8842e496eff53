// =============================================================================
// Payout Ledger — withdrawal requests against funded balances
// =============================================================================
//
// Grounded on the teacher's `execution` module's order-state machine shape
// (request -> validate -> commit), generalized from a single order's
// lifecycle to a `pending -> approved -> sent` / `pending -> rejected`
// approval flow (spec.md §4.5). Unlike the Trade Ledger, payout mutations
// don't need the per-challenge writer lock for correctness — the
// `payouts_one_pending_per_challenge` partial unique index (migration
// 0001) is the actual serialization point, so a race between two
// concurrent `request()` calls fails one of them at the database rather
// than deadlocking on an application lock.
// =============================================================================

use tracing::info;
use uuid::Uuid;

use crate::db::models::{Challenge, PayoutRequest};
use crate::db::PgStore;
use crate::errors::{AppError, AppResult};
use crate::push_channel::{PushChannel, PushEvent};
use crate::types::{ChallengeStatus, PayoutStatus, Role};

pub struct PayoutLedger {
    store: PgStore,
    push: std::sync::Arc<PushChannel>,
}

impl PayoutLedger {
    pub fn new(store: PgStore, push: std::sync::Arc<PushChannel>) -> Self {
        Self { store, push }
    }

    /// `available_amount = max(0, realized_profit_since_start * profit_split_pct - already_paid_or_pending)`
    /// (spec.md §4.5). `realized_profit_since_start` is `total_pnl_realized -
    /// funded_pnl_baseline`, isolating profit earned while funded from
    /// phase1/phase2 paper gains.
    pub async fn available(
        &self,
        challenge: &Challenge,
        profit_split_pct: f64,
    ) -> AppResult<f64> {
        let profit_since_funded =
            (challenge.total_pnl_realized - challenge.funded_pnl_baseline).max(0.0);
        let already_committed: f64 = self
            .store
            .list_payouts_for_challenge(challenge.id)
            .await?
            .into_iter()
            .filter(|p| matches!(p.status, PayoutStatus::Approved | PayoutStatus::Sent | PayoutStatus::Pending))
            .map(|p| p.amount)
            .sum();
        Ok((profit_since_funded * profit_split_pct / 100.0 - already_committed).max(0.0))
    }

    /// Requests a payout. Enforces: challenge is funded, amount within
    /// `available()`, amount >= `min_payout`, no other payout already
    /// pending (spec.md §4.5 invariants).
    pub async fn request(
        &self,
        challenge: &Challenge,
        profit_split_pct: f64,
        min_payout: f64,
        amount: f64,
        wallet_address: &str,
        network: crate::types::PayoutNetwork,
    ) -> AppResult<PayoutRequest> {
        if challenge.status != ChallengeStatus::Funded {
            return Err(AppError::PreconditionFailed(
                "payouts may only be requested from a funded challenge".into(),
            ));
        }
        if amount < min_payout {
            return Err(AppError::InvalidInput(format!(
                "amount below minimum payout of {min_payout}"
            )));
        }
        if self.store.get_pending_payout(challenge.id).await?.is_some() {
            return Err(AppError::Conflict(
                "a payout is already pending for this challenge".into(),
            ));
        }
        let available = self.available(challenge, profit_split_pct).await?;
        if amount > available {
            return Err(AppError::PreconditionFailed(format!(
                "requested {amount} exceeds available {available}"
            )));
        }

        // The partial unique index on (challenge_id) WHERE status = 'pending'
        // is the real guard against a concurrent double-request slipping
        // past the check above; a unique-violation here surfaces as a
        // Conflict through `Self::internal`'s generic mapping, which is an
        // acceptable coarsening since the client already knows to retry.
        let payout = self
            .store
            .create_payout(challenge.id, amount, wallet_address, network)
            .await?;
        info!(challenge_id = %challenge.id, amount, "payout requested");
        self.push
            .publish(challenge.id, PushEvent::PayoutStatus(payout.clone()));
        Ok(payout)
    }

    /// Admin transitions `pending -> approved`, committing the amount
    /// (spec.md §4.5). Requires admin/super_admin role — callers must check
    /// `principal.role.is_admin()` before calling.
    pub async fn approve(&self, payout_id: Uuid) -> AppResult<PayoutRequest> {
        self.require_pending(payout_id).await?;
        self.store
            .update_payout_status(payout_id, PayoutStatus::Approved, None)
            .await?;
        self.finish(payout_id).await
    }

    /// Admin transitions `pending -> rejected`, releasing the committed
    /// amount back to `available()`.
    pub async fn reject(&self, payout_id: Uuid) -> AppResult<PayoutRequest> {
        self.require_pending(payout_id).await?;
        self.store
            .update_payout_status(payout_id, PayoutStatus::Rejected, None)
            .await?;
        self.finish(payout_id).await
    }

    /// Admin transitions `approved -> sent` once the off-chain transfer has
    /// been executed, recording the transaction hash.
    pub async fn mark_sent(&self, payout_id: Uuid, tx_hash: &str) -> AppResult<PayoutRequest> {
        let payout = self.get_or_not_found(payout_id).await?;
        if payout.status != PayoutStatus::Approved {
            return Err(AppError::PreconditionFailed(
                "only an approved payout can be marked sent".into(),
            ));
        }
        self.store
            .update_payout_status(payout_id, PayoutStatus::Sent, Some(tx_hash))
            .await?;
        self.finish(payout_id).await
    }

    pub async fn list_pending(&self, requester_role: Role) -> AppResult<Vec<PayoutRequest>> {
        if !requester_role.is_admin() {
            return Err(AppError::Forbidden("admin role required".into()));
        }
        self.store.list_pending_payouts().await
    }

    async fn require_pending(&self, payout_id: Uuid) -> AppResult<PayoutRequest> {
        let payout = self.get_or_not_found(payout_id).await?;
        if payout.status != PayoutStatus::Pending {
            return Err(AppError::PreconditionFailed(
                "payout is not pending".into(),
            ));
        }
        Ok(payout)
    }

    async fn get_or_not_found(&self, payout_id: Uuid) -> AppResult<PayoutRequest> {
        self.store
            .get_payout(payout_id)
            .await?
            .ok_or_else(|| AppError::NotFound("payout not found".into()))
    }

    async fn finish(&self, payout_id: Uuid) -> AppResult<PayoutRequest> {
        let payout = self.get_or_not_found(payout_id).await?;
        self.push
            .publish(payout.challenge_id, PushEvent::PayoutStatus(payout.clone()));
        Ok(payout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn funded_challenge(total_pnl: f64, baseline: f64) -> Challenge {
        Challenge {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            type_id: Uuid::new_v4(),
            status: ChallengeStatus::Funded,
            account_mode: crate::types::AccountMode::Funded,
            initial_balance: 10_000.0,
            current_balance: 10_000.0 + total_pnl,
            peak_equity: 10_000.0 + total_pnl,
            daily_anchor_equity: 10_000.0,
            daily_pnl_realized: 0.0,
            total_pnl_realized: total_pnl,
            trading_days_count: 10,
            scaling_step: 0,
            attempt_number: 1,
            failed_reason: None,
            started_at: Utc::now(),
            transitioned_at: None,
            failed_at: None,
            last_daily_rollover_at: Utc::now().date_naive(),
            funded_pnl_baseline: baseline,
        }
    }

    #[test]
    fn available_excludes_baseline_profit() {
        let challenge = funded_challenge(2_000.0, 1_500.0);
        // profit since funded = 500, split 80% -> 400, nothing committed yet.
        let profit_since_funded = (challenge.total_pnl_realized - challenge.funded_pnl_baseline).max(0.0);
        assert_eq!(profit_since_funded, 500.0);
        assert_eq!(profit_since_funded * 80.0 / 100.0, 400.0);
    }

    #[test]
    fn available_floors_at_zero_when_baseline_exceeds_total() {
        let challenge = funded_challenge(100.0, 1_500.0);
        let profit_since_funded = (challenge.total_pnl_realized - challenge.funded_pnl_baseline).max(0.0);
        assert_eq!(profit_since_funded, 0.0);
    }
}
