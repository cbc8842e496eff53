// =============================================================================
// Trade Ledger — authoritative position store with per-challenge single-writer
// =============================================================================
//
// Grounded on the teacher's `position_engine::PositionManager` (open/close
// lifecycle, `Position` shape, tracing fields) but backed by Postgres instead
// of an in-process `Vec`, and serialized per challenge with a
// `tokio::sync::Mutex<()>` rather than `parking_lot::RwLock` — the critical
// section here spans `.await` points (DB round-trips), which a
// `parking_lot` guard may not hold across (see DESIGN.md).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::{Challenge, Position};
use crate::db::PgStore;
use crate::errors::LedgerError;
use crate::price_feed::PriceFeed;
use crate::push_channel::{PushChannel, PushEvent};
use crate::types::{ChallengeStatus, CloseReason, Side};

pub struct TradeLedger {
    store: PgStore,
    price_feed: Arc<PriceFeed>,
    push: Arc<PushChannel>,
    writer_locks: SyncRwLock<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

pub struct HistoryFilters {
    pub symbol: Option<String>,
    pub side: Option<Side>,
}

impl TradeLedger {
    pub fn new(store: PgStore, price_feed: Arc<PriceFeed>, push: Arc<PushChannel>) -> Self {
        Self {
            store,
            price_feed,
            push,
            writer_locks: SyncRwLock::new(HashMap::new()),
        }
    }

    fn lock_for(&self, challenge_id: Uuid) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.writer_locks.read().get(&challenge_id) {
            return lock.clone();
        }
        self.writer_locks
            .write()
            .entry(challenge_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Exposes the same per-challenge writer lock `open_position`/
    /// `close_position` serialize on, so the Risk Evaluator can hold it
    /// across its own mutations (spec.md §4.4: "evaluated inside the same
    /// per-challenge writer lock").
    pub fn writer_lock(&self, challenge_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.lock_for(challenge_id)
    }

    // -------------------------------------------------------------------
    // OpenPosition
    // -------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn open_position(
        &self,
        challenge_id: Uuid,
        symbol: &str,
        side: Side,
        qty: f64,
        leverage: i32,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
    ) -> Result<Position, LedgerError> {
        let lock = self.lock_for(challenge_id);
        let _guard = lock.lock().await;

        // Price read happens before acquiring no further locks are needed —
        // the mutex above already serializes this challenge (spec.md §5:
        // "perform all price reads before acquiring the writer lock" applies
        // to the Risk Evaluator tick; here the read and the lock are the
        // same critical section since OpenPosition itself is the mutation).
        let entry_price = self
            .price_feed
            .latest(symbol)
            .ok_or(LedgerError::PriceUnavailable)?;

        let challenge = self
            .store
            .get_challenge(challenge_id)
            .await
            .map_err(|_| LedgerError::Conflict)?
            .ok_or(LedgerError::Conflict)?;

        if !challenge.status.is_active() {
            return Err(LedgerError::ChallengeTerminal);
        }

        let challenge_type = self
            .store
            .get_challenge_type(challenge.type_id)
            .await
            .map_err(|_| LedgerError::Conflict)?
            .ok_or(LedgerError::SymbolUnknown)?;

        if leverage < 1 || leverage > challenge_type.max_leverage {
            return Err(LedgerError::InvalidLeverage);
        }

        if !self.price_feed.tracked_symbols().iter().any(|s| s == symbol) {
            return Err(LedgerError::SymbolUnknown);
        }

        validate_tp_sl(side, entry_price, take_profit, stop_loss)?;

        let margin_used = qty * entry_price / leverage as f64;

        let open_positions = self
            .store
            .list_open_positions(challenge_id)
            .await
            .map_err(|_| LedgerError::Conflict)?;
        let margin_in_use: f64 = open_positions.iter().map(|p| p.margin_used).sum();
        let free_margin = challenge.current_balance - margin_in_use;
        if free_margin < margin_used {
            return Err(LedgerError::InsufficientMargin);
        }

        // Soft pre-trade drawdown check (§4.2 step 6) — logged only; the
        // Risk Evaluator is the authority that actually force-closes.
        let worst_case_loss = stop_loss
            .map(|sl| qty * (entry_price - sl).abs())
            .unwrap_or(margin_used);
        let worst_open_unrealized: f64 = open_positions
            .iter()
            .map(|p| self.price_feed.latest(&p.symbol).map(|mark| p.unrealized_pnl(mark)).unwrap_or(0.0))
            .filter(|pnl| *pnl < 0.0)
            .sum();
        let projected_daily_loss_pct = ((-challenge.daily_pnl_realized + worst_case_loss
            - worst_open_unrealized)
            / challenge.daily_anchor_equity.max(1.0))
            * 100.0;
        if projected_daily_loss_pct >= challenge_type.max_daily_loss_pct {
            warn!(
                challenge_id = %challenge_id,
                symbol,
                projected_daily_loss_pct,
                limit = challenge_type.max_daily_loss_pct,
                "position open projected to approach daily drawdown limit"
            );
        }

        let position = self
            .store
            .open_position(
                challenge_id,
                symbol,
                side,
                qty,
                leverage,
                entry_price,
                take_profit,
                stop_loss,
                margin_used,
            )
            .await
            .map_err(|_| LedgerError::Conflict)?;

        let day = Utc::now().date_naive();
        let _ = self.store.upsert_daily_counter(challenge_id, day, 0.0, 0.0, 1).await;

        info!(
            challenge_id = %challenge_id,
            position_id = %position.id,
            symbol,
            side = %side,
            qty,
            leverage,
            entry_price,
            "position opened"
        );

        self.push
            .publish(challenge_id, PushEvent::PositionOpened(position.clone()));

        Ok(position)
    }

    // -------------------------------------------------------------------
    // ClosePosition
    // -------------------------------------------------------------------

    pub async fn close_position(
        &self,
        position_id: Uuid,
        reason: CloseReason,
        price: Option<f64>,
    ) -> Result<Position, LedgerError> {
        let position = self
            .store
            .get_position(position_id)
            .await
            .map_err(|_| LedgerError::Conflict)?
            .ok_or(LedgerError::Conflict)?;

        if !position.is_open() {
            return Err(LedgerError::Conflict);
        }

        let lock = self.lock_for(position.challenge_id);
        let _guard = lock.lock().await;

        self.close_position_locked(position, reason, price).await
    }

    /// Callable while the challenge's writer lock is already held (the Risk
    /// Evaluator's force-close path); does not re-acquire the lock.
    pub async fn close_position_locked(
        &self,
        position: Position,
        reason: CloseReason,
        price: Option<f64>,
    ) -> Result<Position, LedgerError> {
        let challenge = self
            .store
            .get_challenge(position.challenge_id)
            .await
            .map_err(|_| LedgerError::Conflict)?
            .ok_or(LedgerError::Conflict)?;

        if challenge.status == ChallengeStatus::Failed && reason != CloseReason::DailyDrawdown
            && reason != CloseReason::TrailingDrawdown
        {
            return Err(LedgerError::ChallengeTerminal);
        }

        let close_price = match price {
            Some(p) => p,
            None => self
                .price_feed
                .latest(&position.symbol)
                .ok_or(LedgerError::PriceUnavailable)?,
        };

        let realized_pnl = position.qty * (close_price - position.entry_price) * position.side.sign();

        self.store
            .close_position(position.id, close_price, reason, realized_pnl)
            .await
            .map_err(|_| LedgerError::Conflict)?;

        let new_balance = challenge.current_balance + realized_pnl;
        let new_daily = challenge.daily_pnl_realized + realized_pnl;
        let new_total = challenge.total_pnl_realized + realized_pnl;
        self.store
            .update_challenge_marks(
                challenge.id,
                new_balance,
                challenge.peak_equity,
                challenge.daily_anchor_equity,
                new_daily,
                new_total,
            )
            .await
            .map_err(|_| LedgerError::Conflict)?;

        let day = Utc::now().date_naive();
        let _ = self
            .store
            .upsert_daily_counter(challenge.id, day, realized_pnl, 0.0, 0)
            .await;

        let mut closed = position;
        closed.closed_at = Some(Utc::now());
        closed.close_price = Some(close_price);
        closed.close_reason = Some(reason);
        closed.realized_pnl = Some(realized_pnl);

        info!(
            challenge_id = %closed.challenge_id,
            position_id = %closed.id,
            reason = %reason,
            close_price,
            realized_pnl,
            "position closed"
        );

        self.push
            .publish(closed.challenge_id, PushEvent::PositionClosed(closed.clone()));

        Ok(closed)
    }

    pub async fn list_open(&self, challenge_id: Uuid) -> Result<Vec<Position>, LedgerError> {
        self.store
            .list_open_positions(challenge_id)
            .await
            .map_err(|_| LedgerError::Conflict)
    }

    pub async fn history(
        &self,
        challenge_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
        filters: HistoryFilters,
    ) -> Result<Vec<Position>, LedgerError> {
        let mut page = self
            .store
            .history(challenge_id, limit.clamp(1, 200), cursor)
            .await
            .map_err(|_| LedgerError::Conflict)?;

        if let Some(symbol) = &filters.symbol {
            page.retain(|p| &p.symbol == symbol);
        }
        if let Some(side) = filters.side {
            page.retain(|p| p.side == side);
        }

        Ok(page)
    }

    /// Force-close every open position of `challenge` at the current mark,
    /// used by the Risk Evaluator on a daily/trailing drawdown breach and by
    /// the manual "close all" admin/user endpoint. Caller must already hold
    /// the challenge's writer lock.
    pub async fn force_close_all_locked(
        &self,
        challenge: &Challenge,
        reason: CloseReason,
    ) -> Vec<Position> {
        let open = match self.store.list_open_positions(challenge.id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(challenge_id = %challenge.id, error = %e, "failed to list open positions for force-close");
                return Vec::new();
            }
        };

        let mut closed = Vec::with_capacity(open.len());
        for position in open {
            let mark = self.price_feed.latest(&position.symbol);
            match self
                .close_position_locked(position, reason, mark)
                .await
            {
                Ok(p) => closed.push(p),
                Err(e) => warn!(challenge_id = %challenge.id, error = %e, "force-close failed for a position"),
            }
        }
        closed
    }
}

fn validate_tp_sl(
    side: Side,
    entry_price: f64,
    take_profit: Option<f64>,
    stop_loss: Option<f64>,
) -> Result<(), LedgerError> {
    if let Some(tp) = take_profit {
        let ok = match side {
            Side::Long => tp > entry_price,
            Side::Short => tp < entry_price,
        };
        if !ok {
            return Err(LedgerError::InvalidTpSl);
        }
    }
    if let Some(sl) = stop_loss {
        let ok = match side {
            Side::Long => sl < entry_price,
            Side::Short => sl > entry_price,
        };
        if !ok {
            return Err(LedgerError::InvalidTpSl);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tp_sl_validation_long() {
        assert!(validate_tp_sl(Side::Long, 100.0, Some(110.0), Some(90.0)).is_ok());
        assert!(validate_tp_sl(Side::Long, 100.0, Some(90.0), None).is_err());
        assert!(validate_tp_sl(Side::Long, 100.0, None, Some(110.0)).is_err());
    }

    #[test]
    fn tp_sl_validation_short() {
        assert!(validate_tp_sl(Side::Short, 100.0, Some(90.0), Some(110.0)).is_ok());
        assert!(validate_tp_sl(Side::Short, 100.0, Some(110.0), None).is_err());
        assert!(validate_tp_sl(Side::Short, 100.0, None, Some(90.0)).is_err());
    }

    #[test]
    fn tp_sl_none_is_valid() {
        assert!(validate_tp_sl(Side::Long, 100.0, None, None).is_ok());
    }
}
