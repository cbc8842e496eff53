// =============================================================================
// Leaderboard Aggregator — monthly and all-time challenge rankings
// =============================================================================
//
// Grounded on the teacher's `arena` module's ranking/profile aggregation
// (sort-then-cache) and `cache::leaderboard_key` for the Redis cache-aside
// pattern (spec.md §4.6: "cached 60s keyed by (scope, limit)"). Ranking
// itself stays a plain in-process sort over candidates pulled from Postgres
// rather than a SQL `ORDER BY`, since the profit-percentage metric differs
// between monthly and all-time and isn't expressible as a single column.
// =============================================================================

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::cache::{leaderboard_key, Cache};
use crate::db::PgStore;
use crate::errors::AppResult;

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub challenge_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub profit_pct: f64,
    pub trading_days_count: i32,
    pub started_at: DateTime<Utc>,
}

pub struct Leaderboard {
    store: PgStore,
    cache: Cache,
    cache_ttl_s: u64,
}

impl Leaderboard {
    pub fn new(store: PgStore, cache: Cache, cache_ttl_s: u64) -> Self {
        Self {
            store,
            cache,
            cache_ttl_s,
        }
    }

    /// `profit_pct = (current_balance - initial_balance_at_month_start) /
    /// initial_balance_at_month_start * 100` over currently funded
    /// challenges (spec.md §4.6). A challenge with no equity snapshot
    /// before this month (funded mid-month) falls back to its
    /// `initial_balance`, the natural "start of participation" baseline.
    pub async fn monthly(&self, limit: i64) -> AppResult<Vec<LeaderboardEntry>> {
        let key = leaderboard_key(&format!("monthly:{limit}"));
        if let Some(cached) = self.cache.get_json::<Vec<LeaderboardEntry>>(&key).await {
            return Ok(cached);
        }

        let month_start = chrono::Utc::now().date_naive().with_day(1).expect("day 1 always valid");
        let candidates = self.store.list_funded_challenges().await?;

        let mut entries = Vec::with_capacity(candidates.len());
        for challenge in candidates {
            let baseline = self
                .store
                .equity_before(challenge.id, month_start)
                .await?
                .unwrap_or(challenge.initial_balance);
            if baseline <= 0.0 {
                continue;
            }
            let profit_pct = (challenge.current_balance - baseline) / baseline * 100.0;
            let Some(user) = self.store.get_user(challenge.user_id).await? else {
                continue;
            };
            entries.push(LeaderboardEntry {
                challenge_id: challenge.id,
                user_id: challenge.user_id,
                display_name: user.display_name,
                profit_pct,
                trading_days_count: challenge.trading_days_count,
                started_at: challenge.started_at,
            });
        }

        rank(&mut entries);
        entries.truncate(limit.max(0) as usize);
        self.cache.set_json(&key, &entries, self.cache_ttl_s).await;
        Ok(entries)
    }

    /// All-time ranking against each challenge's own `initial_balance`
    /// (spec.md §4.6). Candidates: every challenge that reached funded, plus
    /// any that failed after a payout was sent.
    pub async fn all_time(&self, limit: i64) -> AppResult<Vec<LeaderboardEntry>> {
        let key = leaderboard_key(&format!("alltime:{limit}"));
        if let Some(cached) = self.cache.get_json::<Vec<LeaderboardEntry>>(&key).await {
            return Ok(cached);
        }

        let candidates = self.store.list_alltime_leaderboard_candidates().await?;
        let mut entries = Vec::with_capacity(candidates.len());
        for challenge in candidates {
            if challenge.initial_balance <= 0.0 {
                continue;
            }
            let profit_pct = (challenge.current_balance - challenge.initial_balance)
                / challenge.initial_balance
                * 100.0;
            let Some(user) = self.store.get_user(challenge.user_id).await? else {
                continue;
            };
            entries.push(LeaderboardEntry {
                challenge_id: challenge.id,
                user_id: challenge.user_id,
                display_name: user.display_name,
                profit_pct,
                trading_days_count: challenge.trading_days_count,
                started_at: challenge.started_at,
            });
        }

        rank(&mut entries);
        entries.truncate(limit.max(0) as usize);
        self.cache.set_json(&key, &entries, self.cache_ttl_s).await;
        Ok(entries)
    }
}

/// Sort descending by `profit_pct`; tie-break by smaller `trading_days_count`
/// (faster), then by earliest `started_at` (spec.md §4.6).
fn rank(entries: &mut [LeaderboardEntry]) {
    entries.sort_by(|a, b| {
        b.profit_pct
            .partial_cmp(&a.profit_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.trading_days_count.cmp(&b.trading_days_count))
            .then(a.started_at.cmp(&b.started_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(profit_pct: f64, days: i32) -> LeaderboardEntry {
        entry_at(profit_pct, days, Utc::now())
    }

    fn entry_at(profit_pct: f64, days: i32, started_at: DateTime<Utc>) -> LeaderboardEntry {
        LeaderboardEntry {
            challenge_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            display_name: "x".into(),
            profit_pct,
            trading_days_count: days,
            started_at,
        }
    }

    #[test]
    fn ranks_by_profit_descending() {
        let mut entries = vec![entry(5.0, 10), entry(12.0, 10), entry(8.0, 10)];
        rank(&mut entries);
        assert_eq!(entries[0].profit_pct, 12.0);
        assert_eq!(entries[1].profit_pct, 8.0);
        assert_eq!(entries[2].profit_pct, 5.0);
    }

    #[test]
    fn ties_break_by_fewer_trading_days() {
        let mut entries = vec![entry(10.0, 20), entry(10.0, 5)];
        rank(&mut entries);
        assert_eq!(entries[0].trading_days_count, 5);
    }

    #[test]
    fn ties_break_by_earliest_started_at() {
        let earlier = Utc::now() - chrono::Duration::days(10);
        let later = Utc::now();
        let mut entries = vec![entry_at(10.0, 5, later), entry_at(10.0, 5, earlier)];
        rank(&mut entries);
        assert_eq!(entries[0].started_at, earlier);
    }
}
