// =============================================================================
// Phase State Machine — Evaluation -> Verification -> Funded lifecycle
// =============================================================================
//
// Transitions are pure guard/action functions over `(Challenge, ChallengeType)`
// (spec.md §4.4), mirroring the teacher's `regime::detector` split between a
// stateless classifier and a stateful caller: `evaluate()` never touches the
// database, so it can be unit tested without a pool. `apply()` is the thin
// stateful shell the Risk Evaluator calls while already holding the
// challenge's writer lock (§5) — every DB write it performs and the
// `phase_transition`/`funded_success` push it emits happen before the lock is
// released.
// =============================================================================

use tracing::info;
use uuid::Uuid;

use crate::db::models::{Challenge, ChallengeType};
use crate::db::PgStore;
use crate::errors::AppResult;
use crate::push_channel::{PhaseTransitionPayload, PushChannel, PushEvent};
use crate::types::{AccountMode, ChallengeStatus, Role};

/// Account size never scales past this cap (spec.md §4.4).
const MAX_SCALED_BALANCE: f64 = 2_000_000.0;
const SCALING_STEP_FACTOR: f64 = 1.25;
const SCALING_TRIGGER_PCT: f64 = 0.10;

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    None,
    AdvanceToPhase2,
    AdvanceToFunded,
    ScaleFunded { new_initial_balance: f64 },
}

/// Pure evaluation: given the challenge's current marks (equity already
/// includes unrealized pnl, per spec.md §4.3 step 3) and no open positions,
/// decide what phase transition — if any — applies this tick.
///
/// Callers must only invoke this when `open_position_count == 0` for the
/// advancement guards (§4.4 "no open positions"); scaling has no such
/// requirement and is checked independently.
pub fn evaluate(
    challenge: &Challenge,
    challenge_type: &ChallengeType,
    equity: f64,
    open_position_count: usize,
) -> Transition {
    if challenge.status == ChallengeStatus::Funded {
        if let Some(new_balance) = scaling_check(challenge) {
            return Transition::ScaleFunded {
                new_initial_balance: new_balance,
            };
        }
        return Transition::None;
    }

    if open_position_count > 0 {
        return Transition::None;
    }
    if challenge.status.is_terminal() {
        return Transition::None;
    }

    let min_days_met =
        challenge_type.is_instant || challenge.trading_days_count >= challenge_type.min_trading_days;
    if !min_days_met {
        return Transition::None;
    }

    match challenge.status {
        ChallengeStatus::Phase1 => {
            let target = challenge.initial_balance * challenge_type.profit_target_p1 / 100.0;
            if equity - challenge.initial_balance >= target {
                if challenge_type.is_one_phase {
                    Transition::AdvanceToFunded
                } else {
                    Transition::AdvanceToPhase2
                }
            } else {
                Transition::None
            }
        }
        ChallengeStatus::Phase2 => {
            let target = challenge.initial_balance * challenge_type.profit_target_p2 / 100.0;
            if equity - challenge.initial_balance >= target {
                Transition::AdvanceToFunded
            } else {
                Transition::None
            }
        }
        _ => Transition::None,
    }
}

/// `realized P&L since last scaling step ≥ 10% of current account size`
/// (spec.md §4.4). `initial_balance` is bumped to the new account size on
/// every scaling step, so "since last scaling step" falls out of comparing
/// against the *current* `initial_balance` rather than needing a dedicated
/// baseline column.
fn scaling_check(challenge: &Challenge) -> Option<f64> {
    if challenge.initial_balance >= MAX_SCALED_BALANCE {
        return None;
    }
    let since_last_step = challenge.current_balance - challenge.initial_balance;
    if since_last_step >= challenge.initial_balance * SCALING_TRIGGER_PCT {
        let scaled = (challenge.initial_balance * SCALING_STEP_FACTOR).min(MAX_SCALED_BALANCE);
        Some(scaled)
    } else {
        None
    }
}

/// Applies `transition` to durable state and publishes the corresponding
/// Push Channel event. Caller must hold the challenge's writer lock.
pub async fn apply(
    store: &PgStore,
    push: &PushChannel,
    challenge: &Challenge,
    transition: Transition,
) -> AppResult<()> {
    match transition {
        Transition::None => Ok(()),
        Transition::AdvanceToPhase2 => {
            store
                .transition_challenge(
                    challenge.id,
                    ChallengeStatus::Phase2,
                    challenge.account_mode,
                    challenge.scaling_step,
                    None,
                    None,
                )
                .await?;
            publish_phase_transition(push, challenge.id, ChallengeStatus::Phase1, ChallengeStatus::Phase2);
            info!(challenge_id = %challenge.id, "advanced phase1 -> phase2");
            Ok(())
        }
        Transition::AdvanceToFunded => {
            store
                .transition_challenge(
                    challenge.id,
                    ChallengeStatus::Funded,
                    AccountMode::Funded,
                    challenge.scaling_step,
                    None,
                    Some(challenge.total_pnl_realized),
                )
                .await?;
            store
                .set_user_role(challenge.user_id, Role::FundedTrader)
                .await?;
            publish_phase_transition(push, challenge.id, challenge.status, ChallengeStatus::Funded);
            info!(challenge_id = %challenge.id, "advanced to funded");
            Ok(())
        }
        Transition::ScaleFunded { new_initial_balance } => {
            store
                .transition_challenge(
                    challenge.id,
                    ChallengeStatus::Funded,
                    AccountMode::Funded,
                    challenge.scaling_step + 1,
                    Some(new_initial_balance),
                    None,
                )
                .await?;
            publish_phase_transition(push, challenge.id, ChallengeStatus::Funded, ChallengeStatus::Funded);
            info!(
                challenge_id = %challenge.id,
                new_initial_balance,
                "scaled funded account"
            );
            Ok(())
        }
    }
}

fn publish_phase_transition(
    push: &PushChannel,
    challenge_id: Uuid,
    from: ChallengeStatus,
    to: ChallengeStatus,
) {
    push.publish(
        challenge_id,
        PushEvent::PhaseTransition(PhaseTransitionPayload {
            challenge_id,
            from_status: from.as_str().to_string(),
            to_status: to.as_str().to_string(),
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn base_challenge(status: ChallengeStatus) -> Challenge {
        Challenge {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            type_id: Uuid::new_v4(),
            status,
            account_mode: AccountMode::Demo,
            initial_balance: 10_000.0,
            current_balance: 10_000.0,
            peak_equity: 10_000.0,
            daily_anchor_equity: 10_000.0,
            daily_pnl_realized: 0.0,
            total_pnl_realized: 0.0,
            trading_days_count: 5,
            scaling_step: 0,
            attempt_number: 1,
            failed_reason: None,
            started_at: Utc::now(),
            transitioned_at: None,
            failed_at: None,
            last_daily_rollover_at: Utc::now().date_naive(),
            funded_pnl_baseline: 0.0,
        }
    }

    fn base_type() -> ChallengeType {
        ChallengeType {
            id: Uuid::new_v4(),
            name: "Standard 10k".into(),
            account_size: 10_000.0,
            price: 99.0,
            profit_target_p1: 8.0,
            profit_target_p2: 5.0,
            max_daily_loss_pct: 5.0,
            max_total_loss_pct: 10.0,
            min_trading_days: 4,
            drawdown_type: crate::types::DrawdownType::Trailing,
            max_leverage: 10,
            profit_split_pct: 80.0,
            is_one_phase: false,
            is_instant: false,
            min_payout: 50.0,
            active: true,
        }
    }

    #[test]
    fn phase1_advances_when_target_met_and_flat() {
        let challenge = base_challenge(ChallengeStatus::Phase1);
        let ct = base_type();
        let equity = 10_000.0 + 800.0; // exactly 8%
        assert_eq!(evaluate(&challenge, &ct, equity, 0), Transition::AdvanceToPhase2);
    }

    #[test]
    fn phase1_does_not_advance_with_open_positions() {
        let challenge = base_challenge(ChallengeStatus::Phase1);
        let ct = base_type();
        assert_eq!(evaluate(&challenge, &ct, 10_900.0, 1), Transition::None);
    }

    #[test]
    fn phase1_does_not_advance_before_min_trading_days() {
        let mut challenge = base_challenge(ChallengeStatus::Phase1);
        challenge.trading_days_count = 1;
        let ct = base_type();
        assert_eq!(evaluate(&challenge, &ct, 10_900.0, 0), Transition::None);
    }

    #[test]
    fn one_phase_skips_phase2() {
        let challenge = base_challenge(ChallengeStatus::Phase1);
        let mut ct = base_type();
        ct.is_one_phase = true;
        assert_eq!(evaluate(&challenge, &ct, 10_900.0, 0), Transition::AdvanceToFunded);
    }

    #[test]
    fn instant_skips_min_trading_days() {
        let mut challenge = base_challenge(ChallengeStatus::Phase1);
        challenge.trading_days_count = 0;
        let mut ct = base_type();
        ct.is_instant = true;
        assert_eq!(evaluate(&challenge, &ct, 10_900.0, 0), Transition::AdvanceToPhase2);
    }

    #[test]
    fn phase2_advances_to_funded() {
        let challenge = base_challenge(ChallengeStatus::Phase2);
        let ct = base_type();
        assert_eq!(evaluate(&challenge, &ct, 10_500.0, 0), Transition::AdvanceToFunded);
    }

    #[test]
    fn funded_scales_at_10_percent_profit() {
        let mut challenge = base_challenge(ChallengeStatus::Funded);
        challenge.current_balance = 11_000.0;
        let ct = base_type();
        match evaluate(&challenge, &ct, 11_000.0, 0) {
            Transition::ScaleFunded { new_initial_balance } => {
                assert!((new_initial_balance - 12_500.0).abs() < 1e-9);
            }
            other => panic!("expected ScaleFunded, got {other:?}"),
        }
    }

    #[test]
    fn funded_does_not_scale_past_cap() {
        let mut challenge = base_challenge(ChallengeStatus::Funded);
        challenge.initial_balance = MAX_SCALED_BALANCE;
        challenge.current_balance = MAX_SCALED_BALANCE * 1.2;
        let ct = base_type();
        assert_eq!(evaluate(&challenge, &ct, 0.0, 0), Transition::None);
    }

    #[test]
    fn failed_challenge_never_transitions() {
        let challenge = base_challenge(ChallengeStatus::Failed);
        let ct = base_type();
        assert_eq!(evaluate(&challenge, &ct, 1_000_000.0, 0), Transition::None);
    }
}
