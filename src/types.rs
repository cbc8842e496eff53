// =============================================================================
// Shared types used across the prop-trading evaluation engine
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// System-wide maintenance switch (distinct from a single challenge's own
/// `ChallengeStatus`). An operator can pause or kill new trading activity
/// engine-wide without touching any individual challenge's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Live
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// A user's role in the platform. Roles only ever escalate
/// (`trader` -> `funded_trader`); `admin`/`super_admin` are granted out of
/// band and never assigned by engine logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Trader,
    FundedTrader,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Trader => "trader",
            Role::FundedTrader => "funded_trader",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trader" => Ok(Role::Trader),
            "funded_trader" => Ok(Role::FundedTrader),
            "admin" => Ok(Role::Admin),
            "super_admin" => Ok(Role::SuperAdmin),
            _ => Err(()),
        }
    }
}

/// Lifecycle state of a Challenge (account). See spec.md §3, §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Phase1,
    Phase2,
    Funded,
    Failed,
    Completed,
}

impl ChallengeStatus {
    /// Terminal statuses are immutable — no further transition is legal.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChallengeStatus::Failed | ChallengeStatus::Completed)
    }

    /// The "active" statuses — at most one per user (§3 invariant).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ChallengeStatus::Phase1 | ChallengeStatus::Phase2 | ChallengeStatus::Funded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeStatus::Phase1 => "phase1",
            ChallengeStatus::Phase2 => "phase2",
            ChallengeStatus::Funded => "funded",
            ChallengeStatus::Failed => "failed",
            ChallengeStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChallengeStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phase1" => Ok(ChallengeStatus::Phase1),
            "phase2" => Ok(ChallengeStatus::Phase2),
            "funded" => Ok(ChallengeStatus::Funded),
            "failed" => Ok(ChallengeStatus::Failed),
            "completed" => Ok(ChallengeStatus::Completed),
            _ => Err(()),
        }
    }
}

/// Whether a challenge is trading on a simulated or funded (profit-sharing)
/// basis. Distinct from [`ChallengeStatus`]: account mode flips to `Funded`
/// the instant `status` becomes `Funded`, and never flips back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountMode {
    Demo,
    Funded,
}

impl fmt::Display for AccountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountMode::Demo => write!(f, "demo"),
            AccountMode::Funded => write!(f, "funded"),
        }
    }
}

impl std::str::FromStr for AccountMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "demo" => Ok(AccountMode::Demo),
            "funded" => Ok(AccountMode::Funded),
            _ => Err(()),
        }
    }
}

/// Drawdown accounting basis for a [`crate::db::models::ChallengeType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawdownType {
    /// Measured against `initial_balance`; never moves for the life of the
    /// challenge (spec.md §9 Open Question — the "static" variant, made
    /// explicit here since the source only ever exercised "trailing").
    Static,
    /// Measured against `peak_equity`, the high-water mark.
    Trailing,
}

impl fmt::Display for DrawdownType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawdownType::Static => write!(f, "static"),
            DrawdownType::Trailing => write!(f, "trailing"),
        }
    }
}

impl std::str::FromStr for DrawdownType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(DrawdownType::Static),
            "trailing" => Ok(DrawdownType::Trailing),
            _ => Err(()),
        }
    }
}

/// Long or short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short — the sign convention used throughout PnL
    /// math (spec.md §4.2, §4.3).
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            _ => Err(()),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    TakeProfit,
    StopLoss,
    DailyDrawdown,
    TrailingDrawdown,
    Admin,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Manual => "manual",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::DailyDrawdown => "daily_drawdown",
            CloseReason::TrailingDrawdown => "trailing_drawdown",
            CloseReason::Admin => "admin",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a challenge failed — the subset of [`CloseReason`]s that can also
/// terminate a challenge (spec.md §4.3 steps 3-4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedReason {
    DailyDrawdown,
    TrailingDrawdown,
}

impl FailedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailedReason::DailyDrawdown => "daily_drawdown",
            FailedReason::TrailingDrawdown => "trailing_drawdown",
        }
    }
}

impl fmt::Display for FailedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Withdrawal network for a [`crate::db::models::PayoutRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutNetwork {
    #[serde(rename = "TRC20")]
    Trc20,
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "BEP20")]
    Bep20,
}

impl fmt::Display for PayoutNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PayoutNetwork::Trc20 => "TRC20",
            PayoutNetwork::Erc20 => "ERC20",
            PayoutNetwork::Bep20 => "BEP20",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PayoutNetwork {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRC20" => Ok(PayoutNetwork::Trc20),
            "ERC20" => Ok(PayoutNetwork::Erc20),
            "BEP20" => Ok(PayoutNetwork::Bep20),
            _ => Err(()),
        }
    }
}

/// Payout approval state machine (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Approved,
    Rejected,
    Sent,
}

impl PayoutStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PayoutStatus::Rejected | PayoutStatus::Sent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Approved => "approved",
            PayoutStatus::Rejected => "rejected",
            PayoutStatus::Sent => "sent",
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PayoutStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PayoutStatus::Pending),
            "approved" => Ok(PayoutStatus::Approved),
            "rejected" => Ok(PayoutStatus::Rejected),
            "sent" => Ok(PayoutStatus::Sent),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn challenge_status_terminal() {
        assert!(ChallengeStatus::Failed.is_terminal());
        assert!(ChallengeStatus::Completed.is_terminal());
        assert!(!ChallengeStatus::Phase1.is_terminal());
        assert!(!ChallengeStatus::Funded.is_terminal());
    }

    #[test]
    fn challenge_status_active() {
        assert!(ChallengeStatus::Phase1.is_active());
        assert!(ChallengeStatus::Phase2.is_active());
        assert!(ChallengeStatus::Funded.is_active());
        assert!(!ChallengeStatus::Failed.is_active());
        assert!(!ChallengeStatus::Completed.is_active());
    }

    #[test]
    fn side_sign() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
    }

    #[test]
    fn role_roundtrip() {
        for r in [Role::Trader, Role::FundedTrader, Role::Admin, Role::SuperAdmin] {
            assert_eq!(Role::from_str(r.as_str()), Ok(r));
        }
    }

    #[test]
    fn payout_status_terminal() {
        assert!(PayoutStatus::Sent.is_terminal());
        assert!(PayoutStatus::Rejected.is_terminal());
        assert!(!PayoutStatus::Pending.is_terminal());
        assert!(!PayoutStatus::Approved.is_terminal());
    }

    #[test]
    fn payout_network_display_roundtrip() {
        for n in [PayoutNetwork::Trc20, PayoutNetwork::Erc20, PayoutNetwork::Bep20] {
            assert_eq!(PayoutNetwork::from_str(&n.to_string()), Ok(n));
        }
    }
}
