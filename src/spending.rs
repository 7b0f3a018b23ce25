//! Per-transaction, daily, and hourly spending accounting.
//!
//! The tracker is the in-memory ledger behind the policy engine. `check`
//! never mutates spend counters (it does prune the sliding window); `record`
//! runs only after a bundler submission returned a transaction hash. Both
//! take `now` so tests control the clock.

use std::collections::VecDeque;

use crate::config::SecurityProfile;
use crate::intent::{format_eth, format_stable};

const SECS_PER_DAY: u64 = 86_400;
const SECS_PER_HOUR: u64 = 3_600;

/// Why a spend was refused. The order of variants mirrors the order checks
/// run in; messages surface verbatim in approval summaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendDenied {
    PerTxEth { amount: u64, cap: u64 },
    PerTxStable { amount: u64, cap: u64 },
    DailyEth { cap: u64 },
    DailyStable { cap: u64 },
    HourlyRate { limit: u32 },
    Cooldown { remaining: u64 },
}

impl std::fmt::Display for SpendDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerTxEth { amount, cap } => write!(
                f,
                "amount {} ETH exceeds per-transaction cap {} ETH",
                format_eth(*amount),
                format_eth(*cap)
            ),
            Self::PerTxStable { amount, cap } => write!(
                f,
                "amount {} USDC exceeds per-transaction cap {} USDC",
                format_stable(*amount),
                format_stable(*cap)
            ),
            Self::DailyEth { cap } => write!(f, "daily ETH cap {} reached", format_eth(*cap)),
            Self::DailyStable { cap } => {
                write!(f, "daily stablecoin cap {} reached", format_stable(*cap))
            }
            Self::HourlyRate { limit } => write!(f, "hourly transaction limit {limit} reached"),
            Self::Cooldown { remaining } => {
                write!(f, "cooldown: {remaining}s until next transaction")
            }
        }
    }
}

impl std::error::Error for SpendDenied {}

/// Remaining headroom, saturating at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RemainingBudgets {
    pub daily_eth: u64,
    pub daily_stable: u64,
    pub tx_this_hour: u32,
}

#[derive(Debug)]
pub struct SpendingTracker {
    daily_eth_spent: u64,
    daily_stable_spent: u64,
    current_day: u64,
    recent: VecDeque<u64>,
    last_tx_at: Option<u64>,
}

impl SpendingTracker {
    pub fn new(now: u64) -> Self {
        Self {
            daily_eth_spent: 0,
            daily_stable_spent: 0,
            current_day: now / SECS_PER_DAY,
            recent: VecDeque::new(),
            last_tx_at: None,
        }
    }

    /// Rolls the day counters and prunes the hourly window.
    fn refresh(&mut self, now: u64) {
        let day = now / SECS_PER_DAY;
        if day != self.current_day {
            self.current_day = day;
            self.daily_eth_spent = 0;
            self.daily_stable_spent = 0;
        }
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_sub(oldest) >= SECS_PER_HOUR {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Would this spend fit? Checks run in a fixed order: per-tx ETH, per-tx
    /// stable, daily ETH, daily stable, hourly rate, cooldown.
    pub fn check(
        &mut self,
        eth: u64,
        stable: u64,
        profile: &SecurityProfile,
        now: u64,
    ) -> Result<(), SpendDenied> {
        self.refresh(now);

        if eth > profile.per_tx_eth_cap {
            return Err(SpendDenied::PerTxEth { amount: eth, cap: profile.per_tx_eth_cap });
        }
        if stable > profile.per_tx_stable_cap {
            return Err(SpendDenied::PerTxStable { amount: stable, cap: profile.per_tx_stable_cap });
        }
        if self.daily_eth_spent.saturating_add(eth) > profile.daily_eth_cap {
            return Err(SpendDenied::DailyEth { cap: profile.daily_eth_cap });
        }
        if self.daily_stable_spent.saturating_add(stable) > profile.daily_stable_cap {
            return Err(SpendDenied::DailyStable { cap: profile.daily_stable_cap });
        }
        if self.recent.len() >= profile.max_tx_per_hour as usize {
            return Err(SpendDenied::HourlyRate { limit: profile.max_tx_per_hour });
        }
        if let Some(last) = self.last_tx_at {
            let elapsed = now.saturating_sub(last);
            if elapsed < profile.min_cooldown_secs {
                return Err(SpendDenied::Cooldown {
                    remaining: profile.min_cooldown_secs - elapsed,
                });
            }
        }
        Ok(())
    }

    /// Books a spend that went on-chain.
    pub fn record(&mut self, eth: u64, stable: u64, now: u64) {
        self.refresh(now);
        self.daily_eth_spent = self.daily_eth_spent.saturating_add(eth);
        self.daily_stable_spent = self.daily_stable_spent.saturating_add(stable);
        self.recent.push_back(now);
        self.last_tx_at = Some(now);
    }

    pub fn remaining_budgets(&mut self, profile: &SecurityProfile, now: u64) -> RemainingBudgets {
        self.refresh(now);
        RemainingBudgets {
            daily_eth: profile.daily_eth_cap.saturating_sub(self.daily_eth_spent),
            daily_stable: profile.daily_stable_cap.saturating_sub(self.daily_stable_spent),
            tx_this_hour: (profile.max_tx_per_hour as usize)
                .saturating_sub(self.recent.len()) as u32,
        }
    }

    pub fn daily_eth_spent(&self) -> u64 {
        self.daily_eth_spent
    }

    pub fn daily_stable_spent(&self) -> u64 {
        self.daily_stable_spent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityProfile;

    const NOW: u64 = 1_750_000_000;

    fn balanced() -> SecurityProfile {
        SecurityProfile::balanced()
    }

    #[test]
    fn per_tx_eth_cap_comes_first() {
        let mut t = SpendingTracker::new(NOW);
        let err = t
            .check(60_000_000_000_000_000, u64::MAX, &balanced(), NOW)
            .unwrap_err();
        assert!(matches!(err, SpendDenied::PerTxEth { .. }));
        assert!(err.to_string().contains("0.0600"));
    }

    #[test]
    fn per_tx_stable_cap() {
        let mut t = SpendingTracker::new(NOW);
        let err = t.check(0, 100_000_001, &balanced(), NOW).unwrap_err();
        assert!(matches!(err, SpendDenied::PerTxStable { .. }));
    }

    #[test]
    fn daily_caps_accumulate() {
        let mut t = SpendingTracker::new(NOW);
        let p = balanced();
        // Four maxed per-tx spends hit the 0.25 daily cap before a fifth.
        for i in 0..5u64 {
            let at = NOW + i * 10;
            t.record(50_000_000_000_000_000, 0, at);
        }
        let err = t.check(1, 0, &p, NOW + 60).unwrap_err();
        assert!(matches!(err, SpendDenied::DailyEth { .. }));
    }

    #[test]
    fn day_rollover_resets_both_counters() {
        let mut t = SpendingTracker::new(NOW);
        let p = balanced();
        t.record(p.daily_eth_cap, p.daily_stable_cap, NOW);
        assert!(t.check(1, 0, &p, NOW + 10).is_err());

        let next_day = (NOW / 86_400 + 1) * 86_400 + 1;
        let remaining = t.remaining_budgets(&p, next_day);
        assert_eq!(remaining.daily_eth, p.daily_eth_cap);
        assert_eq!(remaining.daily_stable, p.daily_stable_cap);
    }

    #[test]
    fn hourly_window_slides() {
        let mut t = SpendingTracker::new(NOW);
        let p = balanced();
        for i in 0..p.max_tx_per_hour as u64 {
            t.record(0, 0, NOW + i);
        }
        let err = t.check(0, 0, &p, NOW + 100).unwrap_err();
        assert!(matches!(err, SpendDenied::HourlyRate { .. }));

        // An hour after the first record, one slot frees up.
        assert!(t.check(0, 0, &p, NOW + 3_601).is_ok());
    }

    #[test]
    fn cooldown_is_checked_last() {
        let mut t = SpendingTracker::new(NOW);
        let p = balanced();
        t.record(0, 0, NOW);
        let err = t.check(0, 0, &p, NOW + 1).unwrap_err();
        assert!(matches!(err, SpendDenied::Cooldown { remaining: 4 }));
        assert!(t.check(0, 0, &p, NOW + 5).is_ok());
    }

    #[test]
    fn remaining_budgets_saturate() {
        let mut t = SpendingTracker::new(NOW);
        let mut p = balanced();
        t.record(p.daily_eth_cap, 0, NOW);
        // Tighten the cap below what is already spent.
        p.daily_eth_cap = 1;
        let remaining = t.remaining_budgets(&p, NOW + 1);
        assert_eq!(remaining.daily_eth, 0);
    }
}
