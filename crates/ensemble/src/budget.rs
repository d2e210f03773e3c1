//! Daily SSH connection budget with polling jitter.
//!
//! A JSON counter file `{date, count}` caps outbound SSH connections per
//! local calendar day; the counter resets when the date rolls over.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Local;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CounterState {
    date: String,
    count: u32,
}

pub struct SshBudget {
    counter_path: PathBuf,
    max_daily: u32,
    jitter_range_secs: i64,
    // Serialises the read-modify-write of the counter file in this process.
    guard: Mutex<()>,
}

impl SshBudget {
    pub fn new(counter_path: impl Into<PathBuf>, max_daily: u32, jitter_range_secs: i64) -> Self {
        Self {
            counter_path: counter_path.into(),
            max_daily,
            jitter_range_secs,
            guard: Mutex::new(()),
        }
    }

    /// Whether another SSH connection is allowed today.
    pub fn check_daily_limit(&self) -> bool {
        let _lock = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let state = self.load_today();
        if state.count >= self.max_daily {
            warn!(count = state.count, max = self.max_daily, "ssh daily limit reached");
            return false;
        }
        true
    }

    /// Record one connection.
    pub fn increment(&self) {
        let _lock = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let mut state = self.load_today();
        state.count += 1;
        info!(count = state.count, max = self.max_daily, "ssh connections today");
        if let Err(err) = self.save(&state) {
            warn!(%err, "failed to save ssh counter");
        }
    }

    /// Uniform jitter of ±`jitter_range_secs` applied to a polling interval,
    /// floored at zero.
    pub fn apply_jitter(&self, interval_secs: u64) -> u64 {
        if self.jitter_range_secs <= 0 {
            return interval_secs;
        }
        let jitter = rand::rng().random_range(-self.jitter_range_secs..=self.jitter_range_secs);
        (interval_secs as i64 + jitter).max(0) as u64
    }

    fn load_today(&self) -> CounterState {
        let today = Local::now().date_naive().to_string();
        let loaded: Option<CounterState> = fs::read_to_string(&self.counter_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        match loaded {
            Some(state) if state.date == today => state,
            _ => CounterState { date: today, count: 0 },
        }
    }

    fn save(&self, state: &CounterState) -> Result<()> {
        if let Some(parent) = self.counter_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.counter_path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_enforced_after_increments() {
        let dir = tempfile::tempdir().unwrap();
        let budget = SshBudget::new(dir.path().join("ssh_counter.json"), 2, 0);

        assert!(budget.check_daily_limit());
        budget.increment();
        assert!(budget.check_daily_limit());
        budget.increment();
        assert!(!budget.check_daily_limit());
    }

    #[test]
    fn stale_date_resets_the_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh_counter.json");
        fs::write(&path, r#"{"date":"1999-12-31","count":99}"#).unwrap();

        let budget = SshBudget::new(&path, 5, 0);
        assert!(budget.check_daily_limit());
    }

    #[test]
    fn jitter_stays_within_range() {
        let dir = tempfile::tempdir().unwrap();
        let budget = SshBudget::new(dir.path().join("c.json"), 5, 60);
        for _ in 0..50 {
            let jittered = budget.apply_jitter(3600);
            assert!((3540..=3660).contains(&jittered));
        }
        let no_jitter = SshBudget::new(dir.path().join("c.json"), 5, 0);
        assert_eq!(no_jitter.apply_jitter(3600), 3600);
    }
}
