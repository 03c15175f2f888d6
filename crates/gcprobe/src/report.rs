//! Run report.
//!
//! A diagnostic record of every completed round and how the run ended. It is
//! the only thing that survives a round besides the run's outcome.

use gcprobe_types::Timestamp;
use serde::Serialize;

use crate::Error;

/// Why a run ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The cancellation token fired.
    Cancelled,
    /// The configured number of rounds completed.
    RoundLimit,
    /// The timestamp oracle stayed unreachable.
    OracleDown,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Running,
    Stopped {
        reason: StopReason,
    },
    Failed {
        error: String,
        /// True when the store under test misbehaved, false when the harness
        /// or its environment did.
        correctness_violation: bool,
    },
}

/// One completed round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundReport {
    pub round: u64,
    /// Timestamp taken at the start of the round; the safe-lock boundary.
    pub start_ts: Timestamp,
    pub safe_point: Timestamp,
    pub main_locked: usize,
    pub race_locked: usize,
    pub physical_used: bool,
    pub safe_locks_resolved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub rounds_completed: u64,
    pub outcome: Outcome,
    pub rounds: Vec<RoundReport>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            rounds_completed: 0,
            outcome: Outcome::Running,
            rounds: Vec::new(),
        }
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, round: RoundReport) {
        self.rounds_completed += 1;
        self.rounds.push(round);
    }

    /// Stores the run's final result as the outcome.
    pub fn finish(&mut self, result: &Result<StopReason, Error>) {
        self.outcome = match result {
            Ok(reason) => Outcome::Stopped { reason: *reason },
            Err(err) => Outcome::Failed {
                error: err.to_string(),
                correctness_violation: err.is_correctness_violation(),
            },
        };
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn round(n: u64) -> RoundReport {
        RoundReport {
            round: n,
            start_ts: Timestamp::new(10 + n),
            safe_point: Timestamp::new(20 + n),
            main_locked: 15,
            race_locked: 3,
            physical_used: true,
            safe_locks_resolved: 3,
        }
    }

    #[test]
    fn test_record_counts_rounds() {
        let mut report = RunReport::new();
        report.record(round(0));
        report.record(round(1));
        assert_eq!(report.rounds_completed, 2);
        assert_eq!(report.outcome, Outcome::Running);
    }

    #[test]
    fn test_finish_stopped() {
        let mut report = RunReport::new();
        report.finish(&Ok(StopReason::RoundLimit));

        let json: serde_json::Value =
            serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["outcome"]["status"], "stopped");
        assert_eq!(json["outcome"]["reason"], "round_limit");
        assert_eq!(json["rounds_completed"], 0);
    }

    #[test]
    fn test_finish_failed() {
        let mut report = RunReport::new();
        report.record(round(0));
        report.finish(&Err(Error::GreenGcNotUsed { rounds: 50 }));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["correctness_violation"], true);
        assert_eq!(
            json["outcome"]["error"],
            "green gc failed to run for over 50 rounds"
        );
        assert_eq!(json["rounds"][0]["safe_point"], 20);
    }

    #[test_case(StopReason::Cancelled, "cancelled")]
    #[test_case(StopReason::RoundLimit, "round_limit")]
    #[test_case(StopReason::OracleDown, "oracle_down")]
    fn test_stop_reason_names(reason: StopReason, name: &str) {
        let mut report = RunReport::new();
        report.finish(&Ok(reason));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"]["reason"], name);
    }
}
