//! Round-major model/key rotation with exponential backoff and
//! persistent-failure skipping (spec.md §4.C).
//!
//! Pull-based: the pipeline driver's own retry loop calls `next_attempt()`
//! and reports the outcome via `record_success`/`record_failure`. The same
//! type is reused for API-key rotation — construct it over a key pool
//! instead of model names.

use std::collections::HashMap;
use std::time::Duration;

const MAX_ATTEMPT_DELAY: Duration = Duration::from_secs(10);
const MAX_FIRST_TRY_DELAY: Duration = Duration::from_secs(1);

/// One rotation slot: which model, which round, which attempt within the
/// model for that round, and how long to wait before making the call.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationAttempt {
    pub model: String,
    pub round: u32,
    pub attempt: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Default)]
struct ModelStats {
    successes: u32,
    total: u32,
    consecutive_failures: u32,
    persistently_failed: bool,
}

/// Full record of one attempt, kept so exhaustion can surface the whole
/// log alongside the last error (spec.md §4.C "Termination").
#[derive(Debug, Clone)]
pub struct AttemptLogEntry {
    pub model: String,
    pub round: u32,
    pub attempt: u32,
    pub succeeded: bool,
}

pub struct ModelRotator {
    models: Vec<String>,
    rounds: u32,
    per_model_attempts: u32,
    base_delay: Duration,
    stats: HashMap<String, ModelStats>,
    log: Vec<AttemptLogEntry>,

    cursor_round: u32,
    cursor_model: usize,
    cursor_attempt: u32,
    attempts_emitted: u32,
}

impl ModelRotator {
    /// `rounds` defaults to 3, `per_model_attempts` to 3, `base_delay` to 1s
    /// per spec.md §4.C, but callers pass them explicitly here.
    pub fn new(
        models: Vec<String>,
        rounds: u32,
        per_model_attempts: u32,
        base_delay: Duration,
    ) -> Self {
        let stats = models
            .iter()
            .map(|m| (m.clone(), ModelStats::default()))
            .collect();
        Self {
            models,
            rounds,
            per_model_attempts,
            base_delay,
            stats,
            log: Vec::new(),
            cursor_round: 1,
            cursor_model: 0,
            cursor_attempt: 1,
            attempts_emitted: 0,
        }
    }

    fn max_total_attempts(&self) -> u32 {
        self.rounds * self.per_model_attempts * self.models.len() as u32
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            self.base_delay.min(MAX_FIRST_TRY_DELAY)
        } else {
            let factor = 1.5f64.powi(attempt as i32 - 1);
            let scaled = self.base_delay.mul_f64(factor);
            scaled.min(MAX_ATTEMPT_DELAY)
        }
    }

    /// Produce the next attempt slot, or `None` once the attempt cap
    /// (`rounds * per_model_attempts * |models|`) is exhausted.
    pub fn next_attempt(&mut self) -> Option<RotationAttempt> {
        if self.models.is_empty() {
            return None;
        }

        loop {
            if self.attempts_emitted >= self.max_total_attempts() || self.cursor_round > self.rounds {
                return None;
            }

            if self.cursor_model >= self.models.len() {
                self.cursor_model = 0;
                self.cursor_attempt = 1;
                self.cursor_round += 1;
                continue;
            }

            let model_idx = self.cursor_model;
            let model_name = self.models[model_idx].clone();
            let is_final_round = self.cursor_round == self.rounds;
            let persistently_failed = self
                .stats
                .get(&model_name)
                .map(|s| s.persistently_failed)
                .unwrap_or(false);

            if persistently_failed && !is_final_round {
                self.cursor_model += 1;
                self.cursor_attempt = 1;
                continue;
            }

            if self.cursor_attempt > self.per_model_attempts {
                self.cursor_model += 1;
                self.cursor_attempt = 1;
                continue;
            }

            let round = self.cursor_round;
            let attempt = self.cursor_attempt;
            let delay = self.delay_for(attempt);

            self.cursor_attempt += 1;
            self.attempts_emitted += 1;

            return Some(RotationAttempt {
                model: model_name,
                round,
                attempt,
                delay,
            });
        }
    }

    pub fn record_success(&mut self, attempt: &RotationAttempt) {
        let stats = self.stats.entry(attempt.model.clone()).or_default();
        stats.successes += 1;
        stats.total += 1;
        stats.consecutive_failures = 0;
        stats.persistently_failed = false;

        self.log.push(AttemptLogEntry {
            model: attempt.model.clone(),
            round: attempt.round,
            attempt: attempt.attempt,
            succeeded: true,
        });
    }

    /// Two consecutive failures on a model mark it persistently failed for
    /// the rest of this rotator's lifetime (spec.md §4.C).
    pub fn record_failure(&mut self, attempt: &RotationAttempt) {
        let stats = self.stats.entry(attempt.model.clone()).or_default();
        stats.total += 1;
        stats.consecutive_failures += 1;
        if stats.consecutive_failures >= 2 {
            stats.persistently_failed = true;
        }

        self.log.push(AttemptLogEntry {
            model: attempt.model.clone(),
            round: attempt.round,
            attempt: attempt.attempt,
            succeeded: false,
        });
    }

    /// The model with the highest observed success ratio. Ties break by
    /// list order. `None` if no attempts were ever recorded.
    pub fn best_model(&self) -> Option<String> {
        self.models
            .iter()
            .filter_map(|m| {
                let stats = self.stats.get(m)?;
                if stats.total == 0 {
                    return None;
                }
                Some((m.clone(), stats.successes as f64 / stats.total as f64))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .map(|(m, _)| m)
    }

    pub fn attempt_log(&self) -> &[AttemptLogEntry] {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotator() -> ModelRotator {
        ModelRotator::new(
            vec!["gpt-a".to_string(), "gpt-b".to_string()],
            2,
            2,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn sequence_is_round_major_then_model_then_attempt() {
        let mut r = rotator();
        let mut seen = Vec::new();
        while let Some(a) = r.next_attempt() {
            seen.push((a.model.clone(), a.round, a.attempt));
        }
        assert_eq!(
            seen,
            vec![
                ("gpt-a".to_string(), 1, 1),
                ("gpt-a".to_string(), 1, 2),
                ("gpt-b".to_string(), 1, 1),
                ("gpt-b".to_string(), 1, 2),
                ("gpt-a".to_string(), 2, 1),
                ("gpt-a".to_string(), 2, 2),
                ("gpt-b".to_string(), 2, 1),
                ("gpt-b".to_string(), 2, 2),
            ]
        );
    }

    #[test]
    fn total_attempts_never_exceed_the_cap() {
        let mut r = rotator();
        let mut count = 0;
        while r.next_attempt().is_some() {
            count += 1;
        }
        assert_eq!(count, 2 * 2 * 2);
    }

    #[test]
    fn first_attempt_delay_is_capped_at_one_second() {
        let mut r = ModelRotator::new(vec!["m".to_string()], 1, 1, Duration::from_secs(5));
        let a = r.next_attempt().unwrap();
        assert_eq!(a.delay, Duration::from_secs(1));
    }

    #[test]
    fn later_attempt_delay_grows_exponentially_and_caps_at_ten_seconds() {
        let mut r = ModelRotator::new(vec!["m".to_string()], 1, 5, Duration::from_secs(1));
        let attempts: Vec<_> = std::iter::from_fn(|| r.next_attempt()).collect();
        assert_eq!(attempts[1].delay, Duration::from_millis(1500));
        assert_eq!(attempts[4].delay, Duration::from_secs(1).mul_f64(1.5f64.powi(3)).min(Duration::from_secs(10)));
    }

    #[test]
    fn two_consecutive_failures_mark_model_persistently_failed_and_skip_mid_rounds() {
        let mut r = rotator();
        let first = r.next_attempt().unwrap();
        r.record_failure(&first);
        let second = r.next_attempt().unwrap();
        r.record_failure(&second);

        // gpt-a is now persistently failed; round 1 should move straight to gpt-b.
        let third = r.next_attempt().unwrap();
        assert_eq!(third.model, "gpt-b");
    }

    #[test]
    fn persistently_failed_model_still_runs_on_the_final_round() {
        let mut r = rotator();
        for _ in 0..2 {
            let a = r.next_attempt().unwrap();
            r.record_failure(&a);
        }
        // drain rest of round 1 for gpt-b
        for _ in 0..2 {
            r.next_attempt().unwrap();
        }
        // round 2 is the final round — gpt-a must reappear despite being persistently failed.
        let next = r.next_attempt().unwrap();
        assert_eq!(next.model, "gpt-a");
        assert_eq!(next.round, 2);
    }

    #[test]
    fn success_clears_persistent_failure_flag() {
        let mut r = rotator();
        let a1 = r.next_attempt().unwrap();
        r.record_failure(&a1);
        let a2 = r.next_attempt().unwrap();
        r.record_success(&a2);

        let a3 = r.next_attempt().unwrap();
        // gpt-a is not persistently failed anymore, so it still appears before gpt-b in round 1.
        assert_eq!(a3.model, "gpt-a");
    }

    #[test]
    fn best_model_picks_highest_success_ratio_breaking_ties_by_list_order() {
        let mut r = rotator();
        let a1 = RotationAttempt { model: "gpt-a".to_string(), round: 1, attempt: 1, delay: Duration::ZERO };
        let b1 = RotationAttempt { model: "gpt-b".to_string(), round: 1, attempt: 1, delay: Duration::ZERO };
        r.record_success(&a1);
        r.record_success(&b1);
        assert_eq!(r.best_model(), Some("gpt-a".to_string()));
    }

    #[test]
    fn best_model_is_none_with_no_recorded_attempts() {
        let r = rotator();
        assert_eq!(r.best_model(), None);
    }
}
