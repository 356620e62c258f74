//! Metric definitions and aggregation helpers for Stroop blocks.

use serde::{Deserialize, Serialize};

use crate::core::format::round_to;

use super::record::Trial;

/// Trim values outside Tukey's fences `[Q1 - 1.5·IQR, Q3 + 1.5·IQR]`.
///
/// Quartiles use nearest-rank indexing on the sorted input
/// (`floor(n·0.25)` and `floor(n·0.75)`), no interpolation.
pub fn remove_outliers(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let q1 = sorted[(n as f64 * 0.25).floor() as usize];
    let q3 = sorted[((n as f64 * 0.75).floor() as usize).min(n - 1)];
    let iqr = q3 - q1;
    let lower = q1 - 1.5 * iqr;
    let upper = q3 + 1.5 * iqr;

    values
        .iter()
        .copied()
        .filter(|value| *value >= lower && *value <= upper)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    /// Percent correct among responded trials, two decimals.
    pub accuracy: f64,
    pub timeout_rate: f64,
    /// Trimmed mean over responded trials, whole milliseconds.
    #[serde(rename = "averageRT")]
    pub average_rt: f64,
    #[serde(rename = "averageRTCorrectOnly")]
    pub average_rt_correct_only: f64,
    pub total_trials: usize,
    pub correct_trials: usize,
    pub incorrect_trials: usize,
    pub timeout_trials: usize,
    pub responded_trials: usize,
}

impl PerformanceStats {
    pub fn from_trials(trials: &[Trial]) -> Self {
        let total_trials = trials.len();
        if total_trials == 0 {
            return Self::default();
        }

        let mut correct_trials = 0usize;
        let mut incorrect_trials = 0usize;
        let mut timeout_trials = 0usize;
        let mut responded_rts = Vec::new();
        let mut correct_rts = Vec::new();

        for trial in trials {
            match trial.is_correct {
                Some(true) => correct_trials += 1,
                Some(false) => incorrect_trials += 1,
                None => timeout_trials += 1,
            }

            if let Some(rt) = pooled_rt(trial) {
                responded_rts.push(rt);
                if trial.is_correct == Some(true) {
                    correct_rts.push(rt);
                }
            }
        }

        let responded_trials = correct_trials + incorrect_trials;
        let accuracy = if responded_trials > 0 {
            round_to(correct_trials as f64 / responded_trials as f64 * 100.0, 2)
        } else {
            0.0
        };
        let timeout_rate = round_to(timeout_trials as f64 / total_trials as f64 * 100.0, 2);

        Self {
            accuracy,
            timeout_rate,
            average_rt: trimmed_mean_ms(&responded_rts),
            average_rt_correct_only: trimmed_mean_ms(&correct_rts),
            total_trials,
            correct_trials,
            incorrect_trials,
            timeout_trials,
            responded_trials,
        }
    }
}

/// A trial only contributes a reaction time when it was answered with a key,
/// carries a positive finite RT and has a correctness verdict.
fn pooled_rt(trial: &Trial) -> Option<f64> {
    trial.response_key.as_ref()?;
    trial.is_correct?;
    trial
        .reaction_time_ms
        .filter(|rt| rt.is_finite() && *rt > 0.0)
}

/// Outlier-trimmed mean rounded half-up to whole milliseconds; 0 when empty.
pub fn trimmed_mean_ms(values: &[f64]) -> f64 {
    let kept = remove_outliers(values);
    if kept.is_empty() {
        return 0.0;
    }
    (kept.iter().sum::<f64>() / kept.len() as f64).round()
}
