//! Trial, block and experiment records as they are stored and synced.

use serde::{Deserialize, Serialize};

use crate::core::format::round_to;
use crate::i18n::Language;

use super::metrics::PerformanceStats;
use super::stimulus::{Answer, Stimulus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Static,
    Personalized,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Personalized => "personalized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SessionNumber {
    First,
    Second,
}

impl TryFrom<u8> for SessionNumber {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::First),
            2 => Ok(Self::Second),
            other => Err(format!("session number must be 1 or 2, got {other}")),
        }
    }
}

impl From<SessionNumber> for u8 {
    fn from(value: SessionNumber) -> Self {
        match value {
            SessionNumber::First => 1,
            SessionNumber::Second => 2,
        }
    }
}

/// One presented stimulus and its outcome. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trial {
    pub sequence_number: usize,
    pub block_id: String,
    pub stimulus: Stimulus,
    pub response_key: Option<String>,
    pub chosen_answer: Option<Answer>,
    /// `None` marks a timeout.
    pub is_correct: Option<bool>,
    pub reaction_time_ms: Option<f64>,
    pub timestamp: String,
}

impl Trial {
    pub fn is_timeout(&self) -> bool {
        self.is_correct.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResult {
    pub id: String,
    pub block_number: u32,
    pub experiment_id: String,
    pub trials: Vec<Trial>,
    pub accuracy: f64,
    #[serde(rename = "averageRTMs")]
    pub average_rt_ms: f64,
    #[serde(rename = "averageRTCorrectOnlyMs")]
    pub average_rt_correct_only_ms: f64,
    pub timeout_rate: f64,
    pub completed_at: String,
    pub feedback_shown: String,
}

impl BlockResult {
    pub fn stats(&self) -> PerformanceStats {
        PerformanceStats::from_trials(&self.trials)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub participant_id: String,
    pub condition_type: Condition,
    pub session_number: SessionNumber,
    pub language: Language,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub blocks: Vec<BlockResult>,
    pub overall_accuracy: f64,
    #[serde(rename = "overallAverageRTMs")]
    pub overall_average_rt_ms: f64,
    #[serde(rename = "overallAverageRTCorrectOnlyMs")]
    pub overall_average_rt_correct_only_ms: f64,
    pub planned_total_blocks: u32,
    pub planned_total_trials: usize,
    pub planned_trials_per_block: usize,
    pub total_trials_attempted: usize,
    #[serde(default)]
    pub practice_trials: Vec<Trial>,
}

impl Experiment {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some() && self.blocks.len() == self.planned_total_blocks as usize
    }
}

/// Who is running which session; fixed for the lifetime of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub participant_id: String,
    pub condition: Condition,
    pub session_number: SessionNumber,
    pub language: Language,
}

/// An experiment that has started but not finished. Finalizing consumes it,
/// so a run can produce its record at most once.
#[derive(Debug, Clone)]
pub struct ExperimentDraft {
    pub id: String,
    pub setup: SessionSetup,
    pub started_at: String,
    pub blocks: Vec<BlockResult>,
    pub practice_trials: Vec<Trial>,
    planned_total_blocks: u32,
    planned_trials_per_block: usize,
}

impl ExperimentDraft {
    pub fn new(
        setup: SessionSetup,
        started_at: String,
        planned_total_blocks: u32,
        planned_trials_per_block: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            setup,
            started_at,
            blocks: Vec::new(),
            practice_trials: Vec::new(),
            planned_total_blocks,
            planned_trials_per_block,
        }
    }

    pub fn next_block_number(&self) -> u32 {
        self.blocks.len() as u32 + 1
    }

    pub fn blocks_remaining(&self) -> u32 {
        self.planned_total_blocks
            .saturating_sub(self.blocks.len() as u32)
    }

    pub fn last_block(&self) -> Option<&BlockResult> {
        self.blocks.last()
    }

    pub fn finalize(self, completed_at: String) -> Experiment {
        let blocks = self.blocks;
        let overall_accuracy = round_to(mean(blocks.iter().map(|b| b.accuracy)), 2);
        let overall_average_rt_ms = mean(blocks.iter().map(|b| b.average_rt_ms)).round();
        let overall_average_rt_correct_only_ms =
            mean(blocks.iter().map(|b| b.average_rt_correct_only_ms)).round();
        let total_trials_attempted = blocks.iter().map(|b| b.trials.len()).sum();
        let complete = blocks.len() == self.planned_total_blocks as usize;

        Experiment {
            id: self.id,
            participant_id: self.setup.participant_id,
            condition_type: self.setup.condition,
            session_number: self.setup.session_number,
            language: self.setup.language,
            started_at: self.started_at,
            completed_at: complete.then_some(completed_at),
            blocks,
            overall_accuracy,
            overall_average_rt_ms,
            overall_average_rt_correct_only_ms,
            planned_total_blocks: self.planned_total_blocks,
            planned_total_trials: self.planned_total_blocks as usize
                * self.planned_trials_per_block,
            planned_trials_per_block: self.planned_trials_per_block,
            total_trials_attempted,
            practice_trials: self.practice_trials,
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> SessionSetup {
        SessionSetup {
            participant_id: "p-01".into(),
            condition: Condition::Static,
            session_number: SessionNumber::First,
            language: Language::En,
        }
    }

    fn block(number: u32, accuracy: f64, rt: f64) -> BlockResult {
        BlockResult {
            id: format!("b{number}"),
            block_number: number,
            experiment_id: "e".into(),
            trials: Vec::new(),
            accuracy,
            average_rt_ms: rt,
            average_rt_correct_only_ms: rt - 10.0,
            timeout_rate: 0.0,
            completed_at: "2026-01-01T00:00:00Z".into(),
            feedback_shown: String::new(),
        }
    }

    #[test]
    fn finalize_averages_block_values() {
        let mut draft = ExperimentDraft::new(setup(), "start".into(), 2, 60);
        draft.blocks.push(block(1, 90.0, 600.0));
        draft.blocks.push(block(2, 95.5, 651.0));
        let experiment = draft.finalize("end".into());

        assert!(experiment.is_complete());
        assert_eq!(experiment.overall_accuracy, 92.75);
        assert_eq!(experiment.overall_average_rt_ms, 626.0);
        assert_eq!(experiment.overall_average_rt_correct_only_ms, 616.0);
        assert_eq!(experiment.planned_total_trials, 120);
    }

    #[test]
    fn short_draft_never_gets_completed_at() {
        let mut draft = ExperimentDraft::new(setup(), "start".into(), 3, 60);
        draft.blocks.push(block(1, 90.0, 600.0));
        let experiment = draft.finalize("end".into());
        assert_eq!(experiment.completed_at, None);
        assert!(!experiment.is_complete());
    }

    #[test]
    fn session_number_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&SessionNumber::Second).unwrap(), "2");
        assert!(serde_json::from_str::<SessionNumber>("3").is_err());
    }
}
