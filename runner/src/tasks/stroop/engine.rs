//! Trial/block/feedback state machine for one Stroop session.
//!
//! The engine is synchronous and owns no timers: every call to
//! [`StroopEngine::handle`] returns the effects the driver must carry out
//! (present a screen, schedule or cancel a timer, resolve feedback, hand over
//! the finished record). Timers are tracked in an armed table; a fired token
//! that is no longer armed is ignored, which makes late timers harmless.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::core::config::ExperimentConfig;
use crate::core::format::{format_ms, format_percent};
use crate::core::timing::{self, InstantStamp};
use crate::feedback::pattern::{select_message, FeedbackPattern};
use crate::feedback::scenario::BlockPerformance;
use crate::i18n::{self, fl};

use super::metrics::PerformanceStats;
use super::record::{BlockResult, Condition, Experiment, ExperimentDraft, SessionSetup, Trial};
use super::stimulus::{self, Stimulus};

/// Block number used for the unrecorded practice block.
pub const PRACTICE_BLOCK: u32 = 0;

const TICK_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    CountdownTick,
    InterTrial,
    ResponseTimeout,
    FeedbackTick,
    ContinueEnable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub run: u64,
    pub serial: u64,
    pub kind: TimerKind,
}

#[derive(Debug, Default)]
struct ArmedTimers {
    serial: u64,
    armed: HashMap<TimerKind, TimerToken>,
}

impl ArmedTimers {
    fn arm(&mut self, run: u64, kind: TimerKind, delay_ms: u64, effects: &mut Vec<Effect>) {
        self.disarm(kind, effects);
        self.serial += 1;
        let token = TimerToken {
            run,
            serial: self.serial,
            kind,
        };
        self.armed.insert(kind, token);
        effects.push(Effect::Schedule { token, delay_ms });
    }

    fn disarm(&mut self, kind: TimerKind, effects: &mut Vec<Effect>) {
        if let Some(token) = self.armed.remove(&kind) {
            effects.push(Effect::Cancel(token));
        }
    }

    fn disarm_all(&mut self, effects: &mut Vec<Effect>) {
        let mut tokens: Vec<TimerToken> = self.armed.drain().map(|(_, token)| token).collect();
        tokens.sort_by_key(|token| token.serial);
        effects.extend(tokens.into_iter().map(Effect::Cancel));
    }

    /// Consume `token` if it is the one currently armed for its kind.
    fn take(&mut self, token: TimerToken) -> bool {
        if self.armed.get(&token.kind) == Some(&token) {
            self.armed.remove(&token.kind);
            true
        } else {
            false
        }
    }

    fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

/// Per-trial latch: a stimulus accepts exactly one outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrialSlot {
    Awaiting { onset: InstantStamp },
    Recorded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunningBlock {
    pub block_number: u32,
    pub block_id: String,
    pub stimuli: Vec<Stimulus>,
    pub index: usize,
    pub slot: TrialSlot,
    pub trials: Vec<Trial>,
}

impl RunningBlock {
    fn current(&self) -> Option<&Stimulus> {
        self.stimuli.get(self.index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackState {
    pub block_number: u32,
    pub message: String,
    pub seconds_remaining: u32,
    pub continue_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    Preparation { error: Option<String> },
    ResolvingFeedback,
    Countdown { block_number: u32, remaining: u32 },
    Running(RunningBlock),
    Feedback(FeedbackState),
    Completed,
    Abandoned,
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Preparation { .. } => "preparation",
            Self::ResolvingFeedback => "resolving_feedback",
            Self::Countdown { .. } => "countdown",
            Self::Running(_) => "running",
            Self::Feedback(_) => "feedback",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

/// What the participant should be looking at.
#[derive(Debug, Clone, PartialEq)]
pub enum Screen {
    Preparation {
        error: Option<String>,
    },
    Loading,
    Countdown {
        block_number: u32,
        remaining: u32,
    },
    Stimulus {
        block_number: u32,
        sequence_number: usize,
        stimulus: Stimulus,
    },
    /// Fixation gap between trials.
    Blank,
    Feedback {
        block_number: u32,
        total_blocks: u32,
        message: String,
        seconds_remaining: u32,
        continue_enabled: bool,
    },
    Completed {
        experiment_id: String,
    },
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Start,
    FeedbackResolved(Result<FeedbackPattern, String>),
    Key { key: String, at: InstantStamp },
    Continue,
    TimerFired(TimerToken),
    Leave,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Present(Screen),
    Schedule { token: TimerToken, delay_ms: u64 },
    Cancel(TimerToken),
    ResolveFeedback { participant_id: String },
    Completed(Box<Experiment>),
}

pub struct StroopEngine {
    config: ExperimentConfig,
    setup: SessionSetup,
    state: EngineState,
    run: u64,
    timers: ArmedTimers,
    draft: Option<ExperimentDraft>,
    pattern: Option<FeedbackPattern>,
    rng: StdRng,
}

impl StroopEngine {
    pub fn new(config: ExperimentConfig, setup: SessionSetup) -> Self {
        Self::with_rng(config, setup, StdRng::from_entropy())
    }

    pub fn with_seed(config: ExperimentConfig, setup: SessionSetup, seed: u64) -> Self {
        Self::with_rng(config, setup, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ExperimentConfig, setup: SessionSetup, rng: StdRng) -> Self {
        Self {
            config,
            setup,
            state: EngineState::Preparation { error: None },
            run: 0,
            timers: ArmedTimers::default(),
            draft: None,
            pattern: None,
            rng,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn setup(&self) -> &SessionSetup {
        &self.setup
    }

    pub fn draft(&self) -> Option<&ExperimentDraft> {
        self.draft.as_ref()
    }

    pub fn has_armed_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Initial screen, before any event.
    pub fn screen(&self) -> Screen {
        match &self.state {
            EngineState::Preparation { error } => Screen::Preparation {
                error: error.clone(),
            },
            _ => Screen::Loading,
        }
    }

    pub fn handle(&mut self, event: EngineEvent, now: InstantStamp) -> Vec<Effect> {
        let mut effects = Vec::new();
        let before = self.state.name();

        match event {
            EngineEvent::Leave => self.leave(&mut effects),
            EngineEvent::TimerFired(token) => {
                if token.run == self.run && self.timers.take(token) {
                    self.on_timer(token.kind, now, &mut effects);
                } else {
                    tracing::debug!(?token, "ignoring stale timer");
                }
            }
            EngineEvent::Start => self.on_start(&mut effects),
            EngineEvent::FeedbackResolved(result) => self.on_resolved(result, &mut effects),
            EngineEvent::Key { key, at } => self.on_key(&key, at, &mut effects),
            EngineEvent::Continue => self.on_continue(&mut effects),
        }

        if before != self.state.name() {
            tracing::debug!(from = before, to = self.state.name(), "state transition");
        }
        effects
    }

    fn on_start(&mut self, effects: &mut Vec<Effect>) {
        if !matches!(self.state, EngineState::Preparation { .. }) {
            return;
        }
        match self.setup.condition {
            Condition::Static => self.begin(effects),
            Condition::Personalized => {
                self.state = EngineState::ResolvingFeedback;
                effects.push(Effect::Present(Screen::Loading));
                effects.push(Effect::ResolveFeedback {
                    participant_id: self.setup.participant_id.clone(),
                });
            }
        }
    }

    fn on_resolved(
        &mut self,
        result: Result<FeedbackPattern, String>,
        effects: &mut Vec<Effect>,
    ) {
        if self.state != EngineState::ResolvingFeedback {
            return;
        }
        match result {
            Ok(pattern) => {
                self.pattern = Some(pattern);
                self.begin(effects);
            }
            Err(error) => {
                tracing::warn!("cannot start personalized session: {error}");
                self.state = EngineState::Preparation {
                    error: Some(error.clone()),
                };
                effects.push(Effect::Present(Screen::Preparation { error: Some(error) }));
            }
        }
    }

    fn begin(&mut self, effects: &mut Vec<Effect>) {
        self.run += 1;
        let draft = ExperimentDraft::new(
            self.setup.clone(),
            timing::timestamp_now(),
            self.config.total_blocks,
            self.config.trials_per_block,
        );
        tracing::info!(
            experiment = %draft.id,
            participant = %self.setup.participant_id,
            condition = self.setup.condition.as_str(),
            planned_trials = self.config.planned_total_trials(),
            "experiment started"
        );
        self.draft = Some(draft);
        let first = if self.config.practice_trials > 0 {
            PRACTICE_BLOCK
        } else {
            1
        };
        self.enter_countdown(first, effects);
    }

    fn enter_countdown(&mut self, block_number: u32, effects: &mut Vec<Effect>) {
        let remaining = self.config.countdown_ticks;
        self.state = EngineState::Countdown {
            block_number,
            remaining,
        };
        effects.push(Effect::Present(Screen::Countdown {
            block_number,
            remaining,
        }));
        self.timers
            .arm(self.run, TimerKind::CountdownTick, TICK_MS, effects);
    }

    fn on_timer(&mut self, kind: TimerKind, now: InstantStamp, effects: &mut Vec<Effect>) {
        match (kind, &mut self.state) {
            (
                TimerKind::CountdownTick,
                EngineState::Countdown {
                    block_number,
                    remaining,
                },
            ) => {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    let block_number = *block_number;
                    self.start_block(block_number, now, effects);
                } else {
                    effects.push(Effect::Present(Screen::Countdown {
                        block_number: *block_number,
                        remaining: *remaining,
                    }));
                    self.timers
                        .arm(self.run, TimerKind::CountdownTick, TICK_MS, effects);
                }
            }
            (TimerKind::ResponseTimeout, EngineState::Running(_)) => {
                self.record_outcome(None, now, effects);
            }
            (TimerKind::InterTrial, EngineState::Running(block)) => {
                block.index += 1;
                if block.index < block.stimuli.len() {
                    self.present_trial(now, effects);
                } else {
                    self.finish_block(effects);
                }
            }
            (TimerKind::FeedbackTick, EngineState::Feedback(feedback)) => {
                feedback.seconds_remaining = feedback.seconds_remaining.saturating_sub(1);
                if feedback.seconds_remaining == 0 {
                    self.advance(effects);
                } else {
                    effects.push(self.feedback_screen());
                    self.timers
                        .arm(self.run, TimerKind::FeedbackTick, TICK_MS, effects);
                }
            }
            (TimerKind::ContinueEnable, EngineState::Feedback(feedback)) => {
                feedback.continue_enabled = true;
                effects.push(self.feedback_screen());
            }
            (kind, state) => {
                tracing::debug!(?kind, state = state.name(), "timer does not apply to state");
            }
        }
    }

    fn start_block(&mut self, block_number: u32, now: InstantStamp, effects: &mut Vec<Effect>) {
        let count = if block_number == PRACTICE_BLOCK {
            self.config.practice_trials
        } else {
            self.config.trials_per_block
        };
        let stimuli = stimulus::generate(count, self.setup.language, &mut self.rng);
        tracing::debug!(block = block_number, trials = stimuli.len(), "block started");
        self.state = EngineState::Running(RunningBlock {
            block_number,
            block_id: uuid::Uuid::new_v4().to_string(),
            stimuli,
            index: 0,
            slot: TrialSlot::Recorded,
            trials: Vec::new(),
        });
        self.present_trial(now, effects);
    }

    fn present_trial(&mut self, now: InstantStamp, effects: &mut Vec<Effect>) {
        let EngineState::Running(block) = &mut self.state else {
            return;
        };
        let Some(stimulus) = block.current().cloned() else {
            return;
        };
        block.slot = TrialSlot::Awaiting { onset: now };
        effects.push(Effect::Present(Screen::Stimulus {
            block_number: block.block_number,
            sequence_number: block.index + 1,
            stimulus,
        }));
        if let Some(limit) = self.config.time_limit_ms {
            self.timers
                .arm(self.run, TimerKind::ResponseTimeout, limit, effects);
        }
    }

    fn on_key(&mut self, key: &str, at: InstantStamp, effects: &mut Vec<Effect>) {
        match self.state {
            EngineState::Preparation { .. } => {
                if self.config.key_map.answer_for(key).is_some() {
                    self.on_start(effects);
                }
            }
            EngineState::Running(_) => {
                if let Some(answer) = self.config.key_map.answer_for(key) {
                    self.record_outcome(Some((key.to_string(), answer)), at, effects);
                }
            }
            EngineState::Feedback(_) => {
                if key == self.config.continue_key {
                    self.on_continue(effects);
                }
            }
            _ => {}
        }
    }

    /// Latch the current trial. `None` records a timeout.
    fn record_outcome(
        &mut self,
        response: Option<(String, stimulus::Answer)>,
        at: InstantStamp,
        effects: &mut Vec<Effect>,
    ) {
        let EngineState::Running(block) = &mut self.state else {
            return;
        };
        let TrialSlot::Awaiting { onset } = block.slot else {
            return;
        };
        let Some(stimulus) = block.stimuli.get(block.index).cloned() else {
            return;
        };

        let trial = match response {
            Some((key, answer)) => Trial {
                sequence_number: block.index + 1,
                block_id: block.block_id.clone(),
                is_correct: Some(answer == stimulus.correct_answer),
                stimulus,
                response_key: Some(key),
                chosen_answer: Some(answer),
                reaction_time_ms: Some(at.millis_since(onset)),
                timestamp: timing::timestamp_now(),
            },
            None => Trial {
                sequence_number: block.index + 1,
                block_id: block.block_id.clone(),
                stimulus,
                response_key: None,
                chosen_answer: None,
                is_correct: None,
                reaction_time_ms: self.config.time_limit_ms.map(|limit| limit as f64),
                timestamp: timing::timestamp_now(),
            },
        };
        block.trials.push(trial);
        block.slot = TrialSlot::Recorded;

        self.timers.disarm(TimerKind::ResponseTimeout, effects);
        effects.push(Effect::Present(Screen::Blank));
        self.timers.arm(
            self.run,
            TimerKind::InterTrial,
            self.config.inter_trial_delay_ms,
            effects,
        );
    }

    fn finish_block(&mut self, effects: &mut Vec<Effect>) {
        let placeholder = EngineState::Feedback(FeedbackState {
            block_number: 0,
            message: String::new(),
            seconds_remaining: 0,
            continue_enabled: false,
        });
        let EngineState::Running(block) = std::mem::replace(&mut self.state, placeholder) else {
            return;
        };
        let Some(draft) = self.draft.as_mut() else {
            return;
        };

        let stats = PerformanceStats::from_trials(&block.trials);
        let language = self.setup.language;
        let message = if block.block_number == PRACTICE_BLOCK {
            draft.practice_trials = block.trials;
            fl!(
                i18n::loader(language),
                "practice-summary",
                accuracy = format_percent(stats.accuracy)
            )
        } else {
            let current = BlockPerformance {
                accuracy: stats.accuracy,
                average_rt: stats.average_rt,
            };
            let previous = draft.last_block().map(|last| BlockPerformance {
                accuracy: last.accuracy,
                average_rt: last.average_rt_ms,
            });
            let message = match (self.setup.condition, &self.pattern) {
                (Condition::Personalized, Some(pattern)) => select_message(
                    &current,
                    previous.as_ref(),
                    pattern,
                    language,
                    &mut self.rng,
                ),
                _ => fl!(
                    i18n::loader(language),
                    "static-feedback",
                    block = block.block_number,
                    total = self.config.total_blocks,
                    accuracy = format_percent(stats.accuracy),
                    rt = format_ms(stats.average_rt)
                ),
            };

            tracing::info!(
                block = block.block_number,
                accuracy = stats.accuracy,
                average_rt = stats.average_rt,
                timeouts = stats.timeout_trials,
                "block completed"
            );
            draft.blocks.push(BlockResult {
                id: block.block_id,
                block_number: block.block_number,
                experiment_id: draft.id.clone(),
                trials: block.trials,
                accuracy: stats.accuracy,
                average_rt_ms: stats.average_rt,
                average_rt_correct_only_ms: stats.average_rt_correct_only,
                timeout_rate: stats.timeout_rate,
                completed_at: timing::timestamp_now(),
                feedback_shown: message.clone(),
            });
            message
        };

        self.state = EngineState::Feedback(FeedbackState {
            block_number: block.block_number,
            message,
            seconds_remaining: self.config.feedback_countdown_secs,
            continue_enabled: self.config.feedback_button_delay_ms == 0,
        });
        effects.push(self.feedback_screen());
        if self.config.feedback_countdown_secs > 0 {
            self.timers
                .arm(self.run, TimerKind::FeedbackTick, TICK_MS, effects);
        }
        if self.config.feedback_button_delay_ms > 0 {
            self.timers.arm(
                self.run,
                TimerKind::ContinueEnable,
                self.config.feedback_button_delay_ms,
                effects,
            );
        }
    }

    fn feedback_screen(&self) -> Effect {
        let EngineState::Feedback(feedback) = &self.state else {
            return Effect::Present(self.screen());
        };
        Effect::Present(Screen::Feedback {
            block_number: feedback.block_number,
            total_blocks: self.config.total_blocks,
            message: feedback.message.clone(),
            seconds_remaining: feedback.seconds_remaining,
            continue_enabled: feedback.continue_enabled,
        })
    }

    fn on_continue(&mut self, effects: &mut Vec<Effect>) {
        if let EngineState::Feedback(feedback) = &self.state {
            if feedback.continue_enabled {
                self.advance(effects);
            }
        }
    }

    /// Leave the feedback screen for the next block or completion.
    fn advance(&mut self, effects: &mut Vec<Effect>) {
        self.timers.disarm_all(effects);
        let Some(draft) = self.draft.as_ref() else {
            return;
        };
        if draft.blocks_remaining() == 0 {
            self.complete(effects);
        } else {
            let next = draft.next_block_number();
            self.enter_countdown(next, effects);
        }
    }

    fn complete(&mut self, effects: &mut Vec<Effect>) {
        let Some(draft) = self.draft.take() else {
            return;
        };
        let experiment = draft.finalize(timing::timestamp_now());
        tracing::info!(
            experiment = %experiment.id,
            accuracy = experiment.overall_accuracy,
            average_rt = experiment.overall_average_rt_ms,
            "experiment completed"
        );
        self.state = EngineState::Completed;
        effects.push(Effect::Present(Screen::Completed {
            experiment_id: experiment.id.clone(),
        }));
        effects.push(Effect::Completed(Box::new(experiment)));
    }

    fn leave(&mut self, effects: &mut Vec<Effect>) {
        if self.state.is_terminal() {
            return;
        }
        self.timers.disarm_all(effects);
        if let Some(draft) = self.draft.take() {
            tracing::info!(
                experiment = %draft.id,
                blocks = draft.blocks.len(),
                "session abandoned"
            );
        }
        self.state = EngineState::Abandoned;
        effects.push(Effect::Present(Screen::Abandoned));
    }
}
