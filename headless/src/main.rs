//! stroop-headless - run the Stroop session core without a UI
//!
//! Usage:
//!   stroop-headless run --participant p-01             # static condition, scripted participant
//!   stroop-headless run --condition personalized \
//!       --participants profiles.json --participant p-01
//!   stroop-headless sync                               # flush cached records, retry uploads
//!   stroop-headless list                               # stored experiments and sync status

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures_channel::mpsc;
use futures_util::StreamExt;
use rand::seq::SliceRandom;
use rand::Rng;

use runner::core::config::ExperimentConfig;
use runner::core::logging::init_tracing;
use runner::core::notify::{CompletionNotifier, HttpCompletionNotifier};
use runner::core::participant::{ParticipantInfo, StaticDirectory};
use runner::core::storage::{ExperimentRepository, FileStore, KeyValueStore, Persistence};
use runner::core::sync::{HttpRemoteStore, RemoteStore, SyncService};
use runner::feedback::generator::{BlockData, FeedbackGenerator, HttpFeedbackGenerator};
use runner::feedback::resolver::{FeedbackResolver, PatternCache};
use runner::i18n::Language;
use runner::tasks::stroop::engine::Screen;
use runner::tasks::stroop::record::{Condition, SessionNumber, SessionSetup};
use runner::tasks::stroop::session::{spawn_session, SessionHandle, SessionServices, SessionUpdate};
use runner::tasks::stroop::stimulus::Answer;

#[derive(Parser)]
#[command(name = "stroop-headless")]
#[command(about = "Drive Stroop feedback sessions with a scripted participant")]
#[command(version)]
struct Cli {
    /// Store directory (default: platform data directory)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one full session
    Run(RunArgs),

    /// Move cached records into the store and retry pending uploads
    Sync,

    /// List stored experiments
    List,
}

#[derive(Parser)]
struct RunArgs {
    /// Participant id
    #[arg(long, default_value = "demo")]
    participant: String,

    /// JSON array of participant profiles
    #[arg(long)]
    participants: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "static")]
    condition: ConditionArg,

    /// Session number (1 or 2)
    #[arg(long, default_value_t = 1)]
    session: u8,

    #[arg(long, value_enum, default_value = "ja")]
    language: LanguageArg,

    /// Experiment configuration JSON (STROOP_* variables override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shorten every wait so a session finishes in seconds
    #[arg(long)]
    fast: bool,

    /// Probability of answering correctly
    #[arg(long, default_value_t = 0.92)]
    accuracy: f64,

    /// Mean response time in milliseconds
    #[arg(long, default_value_t = 620)]
    rt_ms: u64,

    /// Uniform response time jitter (+/-) in milliseconds
    #[arg(long, default_value_t = 150)]
    jitter_ms: u64,

    /// Probability of not answering at all
    #[arg(long, default_value_t = 0.02)]
    miss_rate: f64,
}

#[derive(Clone, Copy, ValueEnum)]
enum ConditionArg {
    Static,
    Personalized,
}

#[derive(Clone, Copy, ValueEnum)]
enum LanguageArg {
    Ja,
    En,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let stores = Stores::open(cli.store.as_ref())?;

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            match cli.command {
                Commands::Run(args) => run(args, stores).await,
                Commands::Sync => sync(stores).await,
                Commands::List => list(stores),
            }
        })
        .await
}

/// Durable record store plus the cache that takes records it refuses.
struct Stores {
    primary: Rc<dyn KeyValueStore>,
    fallback: Rc<dyn KeyValueStore>,
}

impl Stores {
    fn open(dir: Option<&PathBuf>) -> Result<Self> {
        let primary = match dir {
            Some(dir) => FileStore::at(dir),
            None => FileStore::open_default().context("Failed to open the local store")?,
        };
        let fallback = FileStore::at(primary.root().join("fallback"));
        Ok(Self {
            primary: Rc::new(primary),
            fallback: Rc::new(fallback),
        })
    }

    fn persistence(&self) -> Persistence {
        Persistence::new(
            ExperimentRepository::new(self.primary.clone()),
            self.fallback.clone(),
        )
    }
}

async fn run(args: RunArgs, stores: Stores) -> Result<()> {
    let language = match args.language {
        LanguageArg::Ja => Language::Ja,
        LanguageArg::En => Language::En,
    };
    let condition = match args.condition {
        ConditionArg::Static => Condition::Static,
        ConditionArg::Personalized => Condition::Personalized,
    };
    let session_number = SessionNumber::try_from(args.session).map_err(anyhow::Error::msg)?;
    if !(0.0..=1.0).contains(&args.accuracy) || !(0.0..=1.0).contains(&args.miss_rate) {
        bail!("--accuracy and --miss-rate must be between 0 and 1");
    }

    let config = load_config(args.config.as_ref(), args.fast)?;
    let directory = match &args.participants {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            StaticDirectory::from_json_str(&raw).context("Invalid participant profiles")?
        }
        None => StaticDirectory::new([ParticipantInfo {
            id: args.participant.clone(),
            nickname: args.participant.clone(),
            preferences: Default::default(),
            language,
        }]),
    };

    let persistence = stores.persistence();
    let repository = persistence.repository().clone();
    let generator = HttpFeedbackGenerator::from_env()
        .map(|generator| Rc::new(generator) as Rc<dyn FeedbackGenerator>);
    let resolver = FeedbackResolver::new(
        PatternCache::new(
            stores.primary.clone(),
            time::Duration::hours(config.pattern_cache_ttl_hours.into()),
        ),
        generator,
        BlockData {
            total_blocks: config.total_blocks,
            trials_per_block: config.trials_per_block,
        },
    );
    let services = SessionServices {
        directory: Rc::new(directory),
        resolver: Rc::new(resolver),
        persistence,
        sync: remote_store().map(|remote| SyncService::new(repository, remote)),
        notifier: HttpCompletionNotifier::from_env()
            .map(|notifier| Rc::new(notifier) as Rc<dyn CompletionNotifier>),
    };

    let setup = SessionSetup {
        participant_id: args.participant.clone(),
        condition,
        session_number,
        language,
    };
    let key_map = config.key_map.clone();
    let (updates_tx, mut updates) = mpsc::unbounded();
    let handle = spawn_session(config, setup, services, updates_tx);
    handle.start();

    let participant = ScriptedParticipant {
        accuracy: args.accuracy,
        miss_rate: args.miss_rate,
        rt_ms: args.rt_ms,
        jitter_ms: args.jitter_ms,
    };

    let mut announced_block = None;
    while let Some(update) = updates.next().await {
        match update {
            SessionUpdate::Screen(Screen::Stimulus { stimulus, .. }) => {
                participant
                    .respond(&handle, &key_map, stimulus.correct_answer)
                    .await;
            }
            SessionUpdate::Screen(Screen::Preparation { error: Some(error) }) => {
                bail!("Session could not start: {error}");
            }
            SessionUpdate::Screen(Screen::Countdown {
                block_number,
                remaining,
            }) => tracing::debug!(block = block_number, remaining, "countdown"),
            SessionUpdate::Screen(Screen::Feedback {
                block_number,
                message,
                seconds_remaining,
                ..
            }) => {
                tracing::debug!(block = block_number, seconds_remaining, "feedback");
                if announced_block != Some(block_number) {
                    announced_block = Some(block_number);
                    println!("[block {block_number}] {message}");
                }
            }
            SessionUpdate::Screen(_) => {}
            SessionUpdate::Finished {
                experiment,
                message,
                ..
            } => {
                println!("{message}");
                println!("{}", serde_json::to_string_pretty(&summary(&experiment))?);
                // Give the background sync a moment before the runtime stops.
                tokio::time::sleep(Duration::from_millis(1500)).await;
                return Ok(());
            }
        }
    }
    bail!("Session ended without a result")
}

fn load_config(path: Option<&PathBuf>, fast: bool) -> Result<ExperimentConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            ExperimentConfig::from_json_str(&raw)?
        }
        None => ExperimentConfig::default(),
    };
    if fast {
        config.inter_trial_delay_ms = 50;
        config.feedback_countdown_secs = 1;
        config.feedback_button_delay_ms = 0;
        config.countdown_ticks = 1;
    }
    Ok(config.with_env_overrides()?)
}

fn remote_store() -> Option<Rc<dyn RemoteStore>> {
    HttpRemoteStore::from_env().map(|remote| Rc::new(remote) as Rc<dyn RemoteStore>)
}

fn summary(experiment: &runner::tasks::stroop::record::Experiment) -> serde_json::Value {
    serde_json::json!({
        "id": experiment.id,
        "condition": experiment.condition_type,
        "completedAt": experiment.completed_at,
        "overallAccuracy": experiment.overall_accuracy,
        "overallAverageRTMs": experiment.overall_average_rt_ms,
        "blocks": experiment
            .blocks
            .iter()
            .map(|block| {
                let stats = block.stats();
                serde_json::json!({
                    "blockNumber": block.block_number,
                    "accuracy": block.accuracy,
                    "averageRTMs": block.average_rt_ms,
                    "timeoutRate": block.timeout_rate,
                    "correct": stats.correct_trials,
                    "incorrect": stats.incorrect_trials,
                    "timeouts": stats.timeout_trials,
                })
            })
            .collect::<Vec<_>>(),
    })
}

async fn sync(stores: Stores) -> Result<()> {
    let persistence = stores.persistence();
    let moved = persistence.flush_fallback()?;
    if moved > 0 {
        println!("moved {moved} cached record(s) into the store");
    }
    let Some(remote) = remote_store() else {
        bail!("Set STROOP_SYNC_URL and STROOP_SYNC_API_KEY to sync");
    };
    let report = SyncService::new(persistence.repository().clone(), remote)
        .sync_pending()
        .await?;
    println!("synced {}, failed {}", report.synced, report.failed);
    Ok(())
}

fn list(stores: Stores) -> Result<()> {
    let persistence = stores.persistence();
    for stored in persistence.repository().all()? {
        println!(
            "{}  {:<12} {:?}  accuracy {:.2}%  blocks {}/{}",
            stored.record.id,
            stored.record.condition_type.as_str(),
            stored.sync_status,
            stored.record.overall_accuracy,
            stored.record.blocks.len(),
            stored.record.planned_total_blocks,
        );
    }
    let cached = persistence.cached_count()?;
    if cached > 0 {
        println!("{cached} record(s) waiting in the fallback cache");
    }
    Ok(())
}

/// Answers with a noisy response time, sometimes wrong, sometimes not at all.
struct ScriptedParticipant {
    accuracy: f64,
    miss_rate: f64,
    rt_ms: u64,
    jitter_ms: u64,
}

impl ScriptedParticipant {
    async fn respond(
        &self,
        handle: &SessionHandle,
        key_map: &runner::core::config::KeyMap,
        correct: Answer,
    ) {
        let (miss, right, delay) = {
            let mut rng = rand::thread_rng();
            let low = self.rt_ms.saturating_sub(self.jitter_ms).max(120);
            let high = (self.rt_ms + self.jitter_ms).max(low + 1);
            (
                rng.gen_bool(self.miss_rate),
                rng.gen_bool(self.accuracy),
                rng.gen_range(low..high),
            )
        };
        if miss {
            return;
        }

        let answer = if right {
            correct
        } else {
            wrong_answer(correct, &mut rand::thread_rng())
        };
        let key = match answer {
            Answer::Red => &key_map.red,
            Answer::Green => &key_map.green,
            Answer::Blue => &key_map.blue,
            Answer::Other => &key_map.other,
        };

        tokio::time::sleep(Duration::from_millis(delay)).await;
        handle.key(key);
    }
}

/// Any answer other than `correct`, uniformly.
fn wrong_answer<R: Rng + ?Sized>(correct: Answer, rng: &mut R) -> Answer {
    let wrong: Vec<Answer> = [Answer::Red, Answer::Green, Answer::Blue, Answer::Other]
        .into_iter()
        .filter(|answer| *answer != correct)
        .collect();
    wrong.choose(rng).copied().unwrap_or(correct)
}
