//! The Stroop colour-naming task: stimuli, scoring, the session state
//! machine and its async driver.

pub mod engine;
pub mod metrics;
pub mod record;
pub mod session;
pub mod stimulus;

pub use engine::{Effect, EngineEvent, EngineState, Screen, StroopEngine};
pub use record::{Condition, Experiment, SessionNumber, SessionSetup};
pub use session::{spawn_session, SaveStatus, SessionHandle, SessionServices, SessionUpdate};
