//! Personalized feedback: scenario classification, message patterns and
//! their resolution.

pub mod generator;
pub mod pattern;
pub mod resolver;
pub mod scenario;

pub use pattern::{select_message, FeedbackPattern};
pub use resolver::{FeedbackResolver, PatternSource, ResolvedFeedback};
pub use scenario::{classify, BlockPerformance, ScenarioKey};
