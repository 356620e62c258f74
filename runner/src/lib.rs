//! Core of the Stroop feedback experiment: stimulus generation, timed trial
//! collection, block statistics, feedback selection and local-first
//! persistence. Launchers embed this crate and render its screens.

pub mod core;
pub mod feedback;
pub mod i18n;
pub mod tasks;
