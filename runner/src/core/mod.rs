pub mod config;
pub mod format;
pub mod logging;
pub mod notify;
pub mod participant;
pub mod platform;
pub mod storage;
pub mod sync;
pub mod timing;
