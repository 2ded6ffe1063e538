pub mod config;
pub mod dedup;
pub mod error;
pub mod listener;
pub mod reconcile;
pub mod record;
pub mod source;
pub mod storage;
