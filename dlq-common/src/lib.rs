pub mod config;
pub mod eventbus;
pub mod metrics;
pub mod retry;
pub mod spool;
pub mod test_utils;
