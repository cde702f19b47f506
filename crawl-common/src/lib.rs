pub mod channel;
pub mod dedup;
pub mod fetcher;
pub mod health;
pub mod kafka;
pub mod keys;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod metrics;
pub mod pgstore;
pub mod retry;
