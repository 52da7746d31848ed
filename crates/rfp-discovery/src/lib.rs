pub mod backend;
pub mod batch;
pub mod breaker;
pub mod carryover;
pub mod config;
pub mod dedup;
pub mod error;
pub mod filter;
pub mod gate;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod prompt;
pub mod retry;
pub mod schedule;
pub mod scoring;
pub mod server;
pub mod sink;
pub mod source;
pub mod summary;

#[cfg(test)]
mod testing;
