pub mod backoff;
pub mod env;
pub mod error;
pub mod openai;
pub mod redis;
pub mod usage;
