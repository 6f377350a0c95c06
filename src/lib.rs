//! Caching gateway that fetches media player scripts, keeps them and their
//! preprocessed forms in layered memory and disk caches, and hands
//! signature and n-parameter challenges to a bounded pool of solver workers.

pub mod cli;
pub mod config;
pub mod fetcher;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod storage;
pub mod worker;

pub use config::AppConfig;
pub use gateway::{AppContext, GatewayError};
pub use storage::{DiskCache, MemoryCache};
pub use worker::{SolvingEngine, WorkerPool};
