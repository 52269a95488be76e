#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod http_cache;
pub mod logging;
pub mod service;
pub mod transaction;
