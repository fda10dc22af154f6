pub mod audit;
pub mod breaker;
pub mod config;
pub mod guardrail;
pub mod http;
pub mod metrics;
pub mod proxy;
pub mod rate_limit;
