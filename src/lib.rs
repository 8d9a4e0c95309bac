pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod file_store;
pub mod gateway;
pub mod metrics;
pub mod persistence;
pub mod queue;
pub mod ratelimit;
pub mod retry;
pub mod upstream;
