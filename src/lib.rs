pub mod config;
pub mod dialer;
pub mod engine;
pub mod error;
pub mod event;
pub mod plan;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod switch;
pub mod verbs;
pub mod version;

#[cfg(test)]
mod testing;
