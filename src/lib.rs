pub mod actuator;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod poll;
pub mod queue;
pub mod reconcile;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod workflow;

#[cfg(test)]
mod testing;
