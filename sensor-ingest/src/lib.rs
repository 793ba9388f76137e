pub mod app;
pub mod bus;
pub mod config;
pub mod feed;
pub mod generator;
pub mod health;
pub mod metrics;
pub mod notifier;
pub mod payload;
pub mod pipeline;
pub mod sweeper;
