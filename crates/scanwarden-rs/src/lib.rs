pub mod api;
pub mod cache;
pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod models;
pub mod notify;
pub mod parser;
pub mod runner;
pub mod scheduler;
pub mod security;
pub mod settings;
pub mod stream;
pub mod telemetry;

#[cfg(test)]
mod testing;
