//! # Order Bridge Library
//!
//! Core functionality for the order polling bridge: the durable store,
//! upstream RPC client, envelope mapper and the poll-and-deliver engine.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod db;
pub mod mapper;
pub mod models;
pub mod poller;
pub mod repositories;
pub mod telemetry;
pub mod upstream;
pub use migration;
