//! Prime difficulty ratio and kQuai controller telemetry for Quai nodes.
//!
//! Polls a node's JSON-RPC interface for normalized miner and best
//! difficulties, derives the `d*/d` ratio and the ΔkQuai controller signal in
//! exact fixed-point arithmetic, and keeps a bounded, chunked series of them
//! for display.

pub mod api;
pub mod config;
pub mod error;
pub mod fixed;
pub mod node;
pub mod poller;
pub mod ratio;
pub mod report;
pub mod rpc;
pub mod tracing;
pub mod units;
pub mod window;
