//! STEAMFEED — Resilient live-odds ingestion engine.
//!
//! Keeps authenticated sessions alive against counterparties that
//! actively detect and block automated access, polls live prices on an
//! adaptive jittered schedule, and surfaces time-critical price
//! movements and ranked alerts.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod credentials;
pub mod proxy;
pub mod session;
pub mod adapters;
pub mod resilience;
pub mod poller;
pub mod movement;
pub mod alerts;
pub mod engine;
