//! Generation relay: launches one isolated worker per job and relays its
//! events to any number of observers.
//!
//! ```text
//!   POST /api/jobs ─┐                        ┌─ /relay/observe/{id} (many)
//!   console start ──┤                        │
//!                   ▼                        │
//!             Orchestrator ── launch ──► TaskRunner (docker | local)
//!                   │                        │
//!                   │ wait / send_command    │ worker dials back
//!                   ▼                        ▼
//!               RelayHub ◄──── /relay/worker/{id} (one)
//!                   │
//!                   └── JobStore (SQLite): status, iterations, snapshots
//! ```
//!
//! On success the orchestrator publishes the output, records `completed`
//! and only then broadcasts `status_change`. Every failure converges on a
//! single store write and broadcast.

pub mod api;
pub mod bridge;
pub mod db;
pub mod deploy;
pub mod docker;
pub mod hub;
pub mod identity;
pub mod local;
pub mod messages;
pub mod models;
pub mod orchestrator;
pub mod publisher;
pub mod runner;
pub mod server;
pub mod store;
pub mod ws;
