//! Actor-based check pipeline
//!
//! Each stage of the pipeline runs as an independent async task communicating
//! via Tokio channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!  discovery feed ──> TargetRegistry
//!                          │ lifecycle commands (acknowledged)
//!            ┌─────────────┴─────────────┐
//!            ▼                           ▼
//!     SchedulerActor              RecoveryActor
//!       │ spawns check tasks        │ circuit / backoff
//!       │ (bounded by semaphore)    │ interval updates ──> SchedulerActor
//!       └──> outcomes ──────────────┘
//!                                   │ accepted outcomes
//!                                   ▼
//!                            DispatcherActor
//!                              │ borrow / release
//!                              ▼
//!                        ConnectionPool ──> MQTT / STOMP adapters
//! ```
//!
//! ## Actor Types
//!
//! - **SchedulerActor**: owns every per-target timer, fires checks, discards
//!   results for removed targets
//! - **RecoveryActor**: classifies outcomes, drives the per-target circuit
//!   and backoff policy, forwards accepted outcomes
//! - **DispatcherActor**: serializes outcomes and publishes them with a
//!   bounded retry budget
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Acknowledged lifecycle**: registry commands carry a oneshot ack so
//!    target removal is fully processed before the registry returns
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod dispatcher;
pub mod messages;
pub mod recovery;
pub mod scheduler;
