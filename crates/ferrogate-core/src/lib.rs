//! Core building blocks shared by every Ferrogate crate.
//!
//! - [`types`] — chat messages, tool calls, usage accounting, media artifacts
//! - [`run`] — the `RunRequest` / `RunResult` pair that flows through the scheduler
//! - [`bus`] — inbound/outbound message bus and the typed event fabric
//! - [`session`] — session model, scoped key builder, and the session store
//! - [`config`] — typed configuration schema (camelCase JSON on disk)
//! - [`utils`] — path and string helpers

pub mod bus;
pub mod config;
pub mod run;
pub mod session;
pub mod types;
pub mod utils;
