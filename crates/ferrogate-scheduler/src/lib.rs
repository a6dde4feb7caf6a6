//! Run scheduler: lane bulkheads, per-session admission, adaptive throttle,
//! cancellation.
//!
//! Each lane (`main`, `subagent`, `delegate`, `cron`) owns a bounded FIFO
//! queue and a worker pool. Within a session, runs execute in enqueue order
//! and never exceed the session's effective concurrency; saturating one lane
//! never starves another.
//!
//! The scheduler knows nothing about agents: it executes an injected
//! callback per job, which lets the agent router be wired in after
//! construction.

pub mod scheduler;
pub mod throttle;

pub use scheduler::{
    ScheduleError, ScheduleOpts, Scheduler, LANE_CRON, LANE_DELEGATE, LANE_MAIN, LANE_SUBAGENT,
};
pub use throttle::{throttle_cap, ThrottleDecision};
