//! The inbound gateway: everything between a channel adapter's message and a
//! scheduled agent run.
//!
//! Pipeline per message: dedup → sender-class branching (announce runs,
//! commands) → per-sender debounce → agent resolution → session-key
//! construction → scheduler submission → result fan-out to the outbound bus.

pub mod announce;
pub mod binding;
pub mod debounce;
pub mod dedup;
pub mod heartbeat;
pub mod router;

pub use router::InboundRouter;
