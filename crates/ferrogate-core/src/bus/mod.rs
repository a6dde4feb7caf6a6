//! Message bus connecting channel adapters to the gateway, plus the typed
//! event fabric used for streaming and tracing side-channels.

pub mod events;
pub mod queue;
pub mod types;
