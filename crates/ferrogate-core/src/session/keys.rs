//! Session key construction.
//!
//! Every conversation scope maps to a key of the form
//! `agent:{agentID}:{scopeSuffix}`. The suffix encodes channel, peer kind,
//! chat and optionally a forum topic:
//!
//! - `agent:main:telegram:direct:12345`         — per-chat DM scope
//! - `agent:main:telegram:direct:main`          — merged DM scope
//! - `agent:main:discord:group:g1`              — group chat
//! - `agent:main:telegram:group:c9:topic:77`    — forum topic
//! - `agent:main:cron:job-4`                    — cron job scope
//! - `agent:main:subagent:ab12cd34`             — subagent scope
//! - `agent:main:heartbeat:main`                — heartbeat scope
//!
//! All key formats live here; nothing else in the workspace concatenates
//! session-key strings by hand.

use crate::types::PeerKind;

/// How direct-message history is scoped for an agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DmScope {
    /// Every DM chat gets its own session.
    #[default]
    PerChat,
    /// All DMs share one session under the main key.
    Main,
}

/// Build the session key for a channel conversation.
pub fn build_scoped_session_key(
    agent_id: &str,
    channel: &str,
    peer_kind: PeerKind,
    chat_id: &str,
    dm_scope: DmScope,
    main_key: &str,
) -> String {
    match peer_kind {
        PeerKind::Direct => match dm_scope {
            DmScope::PerChat => format!("agent:{agent_id}:{channel}:direct:{chat_id}"),
            DmScope::Main => format!("agent:{agent_id}:{channel}:direct:{main_key}"),
        },
        PeerKind::Group => format!("agent:{agent_id}:{channel}:group:{chat_id}"),
    }
}

/// Append a forum-topic suffix to a group session key.
pub fn with_topic(base: &str, topic_id: &str) -> String {
    format!("{base}:topic:{topic_id}")
}

/// Session key for a cron job run.
pub fn cron_key(agent_id: &str, job_id: &str) -> String {
    format!("agent:{agent_id}:cron:{job_id}")
}

/// Session key for a spawned subagent.
pub fn subagent_key(agent_id: &str, task_id: &str) -> String {
    format!("agent:{agent_id}:subagent:{task_id}")
}

/// Session key for heartbeat ticks.
pub fn heartbeat_key(agent_id: &str, id: &str) -> String {
    format!("agent:{agent_id}:heartbeat:{id}")
}

/// Extract the agent ID from a session key, if it has the canonical shape.
pub fn agent_of(session_key: &str) -> Option<&str> {
    let rest = session_key.strip_prefix("agent:")?;
    let (agent_id, _) = rest.split_once(':')?;
    Some(agent_id)
}

/// Group-coalesced user ID: all senders in a group chat share one identity
/// for memory and files. The original sender stays available separately for
/// permission checks.
pub fn group_user_id(channel: &str, group_id: &str) -> String {
    format!("group:{channel}:{group_id}")
}
