//! Builders for system-channel announce messages.
//!
//! Spawn-style tools and delegation flows report back by publishing an
//! inbound message on the `system` channel; the router recognises the
//! sender prefix and schedules an announce run that nests under the
//! originating user run. These builders are the single place that knows the
//! metadata shape, so producers and the router cannot drift apart.

use ferrogate_core::bus::types::InboundMessage;
use ferrogate_core::types::{meta, PeerKind};

/// Where the announcing work originated: the conversation the result should
/// flow back into, and the trace it should nest under.
#[derive(Clone, Debug)]
pub struct Origin {
    pub channel: String,
    pub chat_id: String,
    pub peer_kind: PeerKind,
    pub agent_id: String,
    pub trace_id: Option<String>,
    pub root_span_id: Option<String>,
}

impl Origin {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        peer_kind: PeerKind,
        agent_id: impl Into<String>,
    ) -> Self {
        Origin {
            channel: channel.into(),
            chat_id: chat_id.into(),
            peer_kind,
            agent_id: agent_id.into(),
            trace_id: None,
            root_span_id: None,
        }
    }

    /// Attach the parent trace linkage.
    pub fn with_trace(mut self, trace_id: impl Into<String>, root_span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.root_span_id = Some(root_span_id.into());
        self
    }

    fn apply(&self, mut msg: InboundMessage) -> InboundMessage {
        msg.metadata
            .insert(meta::ORIGIN_CHANNEL.to_string(), self.channel.clone());
        msg.metadata.insert(
            meta::ORIGIN_PEER_KIND.to_string(),
            self.peer_kind.as_str().to_string(),
        );
        msg.metadata
            .insert(meta::PARENT_AGENT.to_string(), self.agent_id.clone());
        if let Some(trace_id) = &self.trace_id {
            msg.metadata
                .insert(meta::ORIGIN_TRACE_ID.to_string(), trace_id.clone());
        }
        if let Some(span_id) = &self.root_span_id {
            msg.metadata
                .insert(meta::ORIGIN_ROOT_SPAN_ID.to_string(), span_id.clone());
        }
        msg
    }
}

/// A finished subagent task reporting its result to the parent session.
///
/// The content wraps the raw result with summarization guidance so the
/// parent agent relays it naturally instead of dumping it verbatim.
pub fn subagent_result(
    origin: &Origin,
    task_id: &str,
    label: &str,
    result: &str,
) -> InboundMessage {
    let content = format!(
        "## Subagent Result\n\
         **Task**: {label}\n\n\
         {result}\n\n\
         ---\n\
         *Summarize this naturally for the user. Keep it brief. \
         Do not mention 'subagent' or task IDs.*"
    );
    let msg = InboundMessage::new(
        "system",
        format!("subagent:{task_id}"),
        &origin.chat_id,
        content,
    )
    .with_meta(meta::SUBAGENT_LABEL, label);
    origin.apply(msg)
}

/// A delegated task reporting back to the delegating agent's session.
pub fn delegate_result(origin: &Origin, delegation_id: &str, result: &str) -> InboundMessage {
    let msg = InboundMessage::new(
        "system",
        format!("delegate:{delegation_id}"),
        &origin.chat_id,
        result,
    )
    .with_meta(meta::DELEGATION_ID, delegation_id);
    origin.apply(msg)
}

/// A conversation handoff: `target_agent` takes over the origin chat. The
/// router installs a route so later messages in the chat go to the target.
pub fn handoff(
    origin: &Origin,
    handoff_id: &str,
    target_agent: &str,
    briefing: &str,
) -> InboundMessage {
    let msg = InboundMessage::new(
        "system",
        format!("handoff:{handoff_id}"),
        &origin.chat_id,
        briefing,
    )
    .with_meta(meta::HANDOFF_ID, handoff_id)
    .with_meta(meta::TARGET_AGENT, target_agent);
    origin.apply(msg)
}

/// An agent-to-agent message delivered into the target agent's session.
pub fn teammate_message(
    origin: &Origin,
    from_agent: &str,
    to_agent: &str,
    content: &str,
) -> InboundMessage {
    let msg = InboundMessage::new(
        "system",
        format!("teammate:{from_agent}"),
        &origin.chat_id,
        content,
    )
    .with_meta(meta::FROM_AGENT, from_agent)
    .with_meta(meta::TO_AGENT, to_agent)
    .with_meta(meta::TARGET_AGENT, to_agent);
    origin.apply(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::new("telegram", "c1", PeerKind::Direct, "main").with_trace("t1", "s1")
    }

    #[test]
    fn test_subagent_result_shape() {
        let msg = subagent_result(&origin(), "ab12", "research", "found 3 papers");

        assert_eq!(msg.channel, "system");
        assert_eq!(msg.sender_id, "subagent:ab12");
        assert_eq!(msg.chat_id, "c1");
        assert!(msg.content.contains("## Subagent Result"));
        assert!(msg.content.contains("found 3 papers"));
        assert!(msg.content.contains("Summarize this naturally"));
        assert_eq!(msg.metadata.get(meta::ORIGIN_CHANNEL).unwrap(), "telegram");
        assert_eq!(msg.metadata.get(meta::ORIGIN_PEER_KIND).unwrap(), "direct");
        assert_eq!(msg.metadata.get(meta::PARENT_AGENT).unwrap(), "main");
        assert_eq!(msg.metadata.get(meta::ORIGIN_TRACE_ID).unwrap(), "t1");
        assert_eq!(msg.metadata.get(meta::ORIGIN_ROOT_SPAN_ID).unwrap(), "s1");
        assert_eq!(msg.metadata.get(meta::SUBAGENT_LABEL).unwrap(), "research");
    }

    #[test]
    fn test_delegate_result_shape() {
        let msg = delegate_result(&origin(), "d-9", "report ready");
        assert_eq!(msg.sender_id, "delegate:d-9");
        assert_eq!(msg.content, "report ready");
        assert_eq!(msg.metadata.get(meta::DELEGATION_ID).unwrap(), "d-9");
    }

    #[test]
    fn test_handoff_carries_target() {
        let msg = handoff(&origin(), "h-1", "ops", "customer needs billing help");
        assert_eq!(msg.sender_id, "handoff:h-1");
        assert_eq!(msg.metadata.get(meta::TARGET_AGENT).unwrap(), "ops");
        assert_eq!(msg.metadata.get(meta::HANDOFF_ID).unwrap(), "h-1");
    }

    #[test]
    fn test_teammate_preserves_both_agents() {
        let msg = teammate_message(&origin(), "main", "ops", "please review the deploy");
        assert_eq!(msg.sender_id, "teammate:main");
        assert_eq!(msg.metadata.get(meta::FROM_AGENT).unwrap(), "main");
        assert_eq!(msg.metadata.get(meta::TO_AGENT).unwrap(), "ops");
        assert_eq!(msg.metadata.get(meta::TARGET_AGENT).unwrap(), "ops");
    }

    #[test]
    fn test_origin_without_trace_omits_linkage() {
        let origin = Origin::new("discord", "g1", PeerKind::Group, "main");
        let msg = delegate_result(&origin, "d-1", "done");
        assert!(!msg.metadata.contains_key(meta::ORIGIN_TRACE_ID));
        assert!(!msg.metadata.contains_key(meta::ORIGIN_ROOT_SPAN_ID));
        assert_eq!(msg.metadata.get(meta::ORIGIN_PEER_KIND).unwrap(), "group");
    }
}
