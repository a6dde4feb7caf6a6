//! The inbound router: raw channel messages → scheduled agent runs →
//! outbound replies.
//!
//! Pipeline per message:
//! 1. dedup on `(channel, sender, chat, message_id)`,
//! 2. loop-control commands (`stop` / `stopall`),
//! 3. system-sender branching: subagent / delegate / handoff / teammate
//!    announce runs bypass the debouncer and nest under the parent trace,
//! 4. everything else debounces per sender and flows through
//!    `process_normal` into the scheduler's `main` lane,
//! 5. the outcome is awaited asynchronously and fanned out to the outbound
//!    bus, with cancellation mapped to an empty delivery so channel UIs can
//!    clear their placeholders.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ferrogate_core::bus::queue::MessageBus;
use ferrogate_core::bus::types::{InboundMessage, OutboundMessage};
use ferrogate_core::types::MediaArtifact;
use ferrogate_core::config::Config;
use ferrogate_core::run::{is_cancelled, Outcome, RunRequest};
use ferrogate_core::session::keys::{
    build_scoped_session_key, group_user_id, with_topic, DmScope,
};
use ferrogate_core::session::store::SessionStore;
use ferrogate_core::types::{meta, Metadata, PeerKind};
use ferrogate_scheduler::{ScheduleOpts, Scheduler, LANE_DELEGATE, LANE_MAIN, LANE_SUBAGENT};

use crate::binding::BindingTable;
use crate::debounce::Debouncer;
use crate::dedup::DedupSet;

/// Loop-cancel feedback strings.
const STOP_OK: &str = "Task stopped.";
const STOP_ALL_OK: &str = "All tasks stopped.";
const STOP_NONE: &str = "No active task to stop.";
const STOP_ALL_NONE: &str = "No active tasks to stop.";

/// System-prompt fragment injected for group conversations.
const GROUP_AWARENESS: &str = "## Group Chat\n\
    You are in a group conversation with multiple participants. Messages are \
    prefixed with sender names where available. Only respond when you add \
    value; otherwise reply with exactly NO_REPLY.";

/// Where a run's reply (and streaming events) should be delivered.
#[derive(Clone, Debug)]
struct DeliveryTarget {
    channel: String,
    chat_id: String,
    metadata: Metadata,
}

/// Converts inbound messages into scheduled runs and dispatches replies.
pub struct InboundRouter {
    bus: Arc<MessageBus>,
    scheduler: Arc<Scheduler>,
    store: Arc<SessionStore>,
    config: Config,
    dedup: DedupSet,
    debouncer: Debouncer,
    merged_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    bindings: BindingTable,
    /// Live run → delivery target, for streaming/reaction routing.
    run_targets: Arc<std::sync::Mutex<HashMap<String, (String, String)>>>,
}

impl InboundRouter {
    pub fn new(
        bus: Arc<MessageBus>,
        scheduler: Arc<Scheduler>,
        store: Arc<SessionStore>,
        config: Config,
        bindings: BindingTable,
    ) -> Self {
        let dedup = DedupSet::new(
            Duration::from_secs(config.gateway.dedup_ttl_minutes * 60),
            config.gateway.dedup_capacity,
        );
        let (debouncer, merged_rx) =
            Debouncer::new(Duration::from_millis(config.gateway.debounce_ms));

        Self {
            bus,
            scheduler,
            store,
            config,
            dedup,
            debouncer,
            merged_rx: Mutex::new(Some(merged_rx)),
            bindings,
            run_targets: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Delivery target for a live run, for channel adapters routing
    /// streaming chunks and reactions.
    pub fn target_for_run(&self, run_id: &str) -> Option<(String, String)> {
        self.run_targets.lock().unwrap().get(run_id).cloned()
    }

    /// Consume the inbound bus until shutdown. Shutdown flushes pending
    /// debounce buckets so buffered work is scheduled, not dropped.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut merged_rx = self
            .merged_rx
            .lock()
            .await
            .take()
            .expect("router run() called twice");

        info!("inbound router started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("inbound router shutting down, flushing debounce buckets");
                    self.debouncer.flush_all().await;
                    while let Ok(msg) = merged_rx.try_recv() {
                        self.process_normal(msg).await;
                    }
                    break;
                }
                Some(msg) = merged_rx.recv() => {
                    self.process_normal(msg).await;
                }
                msg = self.bus.consume_inbound() => match msg {
                    Some(msg) => self.handle_inbound(msg).await,
                    None => {
                        info!("inbound channel closed, router exiting");
                        break;
                    }
                },
            }
        }
    }

    /// Stages 1–3 of the pipeline; normal messages land in the debouncer.
    async fn handle_inbound(&self, msg: InboundMessage) {
        // 1. Deduplicate.
        if let Some(message_id) = msg.message_id() {
            let key = DedupSet::key_for(&msg.channel, &msg.sender_id, &msg.chat_id, message_id);
            if !self.dedup.check_and_insert(&key) {
                return;
            }
        }

        // 2. Loop-control commands.
        if let Some(command) = msg.command() {
            self.handle_command(&msg, &command.to_string()).await;
            return;
        }

        // 3. System-sender announce runs bypass the debouncer.
        if msg.is_system() {
            self.handle_system(msg).await;
            return;
        }

        self.debouncer.push(msg).await;
    }

    async fn handle_command(&self, msg: &InboundMessage, command: &str) {
        let Some(session_key) = self.session_key_for(msg) else {
            return;
        };

        let reply = match command {
            "stop" => {
                if self.scheduler.cancel_one_session(&session_key) {
                    STOP_OK
                } else {
                    STOP_NONE
                }
            }
            "stopall" => {
                if self.scheduler.cancel_session(&session_key) {
                    STOP_ALL_OK
                } else {
                    STOP_ALL_NONE
                }
            }
            other => {
                warn!(command = %other, "unknown command, ignoring");
                return;
            }
        };

        info!(session_key = %session_key, command = %command, reply = %reply, "command handled");
        let target = self.delivery_target(msg);
        self.publish(target, reply.to_string(), Vec::new()).await;
    }

    /// Announce runs from the system channel: subagent and delegate results
    /// return to the *parent* session; handoff and teammate runs target the
    /// destination agent's session. Parent trace linkage nests the announce
    /// trace under the originating user run.
    async fn handle_system(&self, msg: InboundMessage) {
        let sender = msg.sender_id.clone();
        let (lane, use_target_agent) = if sender.starts_with("subagent:") {
            (LANE_SUBAGENT, false)
        } else if sender.starts_with("delegate:") {
            (LANE_DELEGATE, false)
        } else if sender.starts_with("handoff:") {
            (LANE_DELEGATE, true)
        } else if sender.starts_with("teammate:") {
            (LANE_DELEGATE, true)
        } else {
            warn!(sender = %sender, "unknown system sender, dropping");
            return;
        };

        let origin_channel = msg
            .metadata
            .get(meta::ORIGIN_CHANNEL)
            .cloned()
            .unwrap_or_else(|| msg.channel.clone());
        let origin_peer_kind = PeerKind::parse(
            msg.metadata
                .get(meta::ORIGIN_PEER_KIND)
                .map(|s| s.as_str())
                .unwrap_or(""),
        );

        let agent_id = if use_target_agent {
            let target = msg
                .metadata
                .get(meta::TARGET_AGENT)
                .or_else(|| msg.metadata.get(meta::TO_AGENT))
                .cloned();
            match target {
                Some(agent) if self.bindings.is_known(&agent) => agent,
                Some(agent) => {
                    warn!(agent = %agent, "announce targets unknown agent, dropping");
                    return;
                }
                None => {
                    warn!(sender = %sender, "announce missing target agent, dropping");
                    return;
                }
            }
        } else {
            let parent = msg
                .metadata
                .get(meta::PARENT_AGENT)
                .cloned()
                .unwrap_or_else(|| self.config.gateway.default_agent.clone());
            if !self.bindings.is_known(&parent) {
                warn!(agent = %parent, "announce from unknown parent agent, dropping");
                return;
            }
            parent
        };

        // A handoff re-routes the conversation to the target agent.
        if sender.starts_with("handoff:") {
            self.bindings
                .set_route(&origin_channel, &msg.chat_id, agent_id.clone());
        }

        let session_key = build_scoped_session_key(
            &agent_id,
            &origin_channel,
            origin_peer_kind,
            &msg.chat_id,
            self.dm_scope(),
            &self.config.gateway.main_key,
        );

        let label = msg
            .metadata
            .get(meta::SUBAGENT_LABEL)
            .cloned()
            .unwrap_or_else(|| sender.clone());

        let mut req = RunRequest::new(&session_key, &msg.content, &origin_channel, &msg.chat_id);
        req.peer_kind = origin_peer_kind;
        req.user_id = msg.effective_user_id().to_string();
        req.sender_id = msg.sender_id.clone();
        req.parent_trace_id = msg.metadata.get(meta::ORIGIN_TRACE_ID).cloned();
        req.parent_span_id = msg.metadata.get(meta::ORIGIN_ROOT_SPAN_ID).cloned();
        req.trace_name = Some(label);
        for key in [meta::FROM_AGENT, meta::TO_AGENT, meta::DELEGATION_ID, meta::HANDOFF_ID] {
            if let Some(value) = msg.metadata.get(key) {
                req.trace_tags.insert(key.to_string(), value.clone());
            }
        }

        debug!(
            lane = %lane,
            session_key = %session_key,
            sender = %sender,
            "scheduling announce run"
        );

        let target = DeliveryTarget {
            channel: origin_channel,
            chat_id: msg.chat_id.clone(),
            metadata: Metadata::new(),
        };
        let run_id = req.run_id.clone();
        let rx = self.scheduler.schedule(lane, req);
        self.spawn_fanout(run_id, rx, target);
    }

    /// Stage 4: debounced normal messages become runs on the `main` lane.
    async fn process_normal(&self, msg: InboundMessage) {
        let Some(agent_id) =
            self.bindings
                .resolve(msg.agent_id.as_deref(), &msg.channel, &msg.chat_id)
        else {
            return;
        };

        let peer_kind = msg.peer_kind;
        let session_key = self.build_session_key(&agent_id, &msg);

        // Group chats coalesce all senders into one identity for memory and
        // files; the original sender is kept for permission checks.
        let user_id = match peer_kind {
            PeerKind::Group => {
                let group_id = msg
                    .metadata
                    .get(meta::GUILD_ID)
                    .map(|s| s.as_str())
                    .unwrap_or(&msg.chat_id);
                group_user_id(&msg.channel, group_id)
            }
            PeerKind::Direct => msg.effective_user_id().to_string(),
        };

        let max_concurrent = match peer_kind {
            PeerKind::Direct => self.config.scheduler.direct_max_concurrent,
            PeerKind::Group => self.config.scheduler.group_max_concurrent,
        };

        let stream = peer_kind != PeerKind::Group
            && self
                .config
                .gateway
                .streaming_channels
                .iter()
                .any(|c| c == &msg.channel);

        let mut req = RunRequest::new(&session_key, &msg.content, &msg.channel, &msg.chat_id);
        req.peer_kind = peer_kind;
        req.media = msg.media.iter().map(|m| m.path.clone()).collect();
        req.user_id = user_id;
        req.sender_id = msg.sender_id.clone();
        req.stream = stream;
        req.history_limit = msg.history_limit;
        req.trace_name = Some(format!("chat:{}", msg.channel));
        if peer_kind == PeerKind::Group {
            req.extra_system_prompt = Some(GROUP_AWARENESS.to_string());
        }
        if let Some(name) = msg.metadata.get(meta::USER_NAME) {
            req.trace_tags
                .insert(meta::USER_NAME.to_string(), name.clone());
        }

        debug!(
            session_key = %session_key,
            agent = %agent_id,
            peer = %peer_kind,
            stream = stream,
            "scheduling run"
        );

        let target = self.delivery_target(&msg);
        let run_id = req.run_id.clone();
        let rx = self.scheduler.schedule_with_opts(
            LANE_MAIN,
            req,
            ScheduleOpts {
                max_concurrent: Some(max_concurrent),
            },
        );
        self.spawn_fanout(run_id, rx, target);
    }

    /// Stage 5: await the outcome off the router loop and publish outbound.
    fn spawn_fanout(
        &self,
        run_id: String,
        rx: tokio::sync::oneshot::Receiver<Outcome>,
        target: DeliveryTarget,
    ) {
        self.run_targets
            .lock()
            .unwrap()
            .insert(run_id.clone(), (target.channel.clone(), target.chat_id.clone()));

        let outbound = self.bus.outbound_sender();
        let run_targets = self.run_targets.clone();
        tokio::spawn(async move {
            let outcome = rx.await;
            run_targets.lock().unwrap().remove(&run_id);

            let mut out = OutboundMessage::empty(&target.channel, &target.chat_id);
            out.metadata = target.metadata;

            match outcome {
                Err(_) => {
                    warn!(run_id = %run_id, "outcome channel dropped without a result");
                    return;
                }
                Ok(Ok(result)) => {
                    // Empty content (silent sentinel included) with no media
                    // still goes out, so channels can clear placeholders.
                    out.content = result.content;
                    out.media = result.media;
                    if out.media.iter().any(|m| m.audio_as_voice) {
                        out.metadata
                            .insert(meta::AUDIO_AS_VOICE.to_string(), "true".to_string());
                    }
                }
                Ok(Err(e)) if is_cancelled(&e) => {
                    debug!(run_id = %run_id, "run cancelled, publishing empty outbound");
                }
                Ok(Err(e)) => {
                    out.content = format!("I encountered an error: {e:#}");
                }
            }

            if let Err(e) = outbound.send(out).await {
                warn!(run_id = %run_id, error = %e, "failed to publish outbound");
            }
        });
    }

    // ────────────── Helpers ──────────────

    /// Sends a single outbound message to the given target immediately.
    async fn publish(&self, target: DeliveryTarget, content: String, media: Vec<MediaArtifact>) {
        let mut out = OutboundMessage::new(target.channel, target.chat_id, content);
        out.media = media;
        out.metadata = target.metadata;
        if let Err(e) = self.bus.outbound_sender().send(out).await {
            warn!(error = %e, "failed to publish outbound");
        }
    }

    fn dm_scope(&self) -> DmScope {
        match self.config.gateway.dm_scope.as_str() {
            "main" => DmScope::Main,
            _ => DmScope::PerChat,
        }
    }

    fn build_session_key(&self, agent_id: &str, msg: &InboundMessage) -> String {
        let base = build_scoped_session_key(
            agent_id,
            &msg.channel,
            msg.peer_kind,
            &msg.chat_id,
            self.dm_scope(),
            &self.config.gateway.main_key,
        );
        match msg.topic_id() {
            Some(topic) => with_topic(&base, topic),
            None => base,
        }
    }

    /// Session key for command handling (same resolution as process_normal).
    fn session_key_for(&self, msg: &InboundMessage) -> Option<String> {
        let agent_id =
            self.bindings
                .resolve(msg.agent_id.as_deref(), &msg.channel, &msg.chat_id)?;
        Some(self.build_session_key(&agent_id, msg))
    }

    fn delivery_target(&self, msg: &InboundMessage) -> DeliveryTarget {
        let mut metadata = Metadata::new();
        if let Some(message_id) = msg.message_id() {
            metadata.insert(meta::REPLY_TO_MESSAGE_ID.to_string(), message_id.to_string());
        }
        for key in [meta::MESSAGE_THREAD_ID, meta::LOCAL_KEY, meta::PLACEHOLDER_KEY] {
            if let Some(value) = msg.metadata.get(key) {
                metadata.insert(key.to_string(), value.clone());
            }
        }
        DeliveryTarget {
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            metadata,
        }
    }

    /// The session store shared with the agent loops (diagnostics surface).
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }
}
