//! Heartbeat service — periodic agent wake-up on the cron lane.
//!
//! Each tick reads `HEARTBEAT.md` from the workspace and, when it has real
//! content, schedules a run on the agent's heartbeat session. A reply of
//! `HEARTBEAT_OK` (or an empty/silent reply) is swallowed; anything else is
//! delivered to the agent's most recently used channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use ferrogate_core::bus::queue::MessageBus;
use ferrogate_core::bus::types::OutboundMessage;
use ferrogate_core::config::HeartbeatConfig;
use ferrogate_core::run::RunRequest;
use ferrogate_core::session::keys::heartbeat_key;
use ferrogate_core::session::store::SessionStore;
use ferrogate_scheduler::{Scheduler, LANE_CRON};

/// Token that means "nothing needs attention".
const HEARTBEAT_OK_TOKEN: &str = "HEARTBEAT_OK";

/// The file read on every tick.
const HEARTBEAT_FILE: &str = "HEARTBEAT.md";

/// Periodic heartbeat for one agent.
pub struct HeartbeatService {
    agent_id: String,
    workspace: PathBuf,
    scheduler: Arc<Scheduler>,
    store: Arc<SessionStore>,
    bus: Arc<MessageBus>,
    config: HeartbeatConfig,
    shutdown: Arc<Notify>,
}

impl HeartbeatService {
    pub fn new(
        agent_id: impl Into<String>,
        workspace: PathBuf,
        scheduler: Arc<Scheduler>,
        store: Arc<SessionStore>,
        bus: Arc<MessageBus>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            workspace,
            scheduler,
            store,
            bus,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the tick loop to stop after the current tick.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// Run the tick loop until stopped. No-op when disabled.
    pub async fn run(&self) {
        if !self.config.enabled {
            debug!("heartbeat disabled");
            return;
        }
        let interval = Duration::from_secs(self.config.interval_seconds.max(1));
        info!(
            agent = %self.agent_id,
            interval_s = interval.as_secs(),
            "heartbeat started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.tick().await,
                _ = self.shutdown.notified() => {
                    info!(agent = %self.agent_id, "heartbeat stopped");
                    break;
                }
            }
        }
    }

    /// One tick: skip when the heartbeat file has no actionable content,
    /// otherwise schedule a run and deliver a non-OK reply.
    pub async fn tick(&self) {
        if !self.has_actionable_content() {
            debug!(agent = %self.agent_id, "heartbeat file empty, skipping tick");
            return;
        }

        let session_key = heartbeat_key(&self.agent_id, "main");
        let mut req = RunRequest::new(&session_key, &self.config.prompt, "system", "heartbeat");
        req.user_id = "system".to_string();
        req.sender_id = "heartbeat".to_string();
        req.trace_name = Some("heartbeat".to_string());

        let rx = self.scheduler.schedule(LANE_CRON, req);
        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => return,
        };

        match outcome {
            Ok(result) => {
                let content = result.content.trim();
                if content.is_empty() || content.contains(HEARTBEAT_OK_TOKEN) {
                    debug!(agent = %self.agent_id, "heartbeat ok");
                    return;
                }
                let Some((channel, chat_id)) = self.store.last_used_channel(&self.agent_id)
                else {
                    debug!(agent = %self.agent_id, "heartbeat reply but no known channel");
                    return;
                };
                let mut out = OutboundMessage::new(channel, chat_id, content);
                out.media = result.media;
                if let Err(e) = self.bus.publish_outbound(out).await {
                    warn!(error = %e, "failed to publish heartbeat reply");
                }
            }
            Err(e) => warn!(agent = %self.agent_id, error = %e, "heartbeat run failed"),
        }
    }

    /// Whether `HEARTBEAT.md` exists and contains more than headers and
    /// blank lines.
    fn has_actionable_content(&self) -> bool {
        let path = self.workspace.join(HEARTBEAT_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .any(|line| !line.is_empty() && !line.starts_with('#')),
            Err(_) => false,
        }
    }
}
