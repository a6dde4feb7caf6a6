//! Prompt and message-list assembly.
//!
//! The system prompt is built from the agent identity, workspace context
//! files (with a per-user overlay), and the session summary when one exists.
//! Context files live in the workspace root; a file of the same name under
//! `users/{user}/` replaces it for that user.

use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::Utc;
use tracing::debug;

use ferrogate_core::types::{ContentPart, ImageUrl, Message, PeerKind};
use ferrogate_core::utils::sanitize_user_id;

/// Files injected into the system prompt when present in the workspace.
const CONTEXT_FILES: &[&str] = &[
    "AGENTS.md",
    "SOUL.md",
    "USER.md",
    "TOOLS.md",
    "IDENTITY.md",
    "BOOTSTRAP.md",
];

/// Name of the one-time onboarding file, auto-removed after a few turns.
pub const BOOTSTRAP_FILE: &str = "BOOTSTRAP.md";

/// Everything the loop needs to know about the assembled context.
pub struct AssembledContext {
    pub messages: Vec<Message>,
    /// Whether `BOOTSTRAP.md` contributed to the prompt.
    pub has_bootstrap: bool,
}

/// Builds system prompts and message lists for the agent loop.
pub struct ContextBuilder {
    workspace: PathBuf,
    agent_name: String,
}

impl ContextBuilder {
    pub fn new(workspace: impl Into<PathBuf>, agent_name: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            agent_name: agent_name.into(),
        }
    }

    /// Per-user workspace directory (deterministic from the user ID).
    pub fn user_workspace(&self, user_id: &str) -> PathBuf {
        self.workspace.join("users").join(sanitize_user_id(user_id))
    }

    /// Resolve a context file: per-user overlay first, workspace root second.
    fn resolve_context_file(&self, user_id: &str, name: &str) -> Option<PathBuf> {
        let overlay = self.user_workspace(user_id).join(name);
        if overlay.is_file() {
            return Some(overlay);
        }
        let root = self.workspace.join(name);
        root.is_file().then_some(root)
    }

    /// Build the system prompt for one run.
    pub fn build_system_prompt(
        &self,
        user_id: &str,
        summary: Option<&str>,
        extra: Option<&str>,
    ) -> (String, bool) {
        let mut parts: Vec<String> = Vec::new();
        let mut has_bootstrap = false;

        parts.push(self.build_identity());

        for name in CONTEXT_FILES {
            if let Some(path) = self.resolve_context_file(user_id, name) {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    debug!(file = name, "loaded context file");
                    if *name == BOOTSTRAP_FILE {
                        has_bootstrap = true;
                    }
                    parts.push(format!("## {name}\n\n{content}"));
                }
            }
        }

        if let Some(summary) = summary {
            parts.push(format!(
                "## Conversation Summary\n\n\
                 Earlier history was condensed into this summary:\n\n{summary}"
            ));
        }

        if let Some(extra) = extra {
            parts.push(extra.to_string());
        }

        (parts.join("\n\n---\n\n"), has_bootstrap)
    }

    fn build_identity(&self) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let workspace = self.workspace.display();

        format!(
            "# Identity\n\n\
             You are **{name}**, an AI assistant.\n\n\
             - **Date/time**: {now}\n\
             - **Runtime**: Rust on {os}/{arch}\n\
             - **Workspace**: `{workspace}`\n\n\
             You have access to tools. Use them when needed to answer questions, \
             read/write files, run commands, and more. \
             Always prefer using tools over guessing. Be concise and helpful.\n\
             If a message needs no reply (e.g. you were only observing), \
             respond with exactly NO_REPLY.",
            name = self.agent_name,
        )
    }

    /// Assemble the full message list for a provider call.
    #[allow(clippy::too_many_arguments)]
    pub fn build_messages(
        &self,
        history: &[Message],
        history_limit: Option<usize>,
        summary: Option<&str>,
        user_text: &str,
        media: &[String],
        user_id: &str,
        channel: &str,
        chat_id: &str,
        peer_kind: PeerKind,
        extra_system: Option<&str>,
    ) -> AssembledContext {
        let (mut system, has_bootstrap) =
            self.build_system_prompt(user_id, summary, extra_system);
        system.push_str(&format!(
            "\n\n## Current Session\nChannel: {channel}\nChat ID: {chat_id}\nPeer: {peer_kind}"
        ));

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system));

        let tail = match history_limit {
            Some(limit) if history.len() > limit => &history[history.len() - limit..],
            _ => history,
        };
        messages.extend_from_slice(tail);

        if media.is_empty() {
            messages.push(Message::user(user_text));
        } else {
            messages.push(build_multimodal_user_message(user_text, media));
        }

        AssembledContext {
            messages,
            has_bootstrap,
        }
    }

    /// Remove the bootstrap file (workspace root and user overlay).
    pub fn remove_bootstrap(&self, user_id: &str) -> std::io::Result<()> {
        for path in [
            self.user_workspace(user_id).join(BOOTSTRAP_FILE),
            self.workspace.join(BOOTSTRAP_FILE),
        ] {
            if path.is_file() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

// ─────────────────────────────────────────────
// Multimodal helpers
// ─────────────────────────────────────────────

/// Build a user message with base64-encoded images.
///
/// Audio files are skipped — their transcription is already in the text.
fn build_multimodal_user_message(text: &str, media_paths: &[String]) -> Message {
    let mut parts = Vec::new();

    for path in media_paths {
        if is_audio_extension(path) {
            continue;
        }
        if let Ok(data) = std::fs::read(path) {
            let mime = guess_image_mime(path);
            let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{mime};base64,{b64}"),
                    detail: None,
                },
            });
        }
    }

    parts.push(ContentPart::Text {
        text: text.to_string(),
    });

    Message::user_parts(parts)
}

fn is_audio_extension(path: &str) -> bool {
    let lower = path.to_lowercase();
    [
        ".ogg", ".oga", ".opus", ".mp3", ".m4a", ".wav", ".flac", ".aac",
    ]
    .iter()
    .any(|ext| lower.ends_with(ext))
}

fn guess_image_mime(path: &str) -> &str {
    let lower = path.to_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}
