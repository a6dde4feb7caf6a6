//! Path and string helpers used across the workspace.

use std::path::PathBuf;

/// Ferrogate data directory (`~/.ferrogate/`).
pub fn get_data_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ferrogate")
}

/// Sessions directory (`~/.ferrogate/sessions/`).
pub fn get_sessions_path() -> PathBuf {
    get_data_path().join("sessions")
}

/// Workspace root (`~/.ferrogate/workspace/`).
pub fn get_default_workspace_path() -> PathBuf {
    get_data_path().join("workspace")
}

/// Truncate a string to `max_len` characters, appending "..." if truncated.
/// Unicode-safe.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

/// Sanitize a string for use as a filename.
pub fn safe_filename(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Deterministic directory-safe component for a user ID. Group identities
/// like `group:discord:g1` map to `group_discord_g1`; anything that would
/// escape a path is replaced.
pub fn sanitize_user_id(user_id: &str) -> String {
    let cleaned = safe_filename(&user_id.replace(':', "_"));
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.' || c == '_') {
        "anonymous".to_string()
    } else {
        cleaned
    }
}

/// Expand `~` to the home directory in a path string.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs_next::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else if path == "~" {
        dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else {
        PathBuf::from(path)
    }
}
