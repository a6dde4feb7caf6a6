//! Media artifact conventions in tool output.
//!
//! Tools produce artifacts with lines of the form `MEDIA:{path}`. A line
//! consisting of `[[audio_as_voice]]` immediately before a `MEDIA:` line
//! requests voice-note delivery for that artifact.

use ferrogate_core::types::MediaArtifact;

const MEDIA_PREFIX: &str = "MEDIA:";
const VOICE_MARKER: &str = "[[audio_as_voice]]";

/// Collect media artifacts referenced in tool or reply text.
pub fn extract_artifacts(text: &str) -> Vec<MediaArtifact> {
    let mut artifacts = Vec::new();
    let mut voice_pending = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed == VOICE_MARKER {
            voice_pending = true;
            continue;
        }
        if let Some(path) = trimmed.strip_prefix(MEDIA_PREFIX) {
            let path = path.trim();
            if !path.is_empty() {
                artifacts.push(MediaArtifact {
                    url: path.to_string(),
                    content_type: guess_content_type(path),
                    caption: None,
                    audio_as_voice: voice_pending,
                });
            }
        }
        voice_pending = false;
    }
    artifacts
}

/// Remove `MEDIA:` lines and voice markers from user-visible text.
pub fn strip_media_lines(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed != VOICE_MARKER && !trimmed.starts_with(MEDIA_PREFIX)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Guess a MIME type from the file extension, when recognisable.
fn guess_content_type(path: &str) -> Option<String> {
    let lower = path.to_lowercase();
    let mime = if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".mp3") {
        "audio/mpeg"
    } else if lower.ends_with(".ogg") || lower.ends_with(".oga") {
        "audio/ogg"
    } else if lower.ends_with(".wav") {
        "audio/wav"
    } else if lower.ends_with(".mp4") {
        "video/mp4"
    } else if lower.ends_with(".pdf") {
        "application/pdf"
    } else {
        return None;
    };
    Some(mime.to_string())
}
