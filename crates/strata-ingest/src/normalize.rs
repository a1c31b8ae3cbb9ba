//! Transcript normalization: raw pasted text to role-tagged messages.
//!
//! The normalizer never fails. Whatever arrives (fenced paste, chat
//! transcript, email thread, or free prose) comes back as a
//! [`NormalizedTranscript`]; anything surprising lands in `warnings`
//! rather than an error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use strata_core::MessageRole;

/// Input shape recognized by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedFormat {
    /// Line-leading speaker labels (`User:`, `Assistant:`, aliases).
    ChatRoles,
    /// Quoted email thread split on reply headers.
    EmailThread,
    /// No recognizable structure; treated as one user message.
    Plain,
    /// Empty or whitespace-only input.
    Unknown,
}

impl DetectedFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectedFormat::ChatRoles => "chat_roles",
            DetectedFormat::EmailThread => "email_thread",
            DetectedFormat::Plain => "plain",
            DetectedFormat::Unknown => "unknown",
        }
    }
}

/// One message recovered from the raw text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub role: MessageRole,
    pub content: String,
    pub index_in_conversation: i32,
}

/// Output of normalization. Immutable once produced; the import
/// pipeline persists it verbatim so resumed jobs never re-parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTranscript {
    pub messages: Vec<NormalizedMessage>,
    pub detected_format: DetectedFormat,
    /// Role markers were present in the input.
    pub had_explicit_roles: bool,
    /// Marker aliases were mapped onto the canonical {user, assistant}.
    pub normalized_roles: bool,
    pub warnings: Vec<String>,
}

impl NormalizedTranscript {
    fn empty() -> Self {
        Self {
            messages: Vec::new(),
            detected_format: DetectedFormat::Unknown,
            had_explicit_roles: false,
            normalized_roles: false,
            warnings: vec!["empty_input".to_string()],
        }
    }
}

/// Map a recognized speaker label to its canonical role.
fn map_role(marker: &str) -> Option<MessageRole> {
    match marker.to_ascii_lowercase().as_str() {
        "user" | "human" | "me" => Some(MessageRole::User),
        "assistant" | "ai" | "bot" | "gpt" | "chatgpt" | "claude" | "gemini" => {
            Some(MessageRole::Assistant)
        }
        _ => None,
    }
}

fn role_marker_regex() -> Regex {
    Regex::new(r"(?i)^(user|human|me|assistant|ai|bot|gpt|chatgpt|claude|gemini)\s*:\s*(.*)$")
        .unwrap()
}

/// Strip one pair of enclosing code-fence lines. Pastes frequently
/// arrive wrapped in a Markdown fence; only the outermost pair is
/// removed, and only when both halves are present.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(first) = trimmed.lines().next() else {
        return trimmed;
    };
    if !first.trim_start().starts_with("```") {
        return trimmed;
    }

    // The closing half must be a bare fence on its own final line.
    let Some(rest) = trimmed.get(first.len()..) else {
        return trimmed;
    };
    let Some(last_newline) = rest.rfind('\n') else {
        return trimmed;
    };
    if rest[last_newline + 1..].trim() != "```" {
        return trimmed;
    }

    rest[..last_newline].trim()
}

/// Normalize a standard capture: chat transcript when role markers are
/// present, otherwise a single plain user message.
pub fn normalize(raw: &str) -> NormalizedTranscript {
    let text = strip_fence(raw);
    if text.is_empty() {
        return NormalizedTranscript::empty();
    }

    let marker = role_marker_regex();
    if text.lines().any(|line| marker.is_match(line.trim_start())) {
        return normalize_chat(text, &marker);
    }

    NormalizedTranscript {
        messages: vec![NormalizedMessage {
            role: MessageRole::User,
            content: text.to_string(),
            index_in_conversation: 0,
        }],
        detected_format: DetectedFormat::Plain,
        had_explicit_roles: false,
        normalized_roles: false,
        warnings: Vec::new(),
    }
}

fn normalize_chat(text: &str, marker: &Regex) -> NormalizedTranscript {
    let mut warnings = Vec::new();
    let mut segments: Vec<(MessageRole, Vec<&str>)> = Vec::new();
    let mut leading: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some(caps) = marker.captures(line.trim_start()) {
            // The alias table covers every alternative the regex
            // accepts, so this lookup cannot miss.
            if let Some(role) = map_role(&caps[1]) {
                segments.push((role, vec![caps.get(2).map_or("", |m| m.as_str())]));
                continue;
            }
        }
        match segments.last_mut() {
            Some((_, body)) => body.push(line),
            None => leading.push(line),
        }
    }

    let mut messages = Vec::new();
    let leading_text = leading.join("\n");
    if !leading_text.trim().is_empty() {
        warnings.push("unlabeled_leading_lines".to_string());
        messages.push(NormalizedMessage {
            role: MessageRole::User,
            content: leading_text.trim().to_string(),
            index_in_conversation: 0,
        });
    }

    for (role, body) in segments {
        let content = body.join("\n").trim().to_string();
        if content.is_empty() {
            continue;
        }
        messages.push(NormalizedMessage {
            role,
            content,
            index_in_conversation: messages.len() as i32,
        });
    }

    NormalizedTranscript {
        messages,
        detected_format: DetectedFormat::ChatRoles,
        had_explicit_roles: true,
        normalized_roles: true,
        warnings,
    }
}

fn thread_boundary_regex() -> Regex {
    Regex::new(r"(?i)^(on .+ wrote:|from:\s*\S.*)$").unwrap()
}

/// Normalize a quoted email thread: reply headers split the text into
/// sequential user messages, newest first as pasted. Falls back to the
/// plain path when no boundary is found.
pub fn normalize_email_thread(raw: &str) -> NormalizedTranscript {
    let text = strip_fence(raw);
    if text.is_empty() {
        return NormalizedTranscript::empty();
    }

    let boundary = thread_boundary_regex();
    let mut segments: Vec<Vec<&str>> = vec![Vec::new()];
    let mut saw_boundary = false;

    for line in text.lines() {
        if boundary.is_match(line.trim()) {
            saw_boundary = true;
            segments.push(Vec::new());
            continue;
        }
        // Safe: segments starts non-empty and only grows.
        segments.last_mut().unwrap().push(line);
    }

    if !saw_boundary {
        let mut transcript = normalize(text);
        transcript
            .warnings
            .push("no_thread_boundaries".to_string());
        return transcript;
    }

    let mut messages = Vec::new();
    for body in segments {
        let content = body.join("\n").trim().to_string();
        if content.is_empty() {
            continue;
        }
        messages.push(NormalizedMessage {
            role: MessageRole::User,
            content,
            index_in_conversation: messages.len() as i32,
        });
    }

    NormalizedTranscript {
        messages,
        detected_format: DetectedFormat::EmailThread,
        had_explicit_roles: false,
        normalized_roles: false,
        warnings: Vec::new(),
    }
}

/// Flag a transcript whose explicit roles collapsed onto one speaker.
/// Two or more messages all carrying the same role usually means the
/// paste lost half the conversation. Diagnostic only.
pub fn role_ambiguity(messages: &[NormalizedMessage]) -> Option<String> {
    if messages.len() < 2 {
        return None;
    }
    let first = messages[0].role;
    if messages.iter().all(|m| m.role == first) {
        Some(format!(
            "all {} messages share role '{}'",
            messages.len(),
            first.as_str()
        ))
    } else {
        None
    }
}
