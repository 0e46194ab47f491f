//! Session file syntax.
//!
//! One text file per session: a `---` delimited block of simple key/value
//! pairs, then a heading, then `## Conversation` followed by message
//! blocks of the exact form
//!
//! ```text
//! ### User | 2026-08-02T10:15:00Z
//!
//! message content
//!
//! ```
//!
//! The format is hand-parsed rather than YAML: legacy files contain
//! unquoted free text in `title`, and the value grammar here is only
//! scalars plus one inline-JSON `context` key.

use std::path::Path;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use super::record::{normalize_upstream_handle, Message, Role, Session, SessionKey};

static MESSAGE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^### (User|Assistant|System) \| (\S+)[ \t]*$").expect("valid header regex")
});

/// Cheap message count for index building: counts headers without
/// materializing messages.
pub fn count_messages(content: &str) -> usize {
    MESSAGE_HEADER.find_iter(content).count()
}

/// Render a session to its on-disk form.
pub fn format_session(session: &Session) -> String {
    let mut out = String::new();

    out.push_str("---\n");
    push_kv(&mut out, "session_id", &session.id);
    push_kv(&mut out, "session_key", &session.key.encode());
    push_kv(&mut out, "agent", &session.agent_path);
    push_kv(&mut out, "agent_name", &session.agent_name);
    if let Some(title) = &session.title {
        out.push_str(&format!("title: \"{}\"\n", title.replace('"', "'")));
    }
    push_kv(&mut out, "type", "chat");
    push_kv(&mut out, "created_at", &session.created_at.to_rfc3339());
    push_kv(&mut out, "last_accessed", &session.last_accessed.to_rfc3339());
    // Empty string encodes an absent handle.
    push_kv(
        &mut out,
        "sdk_session_id",
        session.upstream_session_id.as_deref().unwrap_or(""),
    );
    push_kv(&mut out, "archived", if session.archived { "true" } else { "false" });
    if let Some(context) = &session.context {
        push_kv(&mut out, "context", &context.to_string());
    }
    out.push_str("---\n\n");

    out.push_str(&format!("# {} Session\n\n", session.agent_name));
    if let Some(doc) = session
        .context
        .as_ref()
        .and_then(|c| c.get("documentPath"))
        .and_then(|v| v.as_str())
    {
        out.push_str(&format!("> Context: {}\n\n", doc));
    }
    out.push_str("## Conversation\n\n");

    for message in &session.messages {
        out.push_str(&format!(
            "### {} | {}\n\n{}\n\n",
            message.role.header_name(),
            message.timestamp.to_rfc3339(),
            message.content
        ));
    }

    out
}

/// Parse a session file back into a [`Session`].
pub fn parse_session(content: &str, file_path: &Path) -> Result<Session> {
    let (front, body) = split_front_matter(content)
        .ok_or_else(|| anyhow!("session file has no front matter: {}", file_path.display()))?;

    let get = |key: &str| front_value(front, key);

    let id = get("session_id")
        .ok_or_else(|| anyhow!("session file missing session_id: {}", file_path.display()))?;
    let agent_path = get("agent")
        .ok_or_else(|| anyhow!("session file missing agent: {}", file_path.display()))?;
    let agent_name = get("agent_name").unwrap_or_else(|| agent_path.clone());

    let key = get("session_key")
        .and_then(|k| SessionKey::decode(&k))
        .unwrap_or_else(|| {
            SessionKey::new(agent_path.clone(), SessionKey::DEFAULT_DISCRIMINATOR)
        });

    let created_at = get("created_at")
        .and_then(|s| parse_timestamp(&s))
        .unwrap_or_else(Utc::now);
    let last_accessed = get("last_accessed")
        .and_then(|s| parse_timestamp(&s))
        .unwrap_or(created_at);

    let upstream_session_id = normalize_upstream_handle(get("sdk_session_id").as_deref());
    let archived = get("archived").map(|v| v == "true").unwrap_or(false);
    let context = get("context").and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(Session {
        id,
        key,
        agent_path,
        agent_name,
        title: get("title"),
        messages: parse_messages(body)?,
        upstream_session_id,
        created_at,
        last_accessed,
        archived,
        context,
        file_path: file_path.to_path_buf(),
    })
}

/// Parse only the message blocks of a session body.
pub fn parse_messages(body: &str) -> Result<Vec<Message>> {
    let headers: Vec<_> = MESSAGE_HEADER.captures_iter(body).collect();
    let mut messages = Vec::with_capacity(headers.len());

    for (idx, caps) in headers.iter().enumerate() {
        let whole = caps.get(0).expect("match");
        let role = Role::from_header_name(&caps[1])
            .ok_or_else(|| anyhow!("unknown message role: {}", &caps[1]))?;
        let timestamp = parse_timestamp(&caps[2])
            .ok_or_else(|| anyhow!("unparseable message timestamp: {}", &caps[2]))?;

        let content_start = whole.end();
        let content_end = headers
            .get(idx + 1)
            .map(|next| next.get(0).expect("match").start())
            .unwrap_or(body.len());
        let content = body[content_start..content_end]
            .trim_matches('\n')
            .to_string();

        messages.push(Message {
            role,
            content,
            timestamp,
        });
    }

    Ok(messages)
}

/// Accepts RFC-3339 with or without fractional seconds, and naive
/// timestamps from legacy files (treated as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---\n")?;
    let end = rest.find("\n---")?;
    let front = &rest[..end];
    let body = &rest[end + 4..];
    Some((front, body.strip_prefix('\n').unwrap_or(body)))
}

/// Look up a `key: value` line, stripping optional single or double
/// quotes around the value.
fn front_value(front: &str, key: &str) -> Option<String> {
    for line in front.lines() {
        let Some((k, v)) = line.split_once(':') else {
            continue;
        };
        if k.trim() != key {
            continue;
        }
        let v = v.trim();
        let v = v
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
            .unwrap_or(v);
        if v.is_empty() {
            return None;
        }
        return Some(v.to_string());
    }
    None
}

fn push_kv(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push_str(": ");
    out.push_str(value);
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_session() -> Session {
        let mut session = Session {
            id: "11111111-2222-3333-4444-555555555555".to_string(),
            key: SessionKey::new("agents/helper.md", "s1"),
            agent_path: "agents/helper.md".to_string(),
            agent_name: "helper".to_string(),
            title: Some("Greeting".to_string()),
            messages: Vec::new(),
            upstream_session_id: Some("sess_upstream".to_string()),
            created_at: "2026-08-02T10:00:00Z".parse().unwrap(),
            last_accessed: "2026-08-02T10:05:00Z".parse().unwrap(),
            archived: false,
            context: Some(serde_json::json!({"documentPath": "daily/today.md"})),
            file_path: PathBuf::from("/tmp/session.txt"),
        };
        session.messages.push(Message {
            role: Role::User,
            content: "Hello\n\nwith a blank line".to_string(),
            timestamp: "2026-08-02T10:00:01Z".parse().unwrap(),
        });
        session.messages.push(Message {
            role: Role::Assistant,
            content: "Hi there!".to_string(),
            timestamp: "2026-08-02T10:00:03.250Z".parse().unwrap(),
        });
        session
    }

    #[test]
    fn round_trip_preserves_identity_and_messages() {
        let session = sample_session();
        let formatted = format_session(&session);
        let parsed = parse_session(&formatted, &session.file_path).unwrap();

        assert_eq!(parsed.id, session.id);
        assert_eq!(parsed.key, session.key);
        assert_eq!(parsed.title.as_deref(), Some("Greeting"));
        assert_eq!(parsed.upstream_session_id.as_deref(), Some("sess_upstream"));
        assert_eq!(parsed.messages.len(), 2);
        assert_eq!(parsed.messages[0].content, "Hello\n\nwith a blank line");
        assert_eq!(parsed.messages[1].content, "Hi there!");
        assert_eq!(parsed.messages[1].timestamp, session.messages[1].timestamp);
    }

    #[test]
    fn empty_handle_encodes_absent() {
        let mut session = sample_session();
        session.upstream_session_id = None;
        let formatted = format_session(&session);
        assert!(formatted.contains("sdk_session_id: \n"));
        let parsed = parse_session(&formatted, &session.file_path).unwrap();
        assert_eq!(parsed.upstream_session_id, None);
    }

    #[test]
    fn corrupt_handle_normalizes_to_absent_on_read() {
        let raw = "---\nsession_id: abc\nsession_key: agents/helper.md#default\nagent: agents/helper.md\nagent_name: helper\ntype: chat\ncreated_at: 2026-08-02T10:00:00Z\nlast_accessed: 2026-08-02T10:00:00Z\nsdk_session_id: \"[object Object]\"\narchived: false\n---\n\n# helper Session\n\n## Conversation\n\n";
        let parsed = parse_session(raw, Path::new("/tmp/x.txt")).unwrap();
        assert_eq!(parsed.upstream_session_id, None);

        // The next write encodes the absence as an empty string.
        let rewritten = format_session(&parsed);
        assert!(rewritten.contains("sdk_session_id: \n"));
    }

    #[test]
    fn timestamps_accept_optional_fractional_seconds() {
        assert!(parse_timestamp("2026-08-02T10:00:00Z").is_some());
        assert!(parse_timestamp("2026-08-02T10:00:00.123456Z").is_some());
        assert!(parse_timestamp("2026-08-02T10:00:00").is_some());
        assert!(parse_timestamp("2026-08-02T10:00:00.5").is_some());
        assert!(parse_timestamp("not-a-time").is_none());
    }

    #[test]
    fn count_messages_matches_parse() {
        let session = sample_session();
        let formatted = format_session(&session);
        assert_eq!(count_messages(&formatted), 2);
    }

    #[test]
    fn message_content_containing_heading_like_lines() {
        let mut session = sample_session();
        session.messages[0].content = "## Conversation\nnot a real header\n#### deeper".to_string();
        let formatted = format_session(&session);
        let parsed = parse_session(&formatted, &session.file_path).unwrap();
        assert_eq!(parsed.messages.len(), 2);
        assert!(parsed.messages[0].content.contains("not a real header"));
    }
}
