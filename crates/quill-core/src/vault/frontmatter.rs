//! YAML front matter splitting and re-assembly.
//!
//! Documents open with a `---` delimited YAML block followed by a free-text
//! body. Rewrites go through [`compose`] so the body survives byte-for-byte.

use anyhow::{anyhow, Result};

/// A document split into its YAML front matter and body.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    /// Parsed front matter mapping. Empty when the document has none.
    pub front_matter: serde_yaml::Mapping,
    /// Everything after the closing `---`, unmodified.
    pub body: String,
}

impl ParsedDocument {
    /// Look up a top-level front matter key.
    pub fn get(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.front_matter
            .get(serde_yaml::Value::String(key.to_string()))
    }
}

/// Split raw content into `(yaml_block, body)` without parsing.
///
/// Returns `None` for the YAML block when the document does not start with
/// a `---` line.
pub fn split(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix("---") else {
        return (None, content);
    };
    // The opening fence must be a full line.
    let Some(rest) = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) else {
        return (None, content);
    };

    if let Some(end) = rest.find("\n---") {
        let yaml = &rest[..end];
        let after = &rest[end + 4..];
        let body = after.strip_prefix('\n').unwrap_or(after);
        (Some(yaml), body)
    } else {
        (None, content)
    }
}

/// Parse a document into front matter and body.
pub fn parse(content: &str) -> Result<ParsedDocument> {
    let (yaml, body) = split(content);
    let front_matter = match yaml {
        Some(block) if !block.trim().is_empty() => match serde_yaml::from_str(block)? {
            serde_yaml::Value::Mapping(m) => m,
            other => {
                return Err(anyhow!(
                    "front matter is not a mapping (found {})",
                    yaml_kind(&other)
                ))
            }
        },
        _ => serde_yaml::Mapping::new(),
    };

    Ok(ParsedDocument {
        front_matter,
        body: body.to_string(),
    })
}

/// Re-assemble a document from front matter and body.
///
/// The body is appended verbatim; callers that parsed with [`parse`] get
/// their original body bytes back.
pub fn compose(front_matter: &serde_yaml::Mapping, body: &str) -> Result<String> {
    if front_matter.is_empty() {
        return Ok(body.to_string());
    }
    let yaml = serde_yaml::to_string(front_matter)?;
    Ok(format!("---\n{}---\n{}", yaml, body))
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "bool",
        serde_yaml::Value::Number(_) => "number",
        serde_yaml::Value::String(_) => "string",
        serde_yaml::Value::Sequence(_) => "sequence",
        serde_yaml::Value::Mapping(_) => "mapping",
        serde_yaml::Value::Tagged(_) => "tagged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_front_matter_and_body() {
        let doc = "---\nname: helper\nmodel: sonnet\n---\n# Title\n\nBody text.\n";
        let parsed = parse(doc).unwrap();
        assert_eq!(
            parsed.get("name").and_then(|v| v.as_str()),
            Some("helper")
        );
        assert_eq!(parsed.body, "# Title\n\nBody text.\n");
    }

    #[test]
    fn document_without_front_matter() {
        let doc = "# Just a note\n";
        let parsed = parse(doc).unwrap();
        assert!(parsed.front_matter.is_empty());
        assert_eq!(parsed.body, doc);
    }

    #[test]
    fn body_survives_round_trip() {
        let doc = "---\nagents:\n- agent: agents/reflect\n  status: pending\n---\n# Daily\n\n- [ ] task one\n\t- weird\tindentation kept\n";
        let parsed = parse(doc).unwrap();
        let rebuilt = compose(&parsed.front_matter, &parsed.body).unwrap();
        let reparsed = parse(&rebuilt).unwrap();
        assert_eq!(reparsed.body, parsed.body);
    }

    #[test]
    fn rejects_non_mapping_front_matter() {
        let doc = "---\n- one\n- two\n---\nbody\n";
        assert!(parse(doc).is_err());
    }

    #[test]
    fn unterminated_fence_is_body() {
        let doc = "---\nname: oops\nno closing fence";
        let parsed = parse(doc).unwrap();
        assert!(parsed.front_matter.is_empty());
        assert_eq!(parsed.body, doc);
    }
}
