//! YAML frontmatter splitting and value helpers.
//!
//! Entries are markdown files that may start with a `---` delimited YAML
//! block. Files without a well-formed block are treated as all body.

use indexmap::IndexMap;
use serde_yaml::Value;

use crate::error::Result;

/// Result of splitting a markdown file.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    /// The parsed frontmatter as an ordered map.
    pub frontmatter: IndexMap<String, Value>,
    /// The body content after the frontmatter.
    pub body: String,
}

/// Byte ranges of the YAML block and the body, if the content has a
/// closed frontmatter block.
fn split(content: &str) -> Option<(&str, &str)> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;

    // Empty frontmatter: the closing delimiter follows immediately
    if let Some(body) = rest
        .strip_prefix("---\n")
        .or_else(|| rest.strip_prefix("---\r\n"))
    {
        return Some(("", body));
    }
    if rest == "---" {
        return Some(("", ""));
    }

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "---" && offset > 0 {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

/// Parse frontmatter and body, returning empty frontmatter if none exists.
///
/// A missing closing delimiter means the whole content is body.
pub fn parse_or_empty(content: &str) -> Result<ParsedFile> {
    let Some((yaml, body)) = split(content) else {
        return Ok(ParsedFile {
            frontmatter: IndexMap::new(),
            body: content.to_string(),
        });
    };

    let frontmatter: IndexMap<String, Value> = if yaml.trim().is_empty() {
        IndexMap::new()
    } else {
        serde_yaml::from_str(yaml)?
    };

    Ok(ParsedFile {
        frontmatter,
        body: body.to_string(),
    })
}

/// Serialize frontmatter and body back to markdown content.
///
/// Empty frontmatter produces the body alone.
pub fn serialize(frontmatter: &IndexMap<String, Value>, body: &str) -> Result<String> {
    if frontmatter.is_empty() {
        return Ok(body.to_string());
    }
    let yaml_str = serde_yaml::to_string(frontmatter)?;
    Ok(format!("---\n{}---\n{}", yaml_str, body))
}

/// Get a string property value.
pub fn get_string<'a>(frontmatter: &'a IndexMap<String, Value>, key: &str) -> Option<&'a str> {
    frontmatter.get(key).and_then(|v| v.as_str())
}

/// Get an array property as a Vec of strings.
///
/// A scalar string is treated as a one-element list.
pub fn get_string_array(frontmatter: &IndexMap<String, Value>, key: &str) -> Vec<String> {
    get_optional_string_array(frontmatter, key).unwrap_or_default()
}

/// Like [`get_string_array`], but distinguishes "absent or null" (`None`)
/// from an explicit empty list (`Some(vec![])`).
pub fn get_optional_string_array(
    frontmatter: &IndexMap<String, Value>,
    key: &str,
) -> Option<Vec<String>> {
    match frontmatter.get(key)? {
        Value::Null => None,
        Value::Sequence(seq) => Some(
            seq.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
        ),
        Value::String(s) => Some(vec![s.clone()]),
        _ => None,
    }
}

/// Build a YAML sequence of strings.
pub fn string_sequence<I, S>(items: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Value::Sequence(items.into_iter().map(|s| Value::String(s.into())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_frontmatter() {
        let content = "---\ntitle: Test\n---\n\nBody content";
        let parsed = parse_or_empty(content).unwrap();
        assert_eq!(get_string(&parsed.frontmatter, "title"), Some("Test"));
        assert_eq!(parsed.body, "\nBody content");
    }

    #[test]
    fn test_parse_closing_delimiter_at_eof() {
        let parsed = parse_or_empty("---\ntitle: Only\n---").unwrap();
        assert_eq!(get_string(&parsed.frontmatter, "title"), Some("Only"));
        assert_eq!(parsed.body, "");
    }

    #[test]
    fn test_parse_or_empty_without_block() {
        let parsed = parse_or_empty("Just body content").unwrap();
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.body, "Just body content");

        // Unclosed block is all body
        let content = "---\ntitle: x\nno close";
        assert_eq!(parse_or_empty(content).unwrap().body, content);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut fm = IndexMap::new();
        fm.insert("title".to_string(), Value::String("Test".to_string()));
        fm.insert("audience".to_string(), string_sequence(["family"]));
        let text = serialize(&fm, "Body\n").unwrap();
        assert!(text.starts_with("---\ntitle: Test\n"));

        let parsed = parse_or_empty(&text).unwrap();
        assert_eq!(parsed.frontmatter, fm);
        assert_eq!(parsed.body, "Body\n");

        assert_eq!(serialize(&IndexMap::new(), "plain").unwrap(), "plain");
    }

    #[test]
    fn test_optional_string_array() {
        let parsed =
            parse_or_empty("---\na: []\nb: null\nc: one\nd:\n  - x\n  - y\n---\n").unwrap();
        let fm = &parsed.frontmatter;
        assert_eq!(get_optional_string_array(fm, "a"), Some(vec![]));
        assert_eq!(get_optional_string_array(fm, "b"), None);
        assert_eq!(get_optional_string_array(fm, "c"), Some(vec!["one".into()]));
        assert_eq!(get_string_array(fm, "d"), vec!["x", "y"]);
        assert_eq!(get_optional_string_array(fm, "missing"), None);
    }
}
