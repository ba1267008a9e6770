//! Conversion between entry files on disk and replica state.
//!
//! An entry file is markdown with optional YAML frontmatter. The keys the
//! engine understands map onto [`FileMetadata`]; every other key is carried in
//! `extra` so it survives a round trip through the metadata replica.
//!
//! Links (`part_of`, `contents`, `attachments`) are written relative to the
//! file and stored workspace-relative.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde_yaml::Value;

use crate::crdt::FileMetadata;
use crate::error::Result;
use crate::frontmatter;
use crate::path_utils::{link_from_file, resolve_link};

const KNOWN_KEYS: &[&str] = &[
    "title",
    "part_of",
    "contents",
    "audience",
    "description",
    "attachments",
];

/// Parse an entry file at `path` into metadata and body.
///
/// `modified_at` is left at zero; the caller stamps it.
pub fn parse_entry(path: &str, content: &str) -> Result<(FileMetadata, String)> {
    let parsed = frontmatter::parse_or_empty(content)?;
    let fm = &parsed.frontmatter;

    let resolve_all = |links: Vec<String>| -> Vec<String> {
        links.iter().map(|l| resolve_link(path, l)).collect()
    };

    let mut metadata = FileMetadata {
        title: frontmatter::get_string(fm, "title").map(String::from),
        part_of: frontmatter::get_string(fm, "part_of").map(|l| resolve_link(path, l)),
        contents: frontmatter::get_optional_string_array(fm, "contents").map(resolve_all),
        audience: frontmatter::get_optional_string_array(fm, "audience"),
        description: frontmatter::get_string(fm, "description").map(String::from),
        attachments: resolve_all(frontmatter::get_string_array(fm, "attachments")),
        ..Default::default()
    };

    for (key, value) in fm {
        if KNOWN_KEYS.contains(&key.as_str()) {
            continue;
        }
        match serde_json::to_value(value) {
            Ok(json) => {
                metadata.extra.insert(key.clone(), json);
            }
            Err(e) => log::debug!("[DocumentState] Dropping property {} of {}: {}", key, path, e),
        }
    }

    Ok((metadata, parsed.body))
}

/// Render metadata and body back into entry file content for `path`.
pub fn render_entry(path: &str, metadata: &FileMetadata, body: &str) -> Result<String> {
    let mut fm: IndexMap<String, Value> = IndexMap::new();

    if let Some(title) = &metadata.title {
        fm.insert("title".into(), Value::String(title.clone()));
    }
    if let Some(part_of) = &metadata.part_of {
        fm.insert(
            "part_of".into(),
            Value::String(link_from_file(path, part_of)),
        );
    }
    if let Some(contents) = &metadata.contents {
        // An empty list still marks the file as an index
        fm.insert(
            "contents".into(),
            frontmatter::string_sequence(contents.iter().map(|c| link_from_file(path, c))),
        );
    }
    if let Some(audience) = &metadata.audience {
        // `[]` (explicitly untagged) differs from an absent key (inherit)
        fm.insert(
            "audience".into(),
            frontmatter::string_sequence(audience.iter().cloned()),
        );
    }
    if let Some(description) = &metadata.description {
        fm.insert("description".into(), Value::String(description.clone()));
    }
    if !metadata.attachments.is_empty() {
        fm.insert(
            "attachments".into(),
            frontmatter::string_sequence(
                metadata.attachments.iter().map(|a| link_from_file(path, a)),
            ),
        );
    }

    let mut extra: Vec<_> = metadata.extra.iter().collect();
    extra.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in extra {
        fm.insert(key.clone(), serde_yaml::to_value(value)?);
    }

    frontmatter::serialize(&fm, body)
}

/// Resolve the audience of `path`, following `part_of` links.
///
/// `lookup` returns `(audience, part_of)` for a path. Explicit tags win,
/// `Some([])` stops inheritance with no tags, `None` defers to the parent.
/// Cycles and dangling parents resolve to no tags.
pub fn effective_audience<F>(path: &str, lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<(Option<Vec<String>>, Option<String>)>,
{
    let mut seen = HashSet::new();
    let mut current = path.to_string();

    while seen.insert(current.clone()) {
        let Some((audience, part_of)) = lookup(&current) else {
            return Vec::new();
        };
        if let Some(tags) = audience {
            return tags;
        }
        match part_of {
            Some(parent) => current = parent,
            None => return Vec::new(),
        }
    }

    log::warn!("[DocumentState] part_of cycle while resolving audience of {}", path);
    Vec::new()
}
