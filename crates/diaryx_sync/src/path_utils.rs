//! Conversions between on-disk links and workspace-relative paths.
//!
//! `part_of` and `contents` are written relative to the file that holds them
//! (so they stay clickable in any markdown viewer) but stored workspace-relative
//! in the metadata replica (so they survive the file moving between devices).

use std::path::Path;

/// Directory part of a workspace-relative path (`""` for top-level files).
pub fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Extract the target from a link value.
///
/// Accepts a bare path, an angle-bracketed path (`<a b.md>`) or a markdown
/// link (`[Title](path.md)`).
pub fn link_target(link: &str) -> &str {
    let link = link.trim();
    if let Some(start) = link.find("](")
        && link.starts_with('[')
        && link.ends_with(')')
    {
        return link_target(&link[start + 2..link.len() - 1]);
    }
    link.strip_prefix('<')
        .and_then(|l| l.strip_suffix('>'))
        .unwrap_or(link)
}

/// Resolve a link found in `from_file` to a workspace-relative path.
///
/// A leading `/` means workspace root. `..` components that would climb out of
/// the workspace are dropped.
pub fn resolve_link(from_file: &str, link: &str) -> String {
    let target = link_target(link);
    let (base, target) = match target.strip_prefix('/') {
        Some(rooted) => ("", rooted),
        None => (parent_dir(from_file), target),
    };

    let mut parts: Vec<&str> = base.split('/').filter(|c| !c.is_empty()).collect();
    for component in target.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    parts.join("/")
}

/// Compute the link from `from_file` to the workspace-relative `target`.
///
/// # Example
/// ```
/// use diaryx_sync::path_utils::link_from_file;
///
/// assert_eq!(link_from_file("a/b/note.md", "a/index.md"), "../index.md");
/// assert_eq!(link_from_file("index.md", "2024/day1.md"), "2024/day1.md");
/// ```
pub fn link_from_file(from_file: &str, target: &str) -> String {
    let from_dir = Path::new(parent_dir(from_file));
    match pathdiff::diff_paths(Path::new(target), from_dir) {
        Some(rel) if !rel.as_os_str().is_empty() => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/"),
        _ => target.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_links() {
        assert_eq!(resolve_link("a/b/note.md", "../index.md"), "a/index.md");
        assert_eq!(resolve_link("a/index.md", "b/note.md"), "a/b/note.md");
        assert_eq!(resolve_link("index.md", "./day1.md"), "day1.md");
        assert_eq!(resolve_link("a/note.md", "/index.md"), "index.md");
        assert_eq!(resolve_link("note.md", "../../escape.md"), "escape.md");
    }

    #[test]
    fn test_resolve_markdown_links() {
        assert_eq!(resolve_link("a/note.md", "[Home](../index.md)"), "index.md");
        assert_eq!(resolve_link("a/note.md", "<my notes.md>"), "a/my notes.md");
    }

    #[test]
    fn test_link_from_file() {
        assert_eq!(link_from_file("a/b/c/note.md", "a/index.md"), "../../index.md");
        assert_eq!(link_from_file("a/index.md", "a/b/note.md"), "b/note.md");
        assert_eq!(link_from_file("a/x.md", "b/y.md"), "../b/y.md");
    }

    #[test]
    fn test_roundtrip() {
        for (from, target) in [
            ("2024/01/day.md", "2024/index.md"),
            ("index.md", "notes/ideas.md"),
            ("p/q/r.md", "s/t.md"),
        ] {
            assert_eq!(resolve_link(from, &link_from_file(from, target)), target);
        }
    }
}
