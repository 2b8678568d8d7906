//! Line diff stored alongside tag snapshots.

use similar::{ChangeTag, TextDiff};

/// Unified-style line diff from `before` to `after`: unchanged lines are prefixed with
/// two spaces, removed lines with `- ` and added lines with `+ `. Returns `None` when the
/// texts have the same lines.
pub fn line_diff(before: &str, after: &str) -> Option<String> {
    let old: Vec<&str> = before.lines().collect();
    let new: Vec<&str> = after.lines().collect();
    if old == new {
        return None;
    }

    let diff = TextDiff::from_slices(&old, &new);
    let lines: Vec<String> = diff
        .iter_all_changes()
        .map(|change| {
            let prefix = match change.tag() {
                ChangeTag::Equal => "  ",
                ChangeTag::Delete => "- ",
                ChangeTag::Insert => "+ ",
            };
            format!("{prefix}{}", change.value())
        })
        .collect();

    Some(lines.join("\n"))
}
