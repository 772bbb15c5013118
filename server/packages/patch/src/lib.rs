//! Unified-diff hunk parsing and application.
//!
//! Content is modelled as the `\n`-separated sequence of lines, so a trailing
//! newline shows up as a final empty line. A `\r` before the `\n` stays part
//! of its line: CRLF files keep their endings and matching ignores trailing
//! whitespace. Diffs produced by [`unified_diff`] follow the same model and
//! therefore always round-trip through [`apply_hunks`].

mod diff;
mod operation;

pub use diff::{unified_diff, UnifiedDiff};
pub use operation::{PatchKind, PatchOperation};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("invalid hunk header: {header}")]
    InvalidHeader { header: String },
    #[error("diff contains no hunks")]
    NoHunks,
    #[error("diff is required for {kind}")]
    MissingDiff { kind: &'static str },
    #[error("hunk {hunk} starts at line {start} but the file has {len} lines")]
    OutOfRange {
        hunk: usize,
        start: usize,
        len: usize,
    },
    #[error("hunk {hunk} overlaps the previous hunk")]
    Overlap { hunk: usize },
    #[error("hunk {hunk} does not match line {line}: expected {expected:?}, found {found:?}")]
    Mismatch {
        hunk: usize,
        line: usize,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: Option<usize>,
    pub new_start: usize,
    pub new_len: Option<usize>,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// First original line (1-based) the hunk touches. A zero-length old
    /// range names the line *after which* the insertion happens.
    fn anchor(&self) -> usize {
        match self.old_len {
            Some(0) => self.old_start.saturating_add(1),
            _ => self.old_start.max(1),
        }
    }
}

pub(crate) fn split_lines(text: &str) -> Vec<&str> {
    text.split('\n').collect()
}

fn parse_header(header: &str) -> Option<(usize, Option<usize>, usize, Option<usize>)> {
    let rest = header.strip_prefix("@@")?.trim_start();
    let (ranges, _) = rest.split_once("@@")?;
    let mut parts = ranges.split_whitespace();
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    if parts.next().is_some() {
        return None;
    }
    let range = |value: &str| -> Option<(usize, Option<usize>)> {
        match value.split_once(',') {
            Some((start, len)) => Some((start.parse().ok()?, Some(len.parse().ok()?))),
            None => Some((value.parse().ok()?, None)),
        }
    };
    let (old_start, old_len) = range(old)?;
    let (new_start, new_len) = range(new)?;
    Some((old_start, old_len, new_start, new_len))
}

fn is_metadata(line: &str) -> bool {
    line.starts_with("\\ No newline at end of file")
        || line.starts_with("diff --git ")
        || line.starts_with("index ")
        || line.starts_with("--- ")
        || line.starts_with("+++ ")
}

/// Parses every `@@` hunk in `diff`. Text before the first header is ignored;
/// lines inside a hunk without a recognised prefix count as context.
pub fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut lines = split_lines(diff);
    if diff.ends_with('\n') {
        lines.pop();
    }

    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;
    for line in lines {
        if line.starts_with("@@") {
            let (old_start, old_len, new_start, new_len) =
                parse_header(line).ok_or_else(|| PatchError::InvalidHeader {
                    header: line.to_string(),
                })?;
            if let Some(hunk) = current.take() {
                hunks.push(hunk);
            }
            current = Some(Hunk {
                old_start,
                old_len,
                new_start,
                new_len,
                lines: Vec::new(),
            });
            continue;
        }
        let Some(hunk) = current.as_mut() else {
            continue;
        };
        if is_metadata(line) {
            continue;
        }
        let parsed = if let Some(text) = line.strip_prefix('+') {
            HunkLine::Add(text.to_string())
        } else if let Some(text) = line.strip_prefix('-') {
            HunkLine::Remove(text.to_string())
        } else if let Some(text) = line.strip_prefix(' ') {
            HunkLine::Context(text.to_string())
        } else {
            HunkLine::Context(line.to_string())
        };
        hunk.lines.push(parsed);
    }
    if let Some(hunk) = current {
        hunks.push(hunk);
    }
    Ok(hunks)
}

fn same_line(expected: &str, found: &str) -> bool {
    expected.trim_end() == found.trim_end()
}

/// Applies `hunks` in order to `original`, copying untouched lines through.
/// Fails without producing output if any context or removal line disagrees
/// with the original.
pub fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let src = split_lines(original);
    let mut out: Vec<&str> = Vec::with_capacity(src.len());
    let mut cursor = 1usize;

    for (index, hunk) in hunks.iter().enumerate() {
        let number = index + 1;
        let start = hunk.anchor();
        if start < cursor {
            return Err(PatchError::Overlap { hunk: number });
        }
        if start > src.len() + 1 {
            return Err(PatchError::OutOfRange {
                hunk: number,
                start,
                len: src.len(),
            });
        }
        out.extend_from_slice(&src[cursor - 1..start - 1]);

        let mut pos = start - 1;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(text) | HunkLine::Remove(text) => {
                    let found = src.get(pos).copied();
                    match found {
                        Some(found) if same_line(text, found) => {}
                        _ => {
                            return Err(PatchError::Mismatch {
                                hunk: number,
                                line: pos + 1,
                                expected: text.clone(),
                                found: found.unwrap_or_default().to_string(),
                            })
                        }
                    }
                    if let (HunkLine::Context(_), Some(found)) = (line, found) {
                        out.push(found);
                    }
                    pos += 1;
                }
                HunkLine::Add(text) => out.push(text.as_str()),
            }
        }
        cursor = pos + 1;
    }

    if cursor <= src.len() {
        out.extend_from_slice(&src[cursor - 1..]);
    }
    Ok(out.join("\n"))
}

/// Content for a new file: the hunks applied to an empty file, or every
/// `+`-prefixed line taken literally when the diff has no parsable hunk.
pub fn create_content(diff: &str) -> Result<String, PatchError> {
    let hunks = parse_hunks(diff)?;
    if !hunks.is_empty() {
        return apply_hunks("", &hunks);
    }
    let added: Vec<&str> = split_lines(diff)
        .into_iter()
        .filter(|line| !line.starts_with("+++"))
        .filter_map(|line| line.strip_prefix('+'))
        .collect();
    Ok(added.join("\n"))
}

pub fn update_content(original: &str, diff: &str) -> Result<String, PatchError> {
    let hunks = parse_hunks(diff)?;
    if hunks.is_empty() {
        return Err(PatchError::NoHunks);
    }
    apply_hunks(original, &hunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_with_and_without_lengths() {
        let hunks = parse_hunks("@@ -3 +3,2 @@\n-a\n+b\n+c\n").unwrap();
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].old_start, 3);
        assert_eq!(hunks[0].old_len, None);
        assert_eq!(hunks[0].new_len, Some(2));
        assert_eq!(
            hunks[0].lines,
            vec![
                HunkLine::Remove("a".into()),
                HunkLine::Add("b".into()),
                HunkLine::Add("c".into())
            ]
        );
    }

    #[test]
    fn rejects_malformed_header() {
        let err = parse_hunks("@@ -x +1 @@\n+a").unwrap_err();
        assert!(matches!(err, PatchError::InvalidHeader { .. }));
    }

    #[test]
    fn skips_git_metadata_and_no_newline_marker() {
        let diff = "diff --git a/f b/f\nindex 1..2\n--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n\\ No newline at end of file\n+new\n";
        let hunks = parse_hunks(diff).unwrap();
        assert_eq!(
            hunks[0].lines,
            vec![HunkLine::Remove("old".into()), HunkLine::Add("new".into())]
        );
    }

    #[test]
    fn applies_hunks_and_keeps_trailing_lines() {
        let original = "one\ntwo\nthree\nfour\nfive\n";
        let diff = "@@ -2,2 +2,2 @@\n two\n-three\n+THREE\n";
        let next = update_content(original, diff).unwrap();
        assert_eq!(next, "one\ntwo\nTHREE\nfour\nfive\n");
    }

    #[test]
    fn applies_multiple_hunks_in_order() {
        let original = "a\nb\nc\nd\ne\nf\n";
        let diff = "@@ -1,1 +1,1 @@\n-a\n+A\n@@ -5,1 +5,2 @@\n e\n+E2\n";
        assert_eq!(
            update_content(original, diff).unwrap(),
            "A\nb\nc\nd\ne\nE2\nf\n"
        );
    }

    #[test]
    fn mismatched_context_fails() {
        let err = update_content("a\nb\n", "@@ -1,1 +1,1 @@\n-z\n+y\n").unwrap_err();
        assert!(matches!(err, PatchError::Mismatch { line: 1, .. }));
    }

    #[test]
    fn out_of_range_and_overlap_fail() {
        let err = update_content("a\n", "@@ -9,1 +9,1 @@\n-a\n+b\n").unwrap_err();
        assert!(matches!(err, PatchError::OutOfRange { start: 9, .. }));

        let err = update_content("a\nb\nc\n", "@@ -2,1 +2,1 @@\n-b\n+B\n@@ -1,1 +1,1 @@\n-a\n+A\n")
            .unwrap_err();
        assert_eq!(err, PatchError::Overlap { hunk: 2 });
    }

    #[test]
    fn zero_length_old_range_inserts_after_line() {
        let next = update_content("a\nb\n", "@@ -1,0 +2,1 @@\n+inserted\n").unwrap();
        assert_eq!(next, "a\ninserted\nb\n");
    }

    #[test]
    fn update_without_hunks_fails() {
        assert_eq!(update_content("a", "+b\n"), Err(PatchError::NoHunks));
    }

    #[test]
    fn create_falls_back_to_added_lines() {
        let content = create_content("+++ b/new.txt\n+hello\n+world").unwrap();
        assert_eq!(content, "hello\nworld");
    }

    #[test]
    fn create_applies_hunks_to_empty_file() {
        let content = create_content("@@ -0,0 +1,2 @@\n+hello\n+world\n").unwrap();
        assert_eq!(content, "hello\nworld\n");
    }

    #[test]
    fn crlf_endings_are_kept() {
        let next = update_content("a\r\nb\r\n", "@@ -1,2 +1,2 @@\r\n a\r\n-b\r\n+c\r\n").unwrap();
        assert_eq!(next, "a\r\nc\r\n");

        // Context written without the CR still matches and keeps the file's endings.
        let next = update_content("a\r\nb\r\nc\r\n", "@@ -1,2 +1,2 @@\n a\n-b\n+B\r\n").unwrap();
        assert_eq!(next, "a\r\nB\r\nc\r\n");
    }

    #[test]
    fn huge_hunk_start_is_out_of_range() {
        let diff = format!("@@ -{},0 +1,1 @@\n+x\n", usize::MAX);
        let err = update_content("a\n", &diff).unwrap_err();
        assert!(matches!(err, PatchError::OutOfRange { .. }));
    }
}
