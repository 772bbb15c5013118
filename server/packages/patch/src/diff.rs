use similar::{capture_diff_slices, group_diff_ops, Algorithm, DiffTag};

use crate::split_lines;

const CONTEXT_LINES: usize = 3;

/// A generated diff together with its changed-line counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedDiff {
    pub text: String,
    pub added: usize,
    pub removed: usize,
}

impl UnifiedDiff {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Minimal line diff from `old` to `new` with three lines of context.
pub fn unified_diff(old: &str, new: &str) -> UnifiedDiff {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    let ops = capture_diff_slices(Algorithm::Myers, &old_lines, &new_lines);

    let mut text = String::new();
    let mut added = 0;
    let mut removed = 0;
    for group in group_diff_ops(ops, CONTEXT_LINES) {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old_start = first.old_range().start;
        let old_len = last.old_range().end - old_start;
        let new_start = first.new_range().start;
        let new_len = last.new_range().end - new_start;
        let header_start = |start: usize, len: usize| if len == 0 { start } else { start + 1 };
        text.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            header_start(old_start, old_len),
            old_len,
            header_start(new_start, new_len),
            new_len
        ));

        for op in &group {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => {
                    for line in &old_lines[old_range] {
                        text.push(' ');
                        text.push_str(line);
                        text.push('\n');
                    }
                }
                DiffTag::Delete | DiffTag::Insert | DiffTag::Replace => {
                    for line in &old_lines[old_range] {
                        text.push('-');
                        text.push_str(line);
                        text.push('\n');
                        removed += 1;
                    }
                    for line in &new_lines[new_range] {
                        text.push('+');
                        text.push_str(line);
                        text.push('\n');
                        added += 1;
                    }
                }
            }
        }
    }

    UnifiedDiff {
        text,
        added,
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update_content;

    #[test]
    fn identical_content_produces_empty_diff() {
        let diff = unified_diff("same\n", "same\n");
        assert!(diff.is_empty());
        assert!(diff.text.is_empty());
    }

    #[test]
    fn round_trips_through_apply() {
        let cases = [
            ("", "fresh\ncontent\n"),
            ("a\nb\nc\n", "a\nB\nc\n"),
            ("1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n", "0\n1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n11\n"),
            ("no trailing newline", "no trailing newline\n"),
            ("keep\nremove me\nkeep\n", "keep\nkeep\n"),
        ];
        for (old, new) in cases {
            let diff = unified_diff(old, new);
            assert_eq!(update_content(old, &diff.text).unwrap(), new, "{old:?} -> {new:?}");
        }
    }

    #[test]
    fn crlf_content_round_trips_exactly() {
        let cases = [
            ("a\r\nb\r\n", "a\r\nB\r\n"),
            ("a\nb\n", "a\r\nb\r\n"),
            ("a\r\nb\r\n", "a\nb\n"),
            ("mixed\r\nlf\nend", "mixed\r\nLF\nend"),
        ];
        for (old, new) in cases {
            let diff = unified_diff(old, new);
            assert!(!diff.is_empty(), "{old:?} -> {new:?}");
            assert_eq!(update_content(old, &diff.text).unwrap(), new, "{old:?} -> {new:?}");
        }
    }

    #[test]
    fn counts_changed_lines_only() {
        let diff = unified_diff("foo\nx\nfoo\n", "bar\nx\nbar\n");
        assert_eq!(diff.added, 2);
        assert_eq!(diff.removed, 2);
        assert!(diff.text.starts_with("@@ -1,"));
    }
}
