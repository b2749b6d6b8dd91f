//! Commit filter expressions.
//!
//! A lane may declare a filter over the file paths a commit touches:
//!
//! - `ExcludeAllExcept: <glob>[;<glob>...]` — only commits touching a
//!   matching path are imported.
//! - `IncludeAllExcept: <glob>[;<glob>...]` — commits touching a matching
//!   path are excluded.
//!
//! Globs are anchored: `*` matches any run of characters, `?` one character.

use regex::Regex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterMode {
    ExcludeAllExcept,
    IncludeAllExcept,
}

/// A compiled commit filter.
#[derive(Debug, Clone)]
pub struct CommitFilter {
    mode: FilterMode,
    patterns: Vec<Regex>,
}

impl CommitFilter {
    /// Parse a lane's filter expression. Returns `None` for an empty
    /// expression, or for an unrecognized prefix (which includes all
    /// commits, with a warning, rather than failing the import).
    pub fn parse(expression: &str) -> Option<CommitFilter> {
        let expression = expression.trim();
        if expression.is_empty() {
            return None;
        }

        let (mode, globs) = if let Some(rest) = expression.strip_prefix("ExcludeAllExcept:") {
            (FilterMode::ExcludeAllExcept, rest)
        } else if let Some(rest) = expression.strip_prefix("IncludeAllExcept:") {
            (FilterMode::IncludeAllExcept, rest)
        } else {
            warn!(filter = %expression, "invalid commit filter, including all commits");
            return None;
        };

        let patterns = globs
            .split(';')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .filter_map(|g| match Regex::new(&glob_to_regex(g)) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(glob = %g, error = %err, "ignoring unparseable filter glob");
                    None
                }
            })
            .collect();

        Some(CommitFilter { mode, patterns })
    }

    /// Whether a commit touching `paths` should be skipped by the importer.
    pub fn excludes(&self, paths: &[String]) -> bool {
        let any_match = paths
            .iter()
            .any(|p| self.patterns.iter().any(|re| re.is_match(p)));

        match self.mode {
            // Only matching paths are imported.
            FilterMode::ExcludeAllExcept => !any_match,
            // Matching paths are excluded.
            FilterMode::IncludeAllExcept => any_match,
        }
    }
}

/// Compile a glob to an anchored regular expression.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_expression_is_no_filter() {
        assert!(CommitFilter::parse("").is_none());
        assert!(CommitFilter::parse("   ").is_none());
    }

    #[test]
    fn invalid_prefix_includes_all() {
        assert!(CommitFilter::parse("OnlyTheseFiles: *.c").is_none());
    }

    #[test]
    fn exclude_all_except_keeps_only_matches() {
        let f = CommitFilter::parse("ExcludeAllExcept: docs/*;*.md").unwrap();
        assert!(!f.excludes(&paths(&["docs/intro.txt"])));
        assert!(!f.excludes(&paths(&["README.md"])));
        assert!(f.excludes(&paths(&["src/main.c"])));
        // One matching path among several is enough.
        assert!(!f.excludes(&paths(&["src/main.c", "docs/intro.txt"])));
    }

    #[test]
    fn include_all_except_drops_matches() {
        let f = CommitFilter::parse("IncludeAllExcept: *.po").unwrap();
        assert!(f.excludes(&paths(&["po/de.po"])));
        assert!(!f.excludes(&paths(&["src/main.c"])));
    }

    #[test]
    fn globs_are_anchored() {
        let f = CommitFilter::parse("ExcludeAllExcept: *.md").unwrap();
        assert!(f.excludes(&paths(&["notes.md.bak"])));
        let q = CommitFilter::parse("ExcludeAllExcept: file?.txt").unwrap();
        assert!(!q.excludes(&paths(&["file1.txt"])));
        assert!(q.excludes(&paths(&["file12.txt"])));
    }
}
