//! Compiled ignore/include regex sets deciding whether a path is
//! considered by the engine. Grounded in `model/base_tree.py`'s
//! `ignore()` method and its two built-in ignore patterns, rendered here
//! with `regex::RegexSet` rather than gitignore-glob matching, since the
//! CLI surface takes plain regex-per-line files (`--ignore-regexes`,
//! `--include-regexes`), not `.gitignore` syntax.

use anyhow::{Context, Result};
use regex::RegexSet;
use std::path::Path;

/// Patterns always active regardless of user configuration, matching the
/// remote client's own temporary-artifact naming.
pub const BUILTIN_IGNORE_PATTERNS: &[&str] = &[r".*\.com-apple-bird.*", r".*\.DS_Store"];

pub struct FilterSet {
    ignore: RegexSet,
    include: RegexSet,
    include_is_empty: bool,
}

impl FilterSet {
    pub fn new(ignore_patterns: &[String], include_patterns: &[String]) -> Result<Self> {
        let mut ignore_all: Vec<&str> = BUILTIN_IGNORE_PATTERNS.to_vec();
        ignore_all.extend(ignore_patterns.iter().map(String::as_str));
        let ignore = RegexSet::new(ignore_all).context("compiling ignore regex set")?;
        let include_is_empty = include_patterns.is_empty();
        let include = RegexSet::new(include_patterns).context("compiling include regex set")?;
        Ok(Self { ignore, include, include_is_empty })
    }

    pub fn empty() -> Self {
        Self::new(&[], &[]).expect("builtin patterns always compile")
    }

    /// Load patterns from a file, one regex per line; lines starting with
    /// `#` are comments. Missing files are treated as an empty list.
    pub fn load_pattern_file(path: &Path) -> Result<Vec<String>> {
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading pattern file {}", path.display()))?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }

    /// Precedence: any ignore match wins; otherwise, an empty include set
    /// means nothing else is excluded; otherwise an include match keeps
    /// the path; otherwise (a non-empty include set matched by nothing)
    /// the path is excluded.
    pub fn ignore(&self, path: &str) -> bool {
        if self.ignore.is_match(path) {
            return true;
        }
        if self.include_is_empty {
            return false;
        }
        !self.include.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_patterns_are_always_ignored() {
        let f = FilterSet::empty();
        assert!(f.ignore("a/.DS_Store"));
        assert!(f.ignore("a/foo.com-apple-bird.plist"));
        assert!(!f.ignore("a/b.txt"));
    }

    #[test]
    fn empty_include_set_excludes_nothing_extra() {
        let f = FilterSet::new(&["^secrets/.*".to_string()], &[]).unwrap();
        assert!(f.ignore("secrets/key.pem"));
        assert!(!f.ignore("docs/readme.md"));
    }

    #[test]
    fn non_empty_include_set_excludes_everything_not_matched() {
        let f = FilterSet::new(&[], &[r"^docs/.*".to_string()]).unwrap();
        assert!(!f.ignore("docs/readme.md"));
        assert!(f.ignore("src/main.rs"));
    }

    #[test]
    fn ignore_takes_precedence_over_include() {
        let f = FilterSet::new(&[r"^docs/secret\.md$".to_string()], &[r"^docs/.*".to_string()]).unwrap();
        assert!(f.ignore("docs/secret.md"));
        assert!(!f.ignore("docs/readme.md"));
    }

    #[test]
    fn pattern_file_skips_comments_and_blank_lines() {
        let dir = std::env::temp_dir().join(format!("icloudds-filters-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("ignore.txt");
        std::fs::write(&file, "# comment\n\n^build/.*\n").unwrap();
        let patterns = FilterSet::load_pattern_file(&file).unwrap();
        assert_eq!(patterns, vec!["^build/.*".to_string()]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_pattern_file_yields_empty_list() {
        let patterns = FilterSet::load_pattern_file(Path::new("/nonexistent/path.txt")).unwrap();
        assert!(patterns.is_empty());
    }
}
