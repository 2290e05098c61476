//! Builder-name matcher for jobs that never appear on the dashboard.

use regex::Regex;

use crate::errors::AppError;

/// Try jobs and housekeeping bots are excluded by default.
pub const DEFAULT_SKIP_PATTERNS: &[&str] = &[".*-Trybot", ".*Housekeeper.*"];

/// Matches builder names to leave out of the per-commit and per-builder maps.
///
/// Patterns are unanchored: a builder is skipped if any pattern matches
/// anywhere in its name.
#[derive(Debug, Clone, Default)]
pub struct BuilderFilter {
    patterns: Vec<Regex>,
}

impl BuilderFilter {
    /// Compile the given patterns.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, AppError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    AppError::Validation(format!("Invalid builder pattern {:?}: {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Filter with [`DEFAULT_SKIP_PATTERNS`].
    #[cfg(test)]
    pub fn with_defaults() -> Self {
        Self {
            patterns: DEFAULT_SKIP_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }

    pub fn skips(&self, builder: &str) -> bool {
        self.patterns.iter().any(|r| r.is_match(builder))
    }
}
