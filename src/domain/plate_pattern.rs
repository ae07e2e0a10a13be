use crate::error::TollError;
use regex::{Regex, RegexBuilder};
use std::fmt;

/// Property-bag entry holding the plate regular expression.
pub const PLATE_PATTERN_PROPERTY: &str = "NumberPlateRegEx";

/// A compiled, case-insensitive number-plate pattern.
///
/// The plate string is the matched line rewritten with capture groups 1
/// and 2, so a pattern like `([A-Z]{3})[ -]?([0-9]{3})` turns `ABC-123`
/// into `ABC123`. Missing groups contribute nothing.
#[derive(Clone)]
pub struct PlatePattern {
    source: String,
    regex: Regex,
}

impl PlatePattern {
    pub fn new(source: &str) -> Result<Self, TollError> {
        let regex = RegexBuilder::new(source)
            .case_insensitive(true)
            .build()
            .map_err(|e| TollError::Config(format!("Invalid plate pattern '{}': {}", source, e)))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The plate string for `line`, if the pattern matches it.
    pub fn extract(&self, line: &str) -> Option<String> {
        if !self.regex.is_match(line) {
            return None;
        }
        Some(self.regex.replace_all(line, "${1}${2}").into_owned())
    }
}

impl fmt::Debug for PlatePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PlatePattern").field(&self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_joins_groups() {
        let pattern = PlatePattern::new(r"([A-Z]{3})[ -]?([0-9]{3})").unwrap();
        assert_eq!(pattern.extract("ABC-123").as_deref(), Some("ABC123"));
        assert_eq!(pattern.extract("abc 123").as_deref(), Some("abc123"));
        assert_eq!(pattern.extract("HELLO"), None);
    }

    #[test]
    fn test_extract_without_groups_yields_empty() {
        let pattern = PlatePattern::new(".*").unwrap();
        assert_eq!(pattern.extract("ANY").as_deref(), Some(""));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(PlatePattern::new("(["), Err(TollError::Config(_))));
    }
}
