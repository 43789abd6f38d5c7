//! Object name sanitization.
//!
//! Names are never hard-rejected for recoverable problems: control
//! characters are dropped, overlong names are truncated, and forbidden
//! trailing characters are trimmed.  Only a name that is empty after
//! sanitization fails.  Sanitizing an already-valid name returns it
//! unchanged, and sanitizing a sanitized name is a no-op.

use std::fmt;

use crate::config::NamingConfig;
use crate::errors::TransferError;

/// Longest owner id accepted as a storage namespace.
const MAX_OWNER_ID_LEN: usize = 128;

/// A problem found (and, except for `Empty`, repaired) in a raw name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameIssue {
    ControlCharacters { removed: usize },
    Truncated { from: usize, to: usize },
    TrailingTrimmed { removed: String },
    Empty,
}

impl fmt::Display for NameIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameIssue::ControlCharacters { removed } => {
                write!(f, "removed {removed} control character(s)")
            }
            NameIssue::Truncated { from, to } => {
                write!(f, "truncated from {from} to {to} characters")
            }
            NameIssue::TrailingTrimmed { removed } => {
                write!(f, "trimmed trailing '{removed}'")
            }
            NameIssue::Empty => write!(f, "name is empty"),
        }
    }
}

/// Result of sanitizing one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameValidation {
    pub valid: bool,
    pub sanitized_name: String,
    pub errors: Vec<NameIssue>,
}

#[derive(Debug, Clone)]
pub struct NameValidator {
    max_length: usize,
    forbidden_trailing: Vec<char>,
}

impl Default for NameValidator {
    fn default() -> Self {
        Self::from_config(&NamingConfig::default())
    }
}

impl NameValidator {
    pub fn new(max_length: usize, forbidden_trailing: impl IntoIterator<Item = char>) -> Self {
        Self {
            max_length: max_length.max(1),
            forbidden_trailing: forbidden_trailing.into_iter().collect(),
        }
    }

    pub fn from_config(config: &NamingConfig) -> Self {
        Self::new(config.max_length, config.forbidden_trailing.chars())
    }

    /// Sanitize `raw`, reporting every repair that was applied.
    pub fn sanitize(&self, raw: &str) -> NameValidation {
        let mut errors = Vec::new();

        let mut name: String = raw.chars().filter(|c| !c.is_control()).collect();
        let removed = raw.chars().count() - name.chars().count();
        if removed > 0 {
            errors.push(NameIssue::ControlCharacters { removed });
        }

        let len = name.chars().count();
        if len > self.max_length {
            name = name.chars().take(self.max_length).collect();
            errors.push(NameIssue::Truncated {
                from: len,
                to: self.max_length,
            });
        }

        // Trim after truncating: the cut may expose a forbidden character.
        let trimmed_len = name
            .trim_end_matches(|c| self.forbidden_trailing.contains(&c))
            .len();
        if trimmed_len < name.len() {
            let removed = name.split_off(trimmed_len);
            errors.push(NameIssue::TrailingTrimmed { removed });
        }

        if name.is_empty() {
            errors.push(NameIssue::Empty);
        }

        NameValidation {
            valid: !name.is_empty(),
            sanitized_name: name,
            errors,
        }
    }

    /// Sanitize `raw` and return the usable name, or `InvalidName`.
    pub fn require(&self, raw: &str) -> Result<String, TransferError> {
        let result = self.sanitize(raw);
        if !result.valid {
            return Err(TransferError::InvalidName {
                reason: if raw.is_empty() {
                    "name is empty".to_string()
                } else {
                    "name contains no usable characters".to_string()
                },
            });
        }
        if !result.errors.is_empty() {
            let repairs: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
            tracing::debug!(
                raw_name = raw,
                sanitized = %result.sanitized_name,
                repairs = %repairs.join("; "),
                "object name sanitized"
            );
        }
        Ok(result.sanitized_name)
    }
}

/// Validate an owner id used as a storage namespace.
///
/// Owner ids become the first path segment of every storage key, so they
/// may not contain `/` or control characters.
pub fn validate_owner_id(owner_id: &str) -> Result<(), TransferError> {
    let reason = if owner_id.is_empty() {
        Some("owner id is empty")
    } else if owner_id.len() > MAX_OWNER_ID_LEN {
        Some("owner id is too long")
    } else if owner_id.contains('/') || owner_id.contains('\\') {
        Some("owner id must not contain path separators")
    } else if owner_id.chars().any(|c| c.is_control() || c.is_whitespace()) {
        Some("owner id must not contain whitespace or control characters")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(TransferError::InvalidOwner {
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> NameValidator {
        NameValidator::default()
    }

    #[test]
    fn test_valid_name_unchanged() {
        let v = validator();
        for name in ["report.pdf", "photos/2024/cat.jpg", "a", "ümlaut ñame.txt"] {
            let result = v.sanitize(name);
            assert!(result.valid);
            assert_eq!(result.sanitized_name, name);
            assert!(result.errors.is_empty(), "{name}: {:?}", result.errors);
        }
    }

    #[test]
    fn test_trailing_characters_trimmed() {
        let result = validator().sanitize("notes.txt./\\.");
        assert!(result.valid);
        assert_eq!(result.sanitized_name, "notes.txt");
        assert_eq!(
            result.errors,
            vec![NameIssue::TrailingTrimmed {
                removed: "./\\.".to_string()
            }]
        );
    }

    #[test]
    fn test_truncates_to_max_length_in_chars() {
        let v = NameValidator::new(5, ['.']);
        let result = v.sanitize("ééééééé");
        assert_eq!(result.sanitized_name, "ééééé");
        assert_eq!(result.errors, vec![NameIssue::Truncated { from: 7, to: 5 }]);
    }

    #[test]
    fn test_truncation_exposing_trailing_dot_is_trimmed() {
        let v = NameValidator::new(4, ['.']);
        let result = v.sanitize("abc.def");
        assert_eq!(result.sanitized_name, "abc");
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_control_characters_removed() {
        let result = validator().sanitize("line\nbreak\t.txt");
        assert_eq!(result.sanitized_name, "linebreak.txt");
        assert_eq!(
            result.errors,
            vec![NameIssue::ControlCharacters { removed: 2 }]
        );
    }

    #[test]
    fn test_empty_after_sanitization_is_hard_failure() {
        let v = validator();
        for raw in ["", "...", "/\\/", "\u{0007}."] {
            let result = v.sanitize(raw);
            assert!(!result.valid, "{raw:?} should be invalid");
            assert!(result.errors.contains(&NameIssue::Empty));
            assert!(matches!(
                v.require(raw),
                Err(TransferError::InvalidName { .. })
            ));
        }
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let v = NameValidator::new(10, ['.', '/', '\\']);
        for raw in ["a\u{0000}b", "x".repeat(30).as_str(), "name...", "dir/sub/", "ok"] {
            let once = v.sanitize(raw).sanitized_name;
            let twice = v.sanitize(&once);
            assert_eq!(twice.sanitized_name, once);
            assert!(twice.errors.is_empty() || !twice.valid);
        }
    }

    #[test]
    fn test_require_returns_sanitized() {
        assert_eq!(validator().require("draft.").unwrap(), "draft");
    }

    #[test]
    fn test_validate_owner_id() {
        assert!(validate_owner_id("alice").is_ok());
        assert!(validate_owner_id("user-42@example.com").is_ok());
        assert!(validate_owner_id("").is_err());
        assert!(validate_owner_id("a/b").is_err());
        assert!(validate_owner_id("a b").is_err());
        assert!(validate_owner_id(&"x".repeat(129)).is_err());
    }
}
