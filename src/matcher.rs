//! Hostname pattern matching.
//!
//! Patterns come in three closed kinds, see [`PatternType`]. Each pattern is
//! validated and compiled once into a [`CompiledPattern`] when a rule is
//! created or updated, so the lookup path only ever runs a string compare,
//! a suffix compare or a pre-built regex.

use crate::error::ValidationError;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// Maximum length of a full hostname in bytes.
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;

/// How a rule's pattern is compared against a hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Whole-hostname equality.
    #[default]
    Exact,
    /// `*.suffix` (one or more labels before `suffix`) or a bare `*`.
    Wildcard,
    /// Fully anchored regular expression.
    Regex,
}

impl PatternType {
    /// Parses a pattern type name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Some(Self::Exact),
            "wildcard" => Some(Self::Wildcard),
            "regex" | "regexp" => Some(Self::Regex),
            _ => None,
        }
    }

    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Wildcard => "wildcard",
            Self::Regex => "regex",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PatternType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        PatternType::parse(&raw).ok_or_else(|| {
            serde::de::Error::unknown_variant(&raw, &["exact", "wildcard", "regex"])
        })
    }
}

/// A validated pattern, ready for matching.
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    /// Lower-cased hostname.
    Exact(String),
    /// Lower-cased suffix including its leading dot, or `None` for a bare `*`.
    Wildcard(Option<String>),
    /// Anchored, case-insensitive expression.
    Regex(Regex),
}

impl CompiledPattern {
    /// Validates `pattern` as the given type and compiles it.
    pub fn compile(pattern: &str, pattern_type: PatternType) -> Result<Self, ValidationError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(ValidationError::EmptyPattern);
        }

        match pattern_type {
            PatternType::Exact => {
                if pattern.contains('*') {
                    return Err(ValidationError::InvalidWildcard {
                        pattern: pattern.to_string(),
                    });
                }
                validate_hostname_pattern(pattern)?;
                Ok(Self::Exact(pattern.to_ascii_lowercase()))
            }
            PatternType::Wildcard => {
                if pattern == "*" {
                    return Ok(Self::Wildcard(None));
                }
                let Some(suffix) = pattern.strip_prefix("*.") else {
                    if pattern.contains('*') {
                        return Err(ValidationError::InvalidWildcard {
                            pattern: pattern.to_string(),
                        });
                    }
                    return Err(ValidationError::InvalidHostnamePattern {
                        pattern: pattern.to_string(),
                        reason: "wildcard pattern must start with '*'".to_string(),
                    });
                };
                if suffix.contains('*') {
                    return Err(ValidationError::InvalidWildcard {
                        pattern: pattern.to_string(),
                    });
                }
                validate_hostname_pattern(suffix).map_err(|err| match err {
                    ValidationError::InvalidHostnamePattern { reason, .. } => {
                        ValidationError::InvalidHostnamePattern {
                            pattern: pattern.to_string(),
                            reason,
                        }
                    }
                    other => other,
                })?;
                Ok(Self::Wildcard(Some(format!(
                    ".{}",
                    suffix.to_ascii_lowercase()
                ))))
            }
            PatternType::Regex => {
                let build = |source: &str| {
                    RegexBuilder::new(source)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| ValidationError::InvalidRegex {
                            pattern: pattern.to_string(),
                            message: e.to_string(),
                        })
                };
                // The bare pattern must parse on its own, otherwise a stray
                // ')' could close the anchoring group early.
                build(pattern)?;
                Ok(Self::Regex(build(&format!("^(?:{})$", pattern))?))
            }
        }
    }

    /// Tests a hostname that has already been passed through
    /// [`normalize_hostname`].
    #[inline]
    pub fn matches(&self, hostname: &str) -> bool {
        match self {
            Self::Exact(expected) => hostname == expected,
            Self::Wildcard(None) => true,
            Self::Wildcard(Some(suffix)) => {
                hostname.len() > suffix.len() && hostname.ends_with(suffix.as_str())
            }
            Self::Regex(regex) => regex.is_match(hostname),
        }
    }

    /// The type this pattern was compiled as.
    pub fn pattern_type(&self) -> PatternType {
        match self {
            Self::Exact(_) => PatternType::Exact,
            Self::Wildcard(_) => PatternType::Wildcard,
            Self::Regex(_) => PatternType::Regex,
        }
    }
}

/// Returns whether `hostname` matches `pattern` of the given type.
///
/// Convenience form of [`CompiledPattern::compile`] followed by
/// [`CompiledPattern::matches`]. An invalid pattern or a malformed hostname
/// never matches.
pub fn matches(pattern: &str, pattern_type: PatternType, hostname: &str) -> bool {
    let Some(host) = normalize_hostname(hostname) else {
        return false;
    };
    CompiledPattern::compile(pattern, pattern_type)
        .map(|compiled| compiled.matches(&host))
        .unwrap_or(false)
}

/// Normalises a hostname for matching.
///
/// Trims whitespace, strips one trailing dot and IPv6 brackets, and
/// lower-cases. Returns `None` for empty or malformed input.
pub fn normalize_hostname(hostname: &str) -> Option<String> {
    let trimmed = hostname.trim();

    if let Some(inner) = trimmed.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return inner
            .parse::<Ipv6Addr>()
            .ok()
            .map(|ip| ip.to_string());
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Some(ip.to_string());
    }

    let host = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    let valid = host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    });

    valid.then(|| host.to_ascii_lowercase())
}

/// Checks that `pattern` is a dotted sequence of alphanumeric/hyphen labels.
pub fn validate_hostname_pattern(pattern: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidHostnamePattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    if pattern.len() > MAX_HOSTNAME_LEN {
        return Err(invalid("longer than 253 characters"));
    }

    for label in pattern.split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid("label longer than 63 characters"));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid("labels may only contain letters, digits and '-'"));
        }
    }

    Ok(())
}
