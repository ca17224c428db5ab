//! Override rules.
//!
//! A [`Rule`] is plain data. It becomes usable for lookups only after
//! [`CompiledRule::compile`] has validated every field and pre-built the
//! pattern, which is the single point where rule invariants are enforced.

use crate::error::ValidationError;
use crate::matcher::{validate_hostname_pattern, CompiledPattern, PatternType};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// Stable identifier of a rule. Never reused within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(u64);

impl RuleId {
    /// Wraps a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single hostname override entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Assigned by the store on insertion.
    pub id: RuleId,

    /// Hostname pattern, matched case-insensitively.
    pub pattern: String,

    /// How `pattern` is interpreted.
    pub pattern_type: PatternType,

    /// IP literal or hostname to connect to instead.
    pub target_host: String,

    /// Port override; `None` keeps the original port.
    pub target_port: Option<u16>,

    /// Operator-facing ordering hint. Not used for matching.
    pub priority: i32,

    /// Disabled rules stay in the set but never match.
    pub enabled: bool,

    /// Free-text annotation.
    pub label: String,
}

impl Rule {
    /// Port to dial for a connection originally aimed at `original_port`.
    pub fn effective_port(&self, original_port: u16) -> u16 {
        self.target_port.unwrap_or(original_port)
    }
}

/// Fields of a rule to be created. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub pattern: String,
    pub pattern_type: PatternType,
    pub target_host: String,
    pub target_port: Option<u16>,
    pub priority: i32,
    pub enabled: bool,
    pub label: String,
}

impl Default for RuleSpec {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            pattern_type: PatternType::Exact,
            target_host: String::new(),
            target_port: None,
            priority: 0,
            enabled: true,
            label: String::new(),
        }
    }
}

impl RuleSpec {
    /// Creates an enabled rule spec without port override.
    pub fn new(
        pattern: impl Into<String>,
        pattern_type: PatternType,
        target_host: impl Into<String>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            pattern_type,
            target_host: target_host.into(),
            ..Default::default()
        }
    }

    /// Sets the port override.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.target_port = Some(port);
        self
    }

    /// Sets the advisory priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Marks the rule as disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub(crate) fn into_rule(self, id: RuleId) -> Rule {
        Rule {
            id,
            pattern: self.pattern,
            pattern_type: self.pattern_type,
            target_host: self.target_host,
            target_port: self.target_port,
            priority: self.priority,
            enabled: self.enabled,
            label: self.label,
        }
    }
}

/// Partial update of a rule. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleUpdate {
    pub pattern: Option<String>,
    pub pattern_type: Option<PatternType>,
    pub target_host: Option<String>,
    /// `Some(None)` clears the port override.
    pub target_port: Option<Option<u16>>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
    pub label: Option<String>,
}

impl RuleUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>, pattern_type: PatternType) -> Self {
        self.pattern = Some(pattern.into());
        self.pattern_type = Some(pattern_type);
        self
    }

    #[must_use]
    pub fn target_host(mut self, host: impl Into<String>) -> Self {
        self.target_host = Some(host.into());
        self
    }

    #[must_use]
    pub fn target_port(mut self, port: Option<u16>) -> Self {
        self.target_port = Some(port);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Returns a copy of `rule` with this update applied. Not validated.
    pub fn apply_to(&self, rule: &Rule) -> Rule {
        let mut next = rule.clone();
        if let Some(pattern) = &self.pattern {
            next.pattern = pattern.clone();
        }
        if let Some(pattern_type) = self.pattern_type {
            next.pattern_type = pattern_type;
        }
        if let Some(host) = &self.target_host {
            next.target_host = host.clone();
        }
        if let Some(port) = self.target_port {
            next.target_port = port;
        }
        if let Some(priority) = self.priority {
            next.priority = priority;
        }
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        if let Some(label) = &self.label {
            next.label = label.clone();
        }
        next
    }
}

/// A validated rule with its pattern compiled for matching.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: Rule,
    pattern: CompiledPattern,
}

impl CompiledRule {
    /// Validates every field of `rule` and compiles its pattern.
    ///
    /// Pattern and target host are stored trimmed.
    pub fn compile(mut rule: Rule) -> Result<Self, ValidationError> {
        rule.pattern = rule.pattern.trim().to_string();
        rule.target_host = rule.target_host.trim().to_string();

        let pattern = CompiledPattern::compile(&rule.pattern, rule.pattern_type)?;
        validate_target_host(&rule.target_host)?;
        if let Some(port) = rule.target_port {
            validate_port(i64::from(port))?;
        }

        Ok(Self { rule, pattern })
    }

    /// Validates a rule that has not been assigned an id yet.
    pub fn from_spec(spec: RuleSpec) -> Result<Self, ValidationError> {
        Self::compile(spec.into_rule(RuleId::new(0)))
    }

    /// The underlying rule.
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn id(&self) -> RuleId {
        self.rule.id
    }

    pub fn is_enabled(&self) -> bool {
        self.rule.enabled
    }

    /// Tests a normalised hostname against this rule's pattern.
    /// Ignores the enabled flag.
    #[inline]
    pub fn matches(&self, hostname: &str) -> bool {
        self.pattern.matches(hostname)
    }

    pub(crate) fn with_id(mut self, id: RuleId) -> Self {
        self.rule.id = id;
        self
    }

    /// Same rule with a different enabled flag; the pattern is not recompiled.
    pub(crate) fn with_enabled(&self, enabled: bool) -> Self {
        let mut next = self.clone();
        next.rule.enabled = enabled;
        next
    }
}

/// Checks that a target is an IP literal (optionally bracketed IPv6) or a hostname.
pub fn validate_target_host(host: &str) -> Result<(), ValidationError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ValidationError::EmptyTargetHost);
    }

    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return inner
            .parse::<Ipv6Addr>()
            .map(|_| ())
            .map_err(|_| ValidationError::InvalidTargetHost {
                host: host.to_string(),
            });
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    validate_hostname_pattern(host).map_err(|_| ValidationError::InvalidTargetHost {
        host: host.to_string(),
    })
}

/// Converts a raw port value into a valid port.
pub fn validate_port(port: i64) -> Result<u16, ValidationError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ValidationError::PortOutOfRange { port }),
    }
}
