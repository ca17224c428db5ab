//! # Host Override Library
//!
//! A hostname resolution override engine for proxy tools. Before the host
//! proxy opens a connection it asks the engine whether the hostname has an
//! override; on a match the connection is dialed to the rule's target while
//! the original hostname is kept for SNI and the Host header.
//!
//! ## Modules
//!
//! - [`matcher`]: Exact, wildcard and regex hostname patterns
//! - [`rule`]: Rule entity and validation
//! - [`store`]: Copy-on-write rule store with lock-free snapshots
//! - [`resolver`]: Per-connection resolution and match events
//! - [`bridge`]: Rule import/export and the YAML rule file
//! - [`config`]: Application settings
//! - [`error`]: Error types and handling
//! - [`logging`]: Logging setup
//!
//! ## Example
//!
//! ```
//! use host_override::{Decision, HostResolver, PatternType, RuleSpec};
//!
//! let resolver = HostResolver::default();
//! resolver
//!     .insert(RuleSpec::new("api.example.com", PatternType::Exact, "10.0.0.5"))
//!     .unwrap();
//!
//! let decision = resolver.resolve("API.example.com", 443);
//! assert_eq!(decision.endpoint(), Some(("10.0.0.5", 443)));
//! assert_eq!(resolver.resolve("example.com", 443), Decision::NoOverride);
//! ```
//!
//! ## Matching
//!
//! Enabled rules are evaluated in store order and the first match wins.
//! The `priority` field is shown to operators but never used for matching;
//! reordering the store is what changes precedence.

pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod matcher;
pub mod resolver;
pub mod rule;
pub mod store;

pub use bridge::{PersistMode, ReloadOutcome, RuleFile, RuleFileBridge, RulePersister, RuleRecord};
pub use config::AppConfig;
pub use error::{ImportError, OverrideError, RecordError, Result, ValidationError};
pub use matcher::{matches, PatternType};
pub use resolver::{Decision, HostResolver, MatchEvent, MatchObserver, ObserverId};
pub use rule::{CompiledRule, Rule, RuleId, RuleSpec, RuleUpdate};
pub use store::{RuleSnapshot, RuleStore};
