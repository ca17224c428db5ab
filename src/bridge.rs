//! Persistence of the rule set.
//!
//! The persisted shape is a list of [`RuleRecord`]s wrapped in a
//! [`RuleFile`] YAML document. Imports are all-or-nothing: every record is
//! validated first and any failure rejects the whole batch with the full
//! list of problems.
//!
//! [`RuleFileBridge`] ties a file on disk to a [`HostResolver`]: it loads
//! the file at startup, writes the rule set back after each mutation when
//! attached as a [`RulePersister`], and can watch the file with `notify`
//! to pick up external edits.

use crate::error::{ImportError, OverrideError, RecordError, Result, ValidationError};
use crate::matcher::PatternType;
use crate::resolver::HostResolver;
use crate::rule::{validate_port, CompiledRule, Rule, RuleSpec};
use crate::store::RuleStore;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Quiet period after the last file event before a reload.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

fn default_enabled() -> bool {
    true
}

/// Persisted form of a rule. Ids are not persisted.
///
/// Unknown fields are ignored and every field has a default, so missing
/// data surfaces as a validation error rather than a parse error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    #[serde(default)]
    pub pattern: String,

    #[serde(default, alias = "patternType", alias = "type")]
    pub pattern_type: PatternType,

    #[serde(default, alias = "targetHost")]
    pub target_host: String,

    /// Kept wide so out-of-range values reach validation.
    #[serde(default, alias = "targetPort", skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i64>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

impl RuleRecord {
    /// Converts to a creation spec, checking the port range.
    pub fn to_spec(&self) -> std::result::Result<RuleSpec, ValidationError> {
        let target_port = self.target_port.map(validate_port).transpose()?;
        Ok(RuleSpec {
            pattern: self.pattern.clone(),
            pattern_type: self.pattern_type,
            target_host: self.target_host.clone(),
            target_port,
            priority: self.priority,
            enabled: self.enabled,
            label: self.label.clone(),
        })
    }
}

impl From<&Rule> for RuleRecord {
    fn from(rule: &Rule) -> Self {
        Self {
            pattern: rule.pattern.clone(),
            pattern_type: rule.pattern_type,
            target_host: rule.target_host.clone(),
            target_port: rule.target_port.map(i64::from),
            priority: rule.priority,
            enabled: rule.enabled,
            label: rule.label.clone(),
        }
    }
}

impl RuleStore {
    /// Current rule set, including disabled rules, in store order.
    pub fn export_rules(&self) -> Vec<RuleRecord> {
        self.load()
            .rules()
            .iter()
            .map(|rule| RuleRecord::from(rule.rule()))
            .collect()
    }

    /// Replaces the rule set with `records`, or rejects all of them.
    ///
    /// On rejection the store is untouched and the error lists every
    /// invalid record.
    pub fn import_rules(&self, records: Vec<RuleRecord>) -> Result<()> {
        let mut compiled = Vec::with_capacity(records.len());
        let mut failures = Vec::new();

        for (index, record) in records.iter().enumerate() {
            match record.to_spec().and_then(CompiledRule::from_spec) {
                Ok(rule) => compiled.push(rule),
                Err(error) => failures.push(RecordError { index, error }),
            }
        }

        if !failures.is_empty() {
            warn!(failures = failures.len(), "Rule import rejected");
            return Err(ImportError { failures }.into());
        }

        let imported = self.replace_all(compiled);
        info!(rules = imported.len(), "Rules imported");
        Ok(())
    }
}

/// When the rule set is written back to storage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistMode {
    /// After every committed mutation.
    #[default]
    WriteThrough,
    /// Only when explicitly asked.
    OnDemand,
}

/// Sink for write-through persistence.
pub trait RulePersister: Send + Sync {
    fn persist(&self, records: &[RuleRecord]) -> Result<()>;
}

/// On-disk rule document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleRecord>,
}

impl RuleFile {
    /// Parses a YAML rule document. Records are not validated here.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        // An empty file is an empty rule set.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| OverrideError::config_parse(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| OverrideError::config_parse(e.to_string()))
    }

    /// Loads a rule document from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(OverrideError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Writes the document next to `path` and renames it into place.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_atomic(path.as_ref(), &self.to_yaml()?)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Result of a watcher-triggered reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The new file was imported.
    Reloaded { rules: usize },
    /// The new file was invalid; the live rule set is unchanged.
    Rejected { error: String },
}

/// Binds a rule file to a resolver.
pub struct RuleFileBridge {
    path: PathBuf,

    /// Text last written or loaded; used to skip our own writes.
    last_synced: Mutex<Option<String>>,
}

impl RuleFileBridge {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last_synced: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Imports the rule file into `resolver`'s store, bypassing
    /// write-through. A missing file leaves the store as it is.
    ///
    /// Returns the number of rules loaded.
    pub fn load_into(&self, resolver: &HostResolver) -> Result<usize> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "Rule file not found, starting with an empty rule set");
            return Ok(0);
        }

        let contents = fs::read_to_string(&self.path)?;
        let count = self.import_text(resolver, &contents)?;
        info!(path = %self.path.display(), rules = count, "Loaded rule file");
        Ok(count)
    }

    /// Writes the resolver's current rule set to the file.
    pub fn persist_from(&self, resolver: &HostResolver) -> Result<()> {
        self.persist(&resolver.export_rules())
    }

    /// Re-reads the file and imports it if it changed since the last sync.
    ///
    /// Returns `None` when the contents are what we last wrote or loaded.
    pub fn reload(&self, resolver: &HostResolver) -> Option<ReloadOutcome> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read rule file");
                return Some(ReloadOutcome::Rejected {
                    error: e.to_string(),
                });
            }
        };

        if self.last_synced().as_deref() == Some(contents.as_str()) {
            debug!(path = %self.path.display(), "Rule file unchanged, skipping reload");
            return None;
        }

        match self.import_text(resolver, &contents) {
            Ok(rules) => {
                info!(path = %self.path.display(), rules, "Rule file reloaded");
                Some(ReloadOutcome::Reloaded { rules })
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Rejected rule file reload");
                Some(ReloadOutcome::Rejected {
                    error: e.to_string(),
                })
            }
        }
    }

    /// Starts watching the rule file for changes.
    /// Returns a channel receiver that reports each reload.
    pub fn start_watcher(
        self: &Arc<Self>,
        resolver: HostResolver,
    ) -> Result<mpsc::Receiver<ReloadOutcome>> {
        let (tx, rx) = mpsc::channel(8);
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();
        let file_name = self.path.file_name().map(|name| name.to_os_string());

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let ours = event.paths.iter().any(|p| p.file_name() == file_name.as_deref());
                    if ours && (event.kind.is_modify() || event.kind.is_create()) {
                        let _ = notify_tx.send(());
                    }
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| OverrideError::Watch {
            message: e.to_string(),
        })?;

        // Watch the parent directory to catch file replacements
        let watch_path = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| OverrideError::Watch {
                message: e.to_string(),
            })?;

        info!(path = %self.path.display(), "Started watching rule file for changes");

        let bridge = Arc::clone(self);
        std::thread::spawn(move || {
            // The watcher stops when dropped.
            let _watcher = watcher;

            while notify_rx.recv().is_ok() {
                // Wait for the burst of events from one save to settle.
                while notify_rx.recv_timeout(RELOAD_DEBOUNCE).is_ok() {
                    debug!("Debouncing rule file reload");
                }

                if let Some(outcome) = bridge.reload(&resolver) {
                    if tx.blocking_send(outcome).is_err() {
                        break;
                    }
                }
            }
            warn!("Rule file watcher stopped");
        });

        Ok(rx)
    }

    fn import_text(&self, resolver: &HostResolver, contents: &str) -> Result<usize> {
        let file = RuleFile::from_yaml(contents)?;
        let count = file.rules.len();
        resolver.store().import_rules(file.rules)?;
        self.set_last_synced(contents.to_string());
        Ok(count)
    }

    fn last_synced(&self) -> Option<String> {
        self.last_synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_synced(&self, contents: String) {
        *self
            .last_synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(contents);
    }
}

impl RulePersister for RuleFileBridge {
    fn persist(&self, records: &[RuleRecord]) -> Result<()> {
        let contents = RuleFile {
            rules: records.to_vec(),
        }
        .to_yaml()?;
        // Record first so the watcher ignores the event our own write causes.
        self.set_last_synced(contents.clone());
        write_atomic(&self.path, &contents)?;
        debug!(path = %self.path.display(), rules = records.len(), "Rule file written");
        Ok(())
    }
}
