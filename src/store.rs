//! Copy-on-write rule store.
//!
//! The store keeps the ordered rule set in an immutable [`RuleSnapshot`]
//! behind an `ArcSwap`, following the hot-reload model:
//!
//! ```text
//! resolve() -> RuleStore::load() -> ArcSwap::load() -> RuleSnapshot
//!                                        |
//!                                 (lock-free read)
//!
//! insert()/update()/... -> writer mutex -> build next snapshot -> ArcSwap::store()
//!                                                                     |
//!                                                          old snapshot dropped
//!                                                          when readers finish
//! ```
//!
//! Readers never block and always see a complete snapshot. Writers are
//! serialised by a mutex, validate against the current snapshot, and only
//! publish when validation succeeds.

use crate::error::{OverrideError, Result, ValidationError};
use crate::matcher::normalize_hostname;
use crate::rule::{CompiledRule, Rule, RuleId, RuleSpec, RuleUpdate};
use arc_swap::{ArcSwap, Guard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Immutable, point-in-time view of the rule set.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    version: u64,
    rules: Vec<Arc<CompiledRule>>,
}

impl RuleSnapshot {
    /// Commit counter; bumped on every successful mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// All rules, enabled or not, in evaluation order.
    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    /// Enabled rules in evaluation order.
    pub fn enabled(&self) -> impl Iterator<Item = &Arc<CompiledRule>> + '_ {
        self.rules.iter().filter(|rule| rule.is_enabled())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Looks a rule up by id.
    pub fn get(&self, id: RuleId) -> Option<&Arc<CompiledRule>> {
        self.rules.iter().find(|rule| rule.id() == id)
    }

    /// First enabled rule matching an already normalised hostname.
    ///
    /// Store order is the only tie-break; `priority` is not consulted.
    pub fn find_first_match(&self, hostname: &str) -> Option<&Arc<CompiledRule>> {
        self.enabled().find(|rule| rule.matches(hostname))
    }

    fn position(&self, id: RuleId) -> Result<usize> {
        self.rules
            .iter()
            .position(|rule| rule.id() == id)
            .ok_or(OverrideError::NotFound { id })
    }
}

/// Ordered, concurrently readable, serially mutable rule set.
pub struct RuleStore {
    /// The only shared mutable state: the current snapshot.
    current: ArcSwap<RuleSnapshot>,

    /// Serialises writers.
    write_lock: Mutex<()>,

    /// Next id to hand out. Starts at 1.
    next_id: AtomicU64,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSnapshot::default()),
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Borrows the current snapshot without bumping its reference count.
    ///
    /// Intended for short lookups on the hot path; hold an [`Arc`] from
    /// [`RuleStore::snapshot`] for anything longer.
    pub fn load(&self) -> Guard<Arc<RuleSnapshot>> {
        self.current.load()
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.load_full()
    }

    /// Version of the current snapshot.
    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Full rule table in store order, for rendering.
    pub fn list(&self) -> Vec<Rule> {
        self.current
            .load()
            .rules
            .iter()
            .map(|rule| rule.rule().clone())
            .collect()
    }

    /// Returns a rule by id.
    pub fn get(&self, id: RuleId) -> Option<Rule> {
        self.current.load().get(id).map(|rule| rule.rule().clone())
    }

    /// First enabled rule matching `hostname`, or `None`.
    ///
    /// Malformed hostnames never match.
    pub fn find_first_match(&self, hostname: &str) -> Option<Arc<CompiledRule>> {
        let host = normalize_hostname(hostname)?;
        self.current.load().find_first_match(&host).cloned()
    }

    /// Validates and appends a new rule.
    pub fn insert(&self, spec: RuleSpec) -> Result<Rule> {
        let compiled = CompiledRule::from_spec(spec)?;

        self.commit("insert", |current| {
            let compiled = compiled.with_id(self.allocate_id());
            let rule = compiled.rule().clone();
            let mut rules = current.rules.clone();
            rules.push(Arc::new(compiled));
            Ok((rules, rule))
        })
    }

    /// Validates and applies a partial update in place.
    pub fn update(&self, id: RuleId, update: &RuleUpdate) -> Result<Rule> {
        self.commit("update", |current| {
            let index = current.position(id)?;
            let next = update.apply_to(current.rules[index].rule());
            let compiled = CompiledRule::compile(next)?;
            let rule = compiled.rule().clone();
            let mut rules = current.rules.clone();
            rules[index] = Arc::new(compiled);
            Ok((rules, rule))
        })
    }

    /// Removes a rule and returns it.
    pub fn remove(&self, id: RuleId) -> Result<Rule> {
        self.commit("remove", |current| {
            let index = current.position(id)?;
            let mut rules = current.rules.clone();
            let removed = rules.remove(index);
            Ok((rules, removed.rule().clone()))
        })
    }

    /// Enables or disables a rule without touching its position.
    pub fn set_enabled(&self, id: RuleId, enabled: bool) -> Result<Rule> {
        self.commit("set_enabled", |current| {
            let index = current.position(id)?;
            let compiled = current.rules[index].with_enabled(enabled);
            let rule = compiled.rule().clone();
            let mut rules = current.rules.clone();
            rules[index] = Arc::new(compiled);
            Ok((rules, rule))
        })
    }

    /// Replaces the evaluation order.
    ///
    /// `order` must contain every current id exactly once.
    pub fn reorder(&self, order: &[RuleId]) -> Result<()> {
        self.commit("reorder", |current| {
            if order.len() != current.rules.len() {
                return Err(ValidationError::InvalidOrder {
                    reason: format!(
                        "expected {} ids, got {}",
                        current.rules.len(),
                        order.len()
                    ),
                }
                .into());
            }

            let mut by_id: HashMap<RuleId, &Arc<CompiledRule>> =
                current.rules.iter().map(|rule| (rule.id(), rule)).collect();

            let mut rules = Vec::with_capacity(order.len());
            for id in order {
                let rule = by_id.remove(id).ok_or_else(|| ValidationError::InvalidOrder {
                    reason: format!("unknown or duplicate id {}", id),
                })?;
                rules.push(Arc::clone(rule));
            }
            Ok((rules, ()))
        })
    }

    /// Moves one rule to `index`, shifting the others. Indexes past the end
    /// move the rule to the end.
    pub fn move_rule(&self, id: RuleId, index: usize) -> Result<()> {
        self.commit("move", |current| {
            let from = current.position(id)?;
            let mut rules = current.rules.clone();
            let rule = rules.remove(from);
            let to = index.min(rules.len());
            rules.insert(to, rule);
            Ok((rules, ()))
        })
    }

    /// Removes every rule and returns how many were dropped.
    pub fn clear(&self) -> usize {
        // An empty set is always valid.
        self.commit("clear", |current| Ok((Vec::new(), current.rules.len())))
            .unwrap_or_default()
    }

    /// Replaces the whole rule set with already validated rules, assigning
    /// fresh ids in sequence order.
    pub(crate) fn replace_all(&self, compiled: Vec<CompiledRule>) -> Vec<Rule> {
        let committed = self.commit("replace_all", |_| {
            let rules: Vec<Arc<CompiledRule>> = compiled
                .into_iter()
                .map(|rule| Arc::new(rule.with_id(self.allocate_id())))
                .collect();
            let listed = rules.iter().map(|rule| rule.rule().clone()).collect();
            Ok((rules, listed))
        });
        // The closure above cannot fail.
        committed.unwrap_or_default()
    }

    fn allocate_id(&self) -> RuleId {
        RuleId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Runs `build` against the current snapshot under the writer lock and
    /// publishes its result as the next version. On error nothing changes.
    fn commit<T>(
        &self,
        operation: &'static str,
        build: impl FnOnce(&RuleSnapshot) -> Result<(Vec<Arc<CompiledRule>>, T)>,
    ) -> Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let current = self.current.load_full();
        let (rules, output) = match build(&current) {
            Ok(built) => built,
            Err(err) => {
                debug!(operation, error = %err, "Rule set mutation rejected");
                return Err(err);
            }
        };

        let next = RuleSnapshot {
            version: current.version + 1,
            rules,
        };
        info!(
            operation,
            version = next.version,
            rules = next.rules.len(),
            "Rule set updated"
        );
        self.current.store(Arc::new(next));

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::PatternType;

    fn exact(pattern: &str, target: &str) -> RuleSpec {
        RuleSpec::new(pattern, PatternType::Exact, target)
    }

    fn wildcard(pattern: &str, target: &str) -> RuleSpec {
        RuleSpec::new(pattern, PatternType::Wildcard, target)
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let store = RuleStore::new();
        let a = store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        let b = store.insert(exact("b.example.com", "10.0.0.2")).unwrap();
        assert!(b.id > a.id);
        assert_eq!(store.list().len(), 2);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_insert_invalid_leaves_store_unchanged() {
        let store = RuleStore::new();
        store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        let before = store.snapshot();

        let err = store
            .insert(RuleSpec::new("a[", PatternType::Regex, "10.0.0.1"))
            .unwrap_err();
        assert!(matches!(
            err.as_validation(),
            Some(ValidationError::InvalidRegex { .. })
        ));
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[test]
    fn test_find_first_match_uses_store_order() {
        let store = RuleStore::new();
        let first = store
            .insert(wildcard("*.example.com", "10.0.0.1").with_priority(100))
            .unwrap();
        store
            .insert(exact("api.example.com", "10.0.0.2").with_priority(1))
            .unwrap();

        let matched = store.find_first_match("api.example.com").unwrap();
        assert_eq!(matched.id(), first.id);
    }

    #[test]
    fn test_find_first_match_skips_disabled() {
        let store = RuleStore::new();
        let first = store.insert(exact("api.example.com", "10.0.0.1")).unwrap();
        let second = store.insert(exact("api.example.com", "10.0.0.2")).unwrap();

        store.set_enabled(first.id, false).unwrap();
        let matched = store.find_first_match("api.example.com").unwrap();
        assert_eq!(matched.id(), second.id);

        // Disabled rule stays in place
        assert_eq!(store.list()[0].id, first.id);
        assert!(!store.list()[0].enabled);
    }

    #[test]
    fn test_find_first_match_malformed_hostname() {
        let store = RuleStore::new();
        store.insert(wildcard("*", "10.0.0.1")).unwrap();
        assert!(store.find_first_match("").is_none());
        assert!(store.find_first_match("bad host").is_none());
        assert!(store.find_first_match("anything.at.all").is_some());
    }

    #[test]
    fn test_update_in_place() {
        let store = RuleStore::new();
        let a = store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        store.insert(exact("b.example.com", "10.0.0.2")).unwrap();

        let updated = store
            .update(a.id, &RuleUpdate::new().target_host("10.9.9.9").target_port(Some(9000)))
            .unwrap();
        assert_eq!(updated.id, a.id);
        assert_eq!(updated.target_host, "10.9.9.9");
        assert_eq!(updated.target_port, Some(9000));
        assert_eq!(store.list()[0], updated);
    }

    #[test]
    fn test_update_invalid_regex_is_atomic() {
        let store = RuleStore::new();
        let a = store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        let before = store.snapshot();
        let listed = store.list();

        let err = store
            .update(a.id, &RuleUpdate::new().pattern("(unclosed", PatternType::Regex))
            .unwrap_err();
        assert!(matches!(err, OverrideError::Validation(ValidationError::InvalidRegex { .. })));
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
        assert_eq!(store.list(), listed);
        assert_eq!(store.version(), before.version());
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let store = RuleStore::new();
        let missing = RuleId::new(99);
        assert!(matches!(store.remove(missing), Err(OverrideError::NotFound { id }) if id == missing));
        assert!(matches!(
            store.update(missing, &RuleUpdate::new()),
            Err(OverrideError::NotFound { .. })
        ));
        assert!(matches!(
            store.set_enabled(missing, true),
            Err(OverrideError::NotFound { .. })
        ));
        assert!(matches!(store.move_rule(missing, 0), Err(OverrideError::NotFound { .. })));
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_remove() {
        let store = RuleStore::new();
        let a = store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        let removed = store.remove(a.id).unwrap();
        assert_eq!(removed, a);
        assert!(store.get(a.id).is_none());
        assert!(store.find_first_match("a.example.com").is_none());
    }

    #[test]
    fn test_ids_never_reused() {
        let store = RuleStore::new();
        let a = store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        store.remove(a.id).unwrap();
        store.clear();
        let b = store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_reorder() {
        let store = RuleStore::new();
        let a = store.insert(exact("x.example.com", "10.0.0.1")).unwrap();
        let b = store.insert(exact("x.example.com", "10.0.0.2")).unwrap();
        let c = store.insert(exact("y.example.com", "10.0.0.3")).unwrap();

        store.reorder(&[b.id, c.id, a.id]).unwrap();
        let ids: Vec<RuleId> = store.list().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b.id, c.id, a.id]);
        assert_eq!(store.find_first_match("x.example.com").unwrap().id(), b.id);
    }

    #[test]
    fn test_reorder_rejects_non_permutation() {
        let store = RuleStore::new();
        let a = store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        let b = store.insert(exact("b.example.com", "10.0.0.2")).unwrap();
        let before = store.snapshot();

        for order in [vec![a.id], vec![a.id, a.id], vec![a.id, RuleId::new(77)], vec![a.id, b.id, b.id]] {
            let err = store.reorder(&order).unwrap_err();
            assert!(matches!(
                err,
                OverrideError::Validation(ValidationError::InvalidOrder { .. })
            ));
        }
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[test]
    fn test_move_rule() {
        let store = RuleStore::new();
        let a = store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        let b = store.insert(exact("b.example.com", "10.0.0.2")).unwrap();
        let c = store.insert(exact("c.example.com", "10.0.0.3")).unwrap();

        store.move_rule(c.id, 0).unwrap();
        let ids: Vec<RuleId> = store.list().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![c.id, a.id, b.id]);

        store.move_rule(c.id, 100).unwrap();
        let ids: Vec<RuleId> = store.list().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn test_clear() {
        let store = RuleStore::new();
        store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        store.insert(exact("b.example.com", "10.0.0.2")).unwrap();
        assert_eq!(store.clear(), 2);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_replace_all_assigns_fresh_ids() {
        let store = RuleStore::new();
        let old = store.insert(exact("old.example.com", "10.0.0.1")).unwrap();

        let rules = store.replace_all(vec![
            CompiledRule::from_spec(exact("a.example.com", "10.0.0.1")).unwrap(),
            CompiledRule::from_spec(exact("b.example.com", "10.0.0.2")).unwrap(),
        ]);
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.id > old.id));
        assert_ne!(rules[0].id, rules[1].id);
        assert!(store.get(old.id).is_none());
        assert_eq!(store.list(), rules);
    }

    #[test]
    fn test_snapshot_is_stable_across_mutation() {
        let store = RuleStore::new();
        let a = store.insert(exact("a.example.com", "10.0.0.1")).unwrap();
        let held = store.snapshot();

        store.remove(a.id).unwrap();
        assert_eq!(held.len(), 1);
        assert!(held.find_first_match("a.example.com").is_some());
        assert!(store.snapshot().find_first_match("a.example.com").is_none());
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let store = RuleStore::new();
        let target = store.insert(exact("api.example.com", "10.0.0.5")).unwrap();
        for i in 0..32 {
            store
                .insert(exact(&format!("h{}.example.com", i), "10.0.1.1"))
                .unwrap();
        }
        let removal_version = store.version() + 1;

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..2_000 {
                        let snapshot = store.snapshot();
                        let present = snapshot.get(target.id).is_some();
                        let matched = snapshot.find_first_match("api.example.com").is_some();
                        assert_eq!(present, matched);
                        assert_eq!(present, snapshot.version() < removal_version);
                        assert!(snapshot.len() == 33 || snapshot.len() == 32);
                    }
                });
            }
            scope.spawn(|| {
                store.remove(target.id).unwrap();
            });
        });

        assert!(store.find_first_match("api.example.com").is_none());
    }
}
