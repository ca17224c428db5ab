//! Per-connection override resolution.
//!
//! [`HostResolver`] is what the host proxy calls before it opens a socket.
//! It normalises the hostname, walks the current rule snapshot and returns a
//! [`Decision`]. Every call also produces a [`MatchEvent`] for any attached
//! subscribers and observers; their failures never reach the caller.
//!
//! The resolver is also the control surface: mutations go through it so that
//! an attached [`RulePersister`] can write the rule set through to storage.

use crate::bridge::{RulePersister, RuleRecord};
use crate::error::Result;
use crate::matcher::normalize_hostname;
use crate::rule::{CompiledRule, Rule, RuleId, RuleSpec, RuleUpdate};
use crate::store::{RuleSnapshot, RuleStore};
use arc_swap::ArcSwap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

/// Default buffer size of the match-event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Resolve the hostname normally.
    NoOverride,

    /// Dial this endpoint instead, keeping the original hostname for
    /// SNI and the Host header.
    Redirect {
        /// IP literal or hostname to connect to.
        target_host: String,
        /// Rule port if set, otherwise the original port.
        port: u16,
        /// The rule that produced this redirect.
        rule_id: RuleId,
    },
}

impl Decision {
    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::Redirect { .. })
    }

    /// The matched rule, if any.
    pub fn rule_id(&self) -> Option<RuleId> {
        match self {
            Self::Redirect { rule_id, .. } => Some(*rule_id),
            Self::NoOverride => None,
        }
    }

    /// Target host and port of a redirect.
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match self {
            Self::Redirect {
                target_host, port, ..
            } => Some((target_host.as_str(), *port)),
            Self::NoOverride => None,
        }
    }

    /// Socket address of a redirect whose target is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let (host, port) = self.endpoint()?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        host.parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, port))
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOverride => f.write_str("no override"),
            Self::Redirect {
                target_host,
                port,
                rule_id,
            } => {
                if target_host.contains(':') && !target_host.starts_with('[') {
                    write!(f, "redirect to [{}]:{} (rule {})", target_host, port, rule_id)
                } else {
                    write!(f, "redirect to {}:{} (rule {})", target_host, port, rule_id)
                }
            }
        }
    }
}

/// Emitted once per [`HostResolver::resolve`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEvent {
    /// Hostname as passed by the caller.
    pub hostname: String,
    /// Original port.
    pub port: u16,
    /// Matched rule, `None` on a miss.
    pub rule_id: Option<RuleId>,
    /// The decision returned to the caller.
    pub decision: Decision,
    /// Version of the snapshot the decision was made against.
    pub snapshot_version: u64,
}

/// Error type observers may return.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Synchronous listener for match events.
///
/// Called on the resolving thread after the decision is made. Errors and
/// panics are caught and logged.
pub trait MatchObserver: Send + Sync {
    fn on_event(&self, event: &MatchEvent) -> std::result::Result<(), ObserverError>;
}

impl<F> MatchObserver for F
where
    F: Fn(&MatchEvent) + Send + Sync,
{
    fn on_event(&self, event: &MatchEvent) -> std::result::Result<(), ObserverError> {
        self(event);
        Ok(())
    }
}

/// Handle returned by [`HostResolver::register_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverList = Vec<(ObserverId, Arc<dyn MatchObserver>)>;

struct ObserverRegistry {
    observers: ArcSwap<ObserverList>,
    next_id: AtomicU64,
}

impl ObserverRegistry {
    fn new() -> Self {
        Self {
            observers: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

/// Resolution façade over a [`RuleStore`].
#[derive(Clone)]
pub struct HostResolver {
    store: Arc<RuleStore>,
    events: broadcast::Sender<MatchEvent>,
    observers: Arc<ObserverRegistry>,
    persister: Option<Arc<dyn RulePersister>>,
    persist_lock: Arc<Mutex<()>>,
}

impl Default for HostResolver {
    fn default() -> Self {
        Self::new(Arc::new(RuleStore::new()))
    }
}

impl HostResolver {
    /// Creates a resolver over `store` with the default event buffer.
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self::with_event_capacity(store, DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a resolver with a custom event buffer size (at least 1).
    pub fn with_event_capacity(store: Arc<RuleStore>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            store,
            events,
            observers: Arc::new(ObserverRegistry::new()),
            persister: None,
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Attaches a write-through persister, called after every committed
    /// mutation made through this resolver.
    #[must_use]
    pub fn with_persister(mut self, persister: Arc<dyn RulePersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Resolves a hostname for a connection to `port`.
    ///
    /// Never blocks and never fails: malformed hostnames and misses both
    /// return [`Decision::NoOverride`].
    pub fn resolve(&self, hostname: &str, port: u16) -> Decision {
        let snapshot = self.store.load();
        let version = snapshot.version();

        let decision = match normalize_hostname(hostname) {
            Some(host) => match snapshot.find_first_match(&host) {
                Some(rule) => redirect(rule, hostname, port),
                None => {
                    trace!(hostname = %hostname, port, "No override rule matched");
                    Decision::NoOverride
                }
            },
            None => {
                trace!(hostname = %hostname, "Malformed hostname, no override");
                Decision::NoOverride
            }
        };

        // Observers may be slow; don't hold the snapshot guard across them.
        drop(snapshot);
        self.emit(hostname, port, &decision, version);
        decision
    }

    /// Resolves a `host[:port]` authority, e.g. from a Host header or a
    /// CONNECT target. A missing port falls back to `default_port`; an
    /// unparsable one yields [`Decision::NoOverride`].
    pub fn resolve_authority(&self, authority: &str, default_port: u16) -> Decision {
        match parse_host_port(authority, default_port) {
            Some((host, port)) => self.resolve(host, port),
            None => {
                trace!(authority = %authority, "Malformed authority, no override");
                Decision::NoOverride
            }
        }
    }

    /// First enabled rule matching `hostname`.
    pub fn find_first_match(&self, hostname: &str) -> Option<Arc<CompiledRule>> {
        self.store.find_first_match(hostname)
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.store.snapshot()
    }

    /// Full rule table in store order.
    pub fn list(&self) -> Vec<Rule> {
        self.store.list()
    }

    pub fn get(&self, id: RuleId) -> Option<Rule> {
        self.store.get(id)
    }

    /// Subscribes to match events. Slow receivers lag; they never slow
    /// down resolution.
    pub fn subscribe(&self) -> broadcast::Receiver<MatchEvent> {
        self.events.subscribe()
    }

    /// Registers a synchronous observer.
    pub fn register_observer(&self, observer: Arc<dyn MatchObserver>) -> ObserverId {
        let id = ObserverId(self.observers.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.observers.rcu(|current| {
            let mut next: ObserverList = current.as_ref().clone();
            next.push((id, Arc::clone(&observer)));
            next
        });
        id
    }

    /// Removes an observer. Returns whether it was registered.
    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        let previous = self.observers.observers.rcu(|current| {
            current
                .iter()
                .filter(|(existing, _)| *existing != id)
                .cloned()
                .collect::<ObserverList>()
        });
        previous.iter().any(|(existing, _)| *existing == id)
    }

    pub fn insert(&self, spec: RuleSpec) -> Result<Rule> {
        let rule = self.store.insert(spec)?;
        self.write_through();
        Ok(rule)
    }

    pub fn update(&self, id: RuleId, update: &RuleUpdate) -> Result<Rule> {
        let rule = self.store.update(id, update)?;
        self.write_through();
        Ok(rule)
    }

    pub fn remove(&self, id: RuleId) -> Result<Rule> {
        let rule = self.store.remove(id)?;
        self.write_through();
        Ok(rule)
    }

    pub fn set_enabled(&self, id: RuleId, enabled: bool) -> Result<Rule> {
        let rule = self.store.set_enabled(id, enabled)?;
        self.write_through();
        Ok(rule)
    }

    pub fn reorder(&self, order: &[RuleId]) -> Result<()> {
        self.store.reorder(order)?;
        self.write_through();
        Ok(())
    }

    pub fn move_rule(&self, id: RuleId, index: usize) -> Result<()> {
        self.store.move_rule(id, index)?;
        self.write_through();
        Ok(())
    }

    pub fn clear(&self) -> usize {
        let removed = self.store.clear();
        self.write_through();
        removed
    }

    /// Replaces the rule set from persisted records, all or nothing.
    pub fn import_rules(&self, records: Vec<RuleRecord>) -> Result<()> {
        self.store.import_rules(records)?;
        self.write_through();
        Ok(())
    }

    /// Current rule set as persistable records.
    pub fn export_rules(&self) -> Vec<RuleRecord> {
        self.store.export_rules()
    }

    fn write_through(&self) {
        if let Some(persister) = &self.persister {
            // Export under the lock so the last write always carries the
            // newest rule set, whatever order concurrent mutations finish in.
            let _guard = self
                .persist_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = persister.persist(&self.store.export_rules()) {
                error!(error = %e, "Failed to persist rule set");
            }
        }
    }

    fn emit(&self, hostname: &str, port: u16, decision: &Decision, snapshot_version: u64) {
        let observers = self.observers.observers.load_full();
        let has_subscribers = self.events.receiver_count() > 0;
        if observers.is_empty() && !has_subscribers {
            return;
        }

        let event = MatchEvent {
            hostname: hostname.to_string(),
            port,
            rule_id: decision.rule_id(),
            decision: decision.clone(),
            snapshot_version,
        };

        for (id, observer) in observers.iter() {
            match catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(observer = id.0, error = %e, "Match observer failed");
                }
                Err(_) => {
                    warn!(observer = id.0, "Match observer panicked");
                }
            }
        }

        if has_subscribers {
            // No receivers left is not an error for the caller.
            let _ = self.events.send(event);
        }
    }
}

fn redirect(rule: &CompiledRule, hostname: &str, port: u16) -> Decision {
    let rule = rule.rule();
    let effective_port = rule.effective_port(port);
    debug!(
        hostname = %hostname,
        rule_id = %rule.id,
        target = %rule.target_host,
        port = effective_port,
        "Resolved via override rule"
    );
    Decision::Redirect {
        target_host: rule.target_host.clone(),
        port: effective_port,
        rule_id: rule.id,
    }
}

/// Splits a `host[:port]` authority, IPv6-bracket aware.
///
/// A bare IPv6 literal is returned whole with `default_port`.
pub fn parse_host_port(authority: &str, default_port: u16) -> Option<(&str, u16)> {
    let authority = authority.trim();

    if authority.starts_with('[') {
        let bracket = authority.find(']')?;
        let host = &authority[..=bracket];
        return match &authority[bracket + 1..] {
            "" => Some((host, default_port)),
            rest => {
                let port = rest.strip_prefix(':')?.parse().ok()?;
                Some((host, port))
            }
        };
    }

    if authority.parse::<IpAddr>().is_ok() {
        return Some((authority, default_port));
    }

    match authority.rfind(':') {
        Some(colon) => {
            let port = authority[colon + 1..].parse().ok()?;
            Some((&authority[..colon], port))
        }
        None => Some((authority, default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::PatternType;
    use std::sync::Mutex;

    fn create_test_resolver() -> HostResolver {
        let resolver = HostResolver::default();
        resolver
            .insert(RuleSpec::new("api.example.com", PatternType::Exact, "10.0.0.5"))
            .unwrap();
        resolver
            .insert(RuleSpec::new("*.example.com", PatternType::Wildcard, "10.0.0.9").with_port(9000))
            .unwrap();
        resolver
    }

    #[test]
    fn test_resolve_exact_mapping() {
        let resolver = create_test_resolver();

        match resolver.resolve("api.example.com", 443) {
            Decision::Redirect {
                target_host, port, ..
            } => {
                assert_eq!(target_host, "10.0.0.5");
                assert_eq!(port, 443); // Uses original port
            }
            other => panic!("Expected Redirect, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_port_override() {
        let resolver = create_test_resolver();

        let decision = resolver.resolve("x.example.com", 8443);
        assert_eq!(decision.endpoint(), Some(("10.0.0.9", 9000)));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let resolver = create_test_resolver();

        let lower = resolver.resolve("api.example.com", 443);
        let upper = resolver.resolve("API.EXAMPLE.COM", 443);
        assert_eq!(lower, upper);
        assert!(lower.is_redirect());
    }

    #[test]
    fn test_resolve_no_override() {
        let resolver = create_test_resolver();
        assert_eq!(resolver.resolve("example.com", 80), Decision::NoOverride);
        assert_eq!(resolver.resolve("other.org", 80), Decision::NoOverride);
    }

    #[test]
    fn test_malformed_hostname_never_redirects() {
        let resolver = HostResolver::default();
        resolver
            .insert(RuleSpec::new("*", PatternType::Wildcard, "10.0.0.1"))
            .unwrap();

        for host in ["", "   ", "a..b", "bad host", "exa\u{0}mple.com"] {
            assert_eq!(resolver.resolve(host, 80), Decision::NoOverride, "{:?}", host);
        }
    }

    #[test]
    fn test_resolve_authority() {
        let resolver = create_test_resolver();

        assert_eq!(
            resolver.resolve_authority("api.example.com:8443", 443).endpoint(),
            Some(("10.0.0.5", 8443))
        );
        assert_eq!(
            resolver.resolve_authority("api.example.com", 443).endpoint(),
            Some(("10.0.0.5", 443))
        );
        assert_eq!(
            resolver.resolve_authority("api.example.com:http", 443),
            Decision::NoOverride
        );
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("example.com:8080", 80), Some(("example.com", 8080)));
        assert_eq!(parse_host_port("example.com", 80), Some(("example.com", 80)));
        assert_eq!(parse_host_port("[::1]:8080", 80), Some(("[::1]", 8080)));
        assert_eq!(parse_host_port("[::1]", 80), Some(("[::1]", 80)));
        assert_eq!(parse_host_port("::1", 80), Some(("::1", 80)));
        assert_eq!(parse_host_port("[::1]x", 80), None);
        assert_eq!(parse_host_port("example.com:99999", 80), None);
    }

    #[test]
    fn test_decision_socket_addr() {
        let decision = Decision::Redirect {
            target_host: "10.0.0.5".to_string(),
            port: 443,
            rule_id: RuleId::new(1),
        };
        assert_eq!(decision.socket_addr(), Some("10.0.0.5:443".parse().unwrap()));

        let decision = Decision::Redirect {
            target_host: "[::1]".to_string(),
            port: 443,
            rule_id: RuleId::new(1),
        };
        assert_eq!(decision.socket_addr(), Some("[::1]:443".parse().unwrap()));

        let decision = Decision::Redirect {
            target_host: "staging.internal".to_string(),
            port: 443,
            rule_id: RuleId::new(1),
        };
        assert_eq!(decision.socket_addr(), None);
        assert_eq!(Decision::NoOverride.socket_addr(), None);
    }

    #[test]
    fn test_decision_display() {
        let decision = Decision::Redirect {
            target_host: "::1".to_string(),
            port: 8443,
            rule_id: RuleId::new(3),
        };
        assert_eq!(decision.to_string(), "redirect to [::1]:8443 (rule #3)");
        assert_eq!(Decision::NoOverride.to_string(), "no override");
    }

    #[test]
    fn test_observer_receives_events() {
        let resolver = create_test_resolver();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        resolver.register_observer(Arc::new(move |event: &MatchEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        resolver.resolve("api.example.com", 443);
        resolver.resolve("nothing.test", 80);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].rule_id.is_some());
        assert_eq!(seen[0].hostname, "api.example.com");
        assert_eq!(seen[1].rule_id, None);
        assert_eq!(seen[1].decision, Decision::NoOverride);
    }

    struct FailingObserver;

    impl MatchObserver for FailingObserver {
        fn on_event(&self, _event: &MatchEvent) -> std::result::Result<(), ObserverError> {
            Err("listener is broken".into())
        }
    }

    struct PanickingObserver;

    impl MatchObserver for PanickingObserver {
        fn on_event(&self, _event: &MatchEvent) -> std::result::Result<(), ObserverError> {
            panic!("listener exploded");
        }
    }

    #[test]
    fn test_observer_failures_are_isolated() {
        let resolver = create_test_resolver();
        let expected = resolver.resolve("api.example.com", 443);

        resolver.register_observer(Arc::new(FailingObserver));
        resolver.register_observer(Arc::new(PanickingObserver));
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        resolver.register_observer(Arc::new(move |_: &MatchEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(resolver.resolve("api.example.com", 443), expected);
        // Observers after a failing one still run
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_observer() {
        let resolver = create_test_resolver();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let id = resolver.register_observer(Arc::new(move |_: &MatchEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        resolver.resolve("api.example.com", 443);
        assert!(resolver.unregister_observer(id));
        assert!(!resolver.unregister_observer(id));
        resolver.resolve("api.example.com", 443);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_receives_events() {
        let resolver = create_test_resolver();
        let mut rx = resolver.subscribe();

        let decision = resolver.resolve("api.example.com", 443);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.decision, decision);
        assert_eq!(event.port, 443);
        assert_eq!(event.snapshot_version, resolver.snapshot().version());
    }

    #[test]
    fn test_dropped_subscriber_does_not_affect_resolve() {
        let resolver = create_test_resolver();
        let rx = resolver.subscribe();
        drop(rx);
        assert!(resolver.resolve("api.example.com", 443).is_redirect());
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let resolver = create_test_resolver();
        let first = resolver.resolve("deep.api.example.com", 443);
        for _ in 0..100 {
            assert_eq!(resolver.resolve("deep.api.example.com", 443), first);
        }
    }

    /// Persister whose first write stalls, so a later mutation can overtake it.
    struct StallingPersister {
        calls: AtomicU64,
        last: Mutex<Option<Vec<RuleRecord>>>,
    }

    impl RulePersister for StallingPersister {
        fn persist(&self, records: &[RuleRecord]) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
            *self.last.lock().unwrap() = Some(records.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_concurrent_write_through_persists_latest_rules() {
        let persister = Arc::new(StallingPersister {
            calls: AtomicU64::new(0),
            last: Mutex::new(None),
        });
        let resolver = HostResolver::default().with_persister(persister.clone());

        std::thread::scope(|s| {
            let first = resolver.clone();
            s.spawn(move || {
                first
                    .insert(RuleSpec::new("a.example.com", PatternType::Exact, "10.0.0.1"))
                    .unwrap();
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            let second = resolver.clone();
            s.spawn(move || {
                second
                    .insert(RuleSpec::new("b.example.com", PatternType::Exact, "10.0.0.2"))
                    .unwrap();
            });
        });

        assert_eq!(resolver.list().len(), 2);
        let last = persister.last.lock().unwrap().clone().unwrap();
        assert_eq!(last, resolver.export_rules());
    }

    #[test]
    fn test_observer_runs_without_holding_snapshot() {
        let resolver = create_test_resolver();
        let store = Arc::clone(resolver.store());
        let versions = Arc::new(Mutex::new(Vec::new()));
        let seen = versions.clone();
        // A mutation from inside an observer must commit and be visible.
        resolver.register_observer(Arc::new(move |event: &MatchEvent| {
            if event.rule_id.is_some() {
                store.clear();
                seen.lock().unwrap().push((event.snapshot_version, store.version()));
            }
        }));

        let before = resolver.snapshot().version();
        assert!(resolver.resolve("api.example.com", 443).is_redirect());
        let versions = versions.lock().unwrap();
        assert_eq!(versions.as_slice(), &[(before, before + 1)]);
        assert!(!resolver.resolve("api.example.com", 443).is_redirect());
    }
}
