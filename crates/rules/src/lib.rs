//! Concurrently-read catalogue of enforcement rules with wildcard matching.
//!
//! The store holds `(major, minor, pattern)` rules behind a reader-preferring
//! lock. Admin requests mutate it exclusively; the interception pipeline only
//! ever reads, one shared acquisition per match. Iteration order is reverse
//! insertion order (newest rule first), which makes `match_first`
//! deterministic for a fixed store without promising callers anything beyond
//! "some matching rule wins".
//!
//! During teardown the store is switched to draining: mutations fail with
//! `Busy`, reads keep working until the store is dropped.

#![deny(unsafe_code)]

use fsgate_core::action::{RuleMajor, RuleMinor};
use fsgate_core::rule::{Rule, RuleError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

mod wildmatch;

pub use wildmatch::matches_expression;

/// Failures surfaced by store mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A rule in the input batch failed validation. Rules inserted before
    /// the offending entry stay inserted.
    #[error("invalid rule: {0}")]
    InvalidRule(#[from] RuleError),
    /// The store is draining; mutations are refused during teardown.
    #[error("rule store is draining")]
    Busy,
}

/// Outcome of [`RuleStore::match_first`]: the winning rule's classification
/// plus a cheap reference to its pattern for audit records.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    /// Enforcement effect of the matched rule.
    pub major: RuleMajor,
    /// Audit effect of the matched rule.
    pub minor: RuleMinor,
    /// Upper-cased pattern of the matched rule.
    pub pattern: Arc<str>,
}

struct RuleEntry {
    major: RuleMajor,
    minor: RuleMinor,
    pattern: Arc<str>,
}

impl RuleEntry {
    fn identity(&self) -> (u16, u16, &str) {
        (self.major.wire_code(), self.minor.wire_code(), &self.pattern)
    }

    fn to_rule(&self) -> Rule {
        Rule { major: self.major, minor: self.minor, pattern: self.pattern.to_string() }
    }
}

/// The rule catalogue.
pub struct RuleStore {
    entries: RwLock<Vec<RuleEntry>>,
    draining: AtomicBool,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    /// Create an empty store in the open mode.
    #[must_use]
    pub fn new() -> Self {
        RuleStore { entries: RwLock::new(Vec::new()), draining: AtomicBool::new(false) }
    }

    /// Insert every rule whose identity is not already present; returns the
    /// number actually inserted. An invalid rule aborts the batch with an
    /// error but does not roll back earlier insertions.
    pub fn add(&self, rules: &[Rule]) -> Result<usize, StoreError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(StoreError::Busy);
        }
        let mut added = 0usize;
        let mut entries = self.entries.write().expect("rule store lock poisoned");
        for rule in rules {
            // Inputs may come straight off the wire; re-validate here so the
            // store invariants hold no matter the caller.
            let rule = Rule::new(rule.major, rule.minor, &rule.pattern)?;
            if entries.iter().any(|e| e.identity() == rule.identity()) {
                continue;
            }
            debug!(major = %rule.major, minor = %rule.minor, pattern = %rule.pattern, "rule added");
            entries.insert(
                0,
                RuleEntry {
                    major: rule.major,
                    minor: rule.minor,
                    pattern: Arc::from(rule.pattern.as_str()),
                },
            );
            added += 1;
        }
        Ok(added)
    }

    /// Delete rules whose identity matches any input entry; a missing entry
    /// is not an error. Returns the number removed.
    pub fn remove(&self, rules: &[Rule]) -> Result<usize, StoreError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(StoreError::Busy);
        }
        let mut entries = self.entries.write().expect("rule store lock poisoned");
        let before = entries.len();
        for rule in rules {
            let upper = rule.pattern.to_uppercase();
            let identity = (rule.major.wire_code(), rule.minor.wire_code(), upper.as_str());
            entries.retain(|e| {
                let hit = e.identity() == identity;
                if hit {
                    debug!(major = %e.major, minor = %e.minor, pattern = %e.pattern, "rule removed");
                }
                !hit
            });
        }
        Ok(before - entries.len())
    }

    /// Logical snapshot of all stored rules, in store order.
    #[must_use]
    pub fn query(&self) -> Vec<Rule> {
        let entries = self.entries.read().expect("rule store lock poisoned");
        entries.iter().map(RuleEntry::to_rule).collect()
    }

    /// All rules whose pattern matches `path`, in store order.
    #[must_use]
    pub fn check_matches(&self, path: &str) -> Vec<Rule> {
        let upper = path.to_uppercase();
        let entries = self.entries.read().expect("rule store lock poisoned");
        entries
            .iter()
            .filter(|e| matches_expression(&e.pattern, &upper))
            .map(RuleEntry::to_rule)
            .collect()
    }

    /// First matching rule in store order. The hot path: one shared lock
    /// acquisition, one upcase of the path, linear scan.
    #[must_use]
    pub fn match_first(&self, path: &str) -> Option<RuleMatch> {
        let upper = path.to_uppercase();
        let entries = self.entries.read().expect("rule store lock poisoned");
        entries.iter().find(|e| matches_expression(&e.pattern, &upper)).map(|e| RuleMatch {
            major: e.major,
            minor: e.minor,
            pattern: Arc::clone(&e.pattern),
        })
    }

    /// Empty the store; returns the number of rules removed.
    pub fn cleanup(&self) -> Result<usize, StoreError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(StoreError::Busy);
        }
        let mut entries = self.entries.write().expect("rule store lock poisoned");
        let removed = entries.len();
        entries.clear();
        debug!(removed, "rule store cleaned up");
        Ok(removed)
    }

    /// Number of stored rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("rule store lock poisoned").len()
    }

    /// Whether the store holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Switch to draining: every mutation from here on fails with
    /// [`StoreError::Busy`]; reads still succeed.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Whether the store is draining.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(major: RuleMajor, minor: RuleMinor, pattern: &str) -> Rule {
        Rule::new(major, minor, pattern).unwrap()
    }

    #[test]
    fn add_skips_duplicate_identity() {
        let store = RuleStore::new();
        let r = rule(RuleMajor::AccessDenied, RuleMinor::None, r"\DEVICE\HD1\SECRETS\*");
        assert_eq!(store.add(std::slice::from_ref(&r)).unwrap(), 1);
        assert_eq!(store.add(std::slice::from_ref(&r)).unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn identity_includes_minor_action() {
        let store = RuleStore::new();
        let a = rule(RuleMajor::AccessDenied, RuleMinor::None, r"\DEVICE\X\*");
        let b = rule(RuleMajor::AccessDenied, RuleMinor::Monitored, r"\DEVICE\X\*");
        assert_eq!(store.add(&[a, b]).unwrap(), 2);
    }

    #[test]
    fn add_then_remove_restores_prior_state() {
        let store = RuleStore::new();
        let keep = rule(RuleMajor::ReadOnly, RuleMinor::None, r"\DEVICE\KEEP\*");
        store.add(std::slice::from_ref(&keep)).unwrap();
        let before = store.query();

        let r = rule(RuleMajor::AccessDenied, RuleMinor::Monitored, r"\DEVICE\TMP\*");
        assert_eq!(store.add(std::slice::from_ref(&r)).unwrap(), 1);
        assert_eq!(store.remove(std::slice::from_ref(&r)).unwrap(), 1);
        assert_eq!(store.query(), before);
    }

    #[test]
    fn remove_of_absent_rule_is_not_an_error() {
        let store = RuleStore::new();
        let r = rule(RuleMajor::AccessDenied, RuleMinor::None, r"\DEVICE\NOPE\*");
        assert_eq!(store.remove(&[r]).unwrap(), 0);
    }

    #[test]
    fn invalid_rule_aborts_batch_without_rollback() {
        let store = RuleStore::new();
        let good = rule(RuleMajor::AccessDenied, RuleMinor::None, r"\DEVICE\A\*");
        let bad = Rule { major: RuleMajor::ReadOnly, minor: RuleMinor::None, pattern: String::new() };
        let err = store.add(&[good, bad]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRule(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn query_snapshot_is_uppercase_and_unique() {
        let store = RuleStore::new();
        store
            .add(&[
                rule(RuleMajor::AccessDenied, RuleMinor::None, r"\device\hd1\a\*"),
                rule(RuleMajor::ReadOnly, RuleMinor::Monitored, r"\device\hd1\b\*"),
            ])
            .unwrap();
        let snapshot = store.query();
        assert_eq!(snapshot.len(), 2);
        for r in &snapshot {
            assert!(!r.pattern.is_empty());
            assert_eq!(r.pattern, r.pattern.to_uppercase());
        }
        let mut identities: Vec<_> =
            snapshot.iter().map(|r| (r.major, r.minor, r.pattern.clone())).collect();
        identities.dedup();
        assert_eq!(identities.len(), snapshot.len());
    }

    #[test]
    fn newest_rule_wins_match_first() {
        let store = RuleStore::new();
        store
            .add(&[rule(RuleMajor::AccessDenied, RuleMinor::None, r"\DEVICE\*\PROGRAM FILES\*")])
            .unwrap();
        store
            .add(&[rule(
                RuleMajor::ReadOnly,
                RuleMinor::Monitored,
                r"\DEVICE\*\PROGRAM FILES\APP\*",
            )])
            .unwrap();
        let m = store.match_first(r"\Device\HarddiskVolume1\Program Files\App\x.exe").unwrap();
        assert_eq!(m.major, RuleMajor::ReadOnly);
        assert_eq!(m.minor, RuleMinor::Monitored);
    }

    #[test]
    fn cleanup_empties_and_reports_count() {
        let store = RuleStore::new();
        store
            .add(&[
                rule(RuleMajor::AccessDenied, RuleMinor::None, r"\DEVICE\A\*"),
                rule(RuleMajor::ReadOnly, RuleMinor::None, r"\DEVICE\B\*"),
            ])
            .unwrap();
        assert_eq!(store.cleanup().unwrap(), 2);
        assert!(store.is_empty());
        assert_eq!(store.cleanup().unwrap(), 0);
    }

    #[test]
    fn draining_refuses_mutation_allows_reads() {
        let store = RuleStore::new();
        let r = rule(RuleMajor::AccessDenied, RuleMinor::None, r"\DEVICE\A\*");
        store.add(std::slice::from_ref(&r)).unwrap();
        store.set_draining();

        assert_eq!(store.add(std::slice::from_ref(&r)).unwrap_err(), StoreError::Busy);
        assert_eq!(store.remove(std::slice::from_ref(&r)).unwrap_err(), StoreError::Busy);
        assert_eq!(store.cleanup().unwrap_err(), StoreError::Busy);
        assert_eq!(store.query().len(), 1);
        assert!(store.match_first(r"\Device\A\x").is_some());
    }
}
