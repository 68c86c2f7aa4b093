//! Identity resolution: duplicate detection, merges and the merge-log fold.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Operation};
use crate::event::IdentitySignals;
use crate::locks::{KeyedLocks, MAX_RESOLVE_ATTEMPTS};
use crate::store::{EventStore, FingerprintSummary, MergeOutcome, SignalObservation};
use crate::window::CohortWindow;

/// The identity signal a duplicate group was keyed on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SignalKey {
    Email(String),
    UserId(String),
    Phone(String),
}

impl SignalKey {
    /// The first non-empty signal by priority: email, then user_id, then phone.
    /// Emails compare case-insensitively.
    pub fn primary_of(signals: &IdentitySignals) -> Option<SignalKey> {
        fn clean(v: &Option<String>) -> Option<&str> {
            v.as_deref().map(str::trim).filter(|s| !s.is_empty())
        }
        if let Some(email) = clean(&signals.email) {
            return Some(SignalKey::Email(email.to_lowercase()));
        }
        if let Some(user_id) = clean(&signals.user_id) {
            return Some(SignalKey::UserId(user_id.to_string()));
        }
        clean(&signals.phone).map(|p| SignalKey::Phone(p.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalKey::Email(_) => "email",
            SignalKey::UserId(_) => "user_id",
            SignalKey::Phone(_) => "phone",
        }
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKey::Email(v) | SignalKey::UserId(v) | SignalKey::Phone(v) => {
                write!(f, "{}:{}", self.kind(), v)
            }
        }
    }
}

/// Fingerprints that reported the same identity signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub signal: SignalKey,
    /// Sorted, at least two entries.
    pub fingerprints: Vec<String>,
}

/// Group observations by signal and keep the groups shared by two or more fingerprints.
pub fn group_candidates(observations: &[SignalObservation]) -> Vec<DuplicateGroup> {
    let mut by_signal: BTreeMap<SignalKey, BTreeSet<&str>> = BTreeMap::new();
    for obs in observations {
        if let Some(key) = SignalKey::primary_of(&obs.signals) {
            by_signal.entry(key).or_default().insert(&obs.fingerprint);
        }
    }
    by_signal
        .into_iter()
        .filter(|(_, fps)| fps.len() >= 2)
        .map(|(signal, fps)| DuplicateGroup {
            signal,
            fingerprints: fps.into_iter().map(str::to_string).collect(),
        })
        .collect()
}

/// One durable entry of the append-only merge log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub id: String,
    pub site_id: i64,
    pub primary: String,
    pub secondary: String,
    pub reason: String,
    pub merged_at: DateTime<Utc>,
}

/// In-memory view of a site's merge log.
///
/// Ownership is a pure fold: a fingerprint's canonical owner is found by
/// following secondary -> primary edges until a fingerprint that was never
/// merged away.
#[derive(Debug, Clone, Default)]
pub struct MergeLog {
    records: Vec<MergeRecord>,
    parent: HashMap<String, String>,
}

impl MergeLog {
    pub fn new(mut records: Vec<MergeRecord>) -> Self {
        records.sort_by(|a, b| a.merged_at.cmp(&b.merged_at).then(a.id.cmp(&b.id)));
        let mut parent = HashMap::new();
        for record in &records {
            // Re-merging an absorbed fingerprint keeps its first owner edge.
            parent
                .entry(record.secondary.clone())
                .or_insert_with(|| record.primary.clone());
        }
        Self { records, parent }
    }

    pub fn records(&self) -> &[MergeRecord] {
        &self.records
    }

    pub fn canonical_of(&self, fingerprint: &str) -> String {
        let mut current = fingerprint;
        let mut seen = HashSet::new();
        while let Some(next) = self.parent.get(current) {
            if !seen.insert(current) {
                break;
            }
            current = next;
        }
        current.to_string()
    }

    /// Fingerprints absorbed into `person_id`, in merge order, without duplicates.
    pub fn merged_from(&self, person_id: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for record in &self.records {
            if record.secondary != person_id
                && self.canonical_of(&record.secondary) == person_id
                && !out.contains(&record.secondary)
            {
                out.push(record.secondary.clone());
            }
        }
        out
    }

    /// Merge records whose secondary now belongs to `person_id`.
    pub fn records_for(&self, person_id: &str) -> Vec<MergeRecord> {
        self.records
            .iter()
            .filter(|r| self.canonical_of(&r.secondary) == person_id)
            .cloned()
            .collect()
    }
}

/// Canonical visitor identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    /// The canonical fingerprint.
    pub person_id: String,
    pub site_id: i64,
    pub session_count: i64,
    pub first_visit: DateTime<Utc>,
    pub signals: IdentitySignals,
    /// Append-only provenance, in merge order.
    pub merged_from: Vec<String>,
    pub merges: Vec<MergeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeStatus {
    Merged {
        sessions_moved: i64,
        pageviews_tagged: i64,
        events_tagged: i64,
    },
    /// Both fingerprints already resolve to the same person.
    AlreadyMerged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    pub primary: String,
    pub secondary: String,
    #[serde(flatten)]
    pub status: MergeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub primary: String,
    pub secondary: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub groups: usize,
    pub merged: usize,
    pub no_ops: usize,
    pub failures: Vec<SweepFailure>,
}

/// Pick the fingerprint to keep: earliest first visit, then smallest fingerprint.
pub fn choose_primary(summaries: &[FingerprintSummary]) -> Option<&FingerprintSummary> {
    summaries
        .iter()
        .min_by(|a, b| a.first_visit.cmp(&b.first_visit).then(a.fingerprint.cmp(&b.fingerprint)))
}

pub struct IdentityResolver {
    store: Arc<dyn EventStore>,
    locks: Arc<KeyedLocks>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn EventStore>, locks: Arc<KeyedLocks>) -> Self {
        Self { store, locks }
    }

    pub async fn find_duplicate_candidates(
        &self,
        site_id: i64,
        window: &CohortWindow,
    ) -> Result<Vec<DuplicateGroup>, EngineError> {
        let observations = self.store.identify_signals(site_id, window).await?;
        Ok(group_candidates(&observations))
    }

    /// Same as [`find_duplicate_candidates`](Self::find_duplicate_candidates),
    /// under the name dashboards use.
    pub async fn find_potential_duplicates(
        &self,
        site_id: i64,
        window: &CohortWindow,
    ) -> Result<Vec<DuplicateGroup>, EngineError> {
        self.find_duplicate_candidates(site_id, window).await
    }

    /// Merge `secondary` into `primary` on `site_id`.
    ///
    /// Both inputs are canonicalized first, so merging an already-absorbed
    /// fingerprint either routes to its current owner or is a no-op.
    pub async fn merge(
        &self,
        site_id: i64,
        primary: &str,
        secondary: &str,
        reason: &str,
    ) -> Result<MergeResult, EngineError> {
        self.merge_at(site_id, primary, secondary, reason, Utc::now())
            .await
    }

    pub async fn merge_at(
        &self,
        site_id: i64,
        primary: &str,
        secondary: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<MergeResult, EngineError> {
        if primary.trim().is_empty() || secondary.trim().is_empty() {
            return Err(EngineError::Validation(
                "both fingerprints are required".into(),
            ));
        }
        if primary == secondary {
            return Err(EngineError::Validation(
                "cannot merge a fingerprint into itself".into(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(EngineError::Validation("merge reason is required".into()));
        }

        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let (p, s) = self.canonical_pair(site_id, primary, secondary).await?;
            let _guards = self.locks.lock_pair(site_id, &p, &s).await;
            // A concurrent merge may have moved either side while we waited;
            // the held keys must be the current owners.
            let (current_p, current_s) = self.canonical_pair(site_id, primary, secondary).await?;
            if current_p != p || current_s != s {
                debug!(
                    site_id,
                    primary = %primary,
                    secondary = %secondary,
                    "fingerprints merged while waiting; re-resolving"
                );
                continue;
            }
            return self.merge_locked(site_id, p, s, secondary, reason, at).await;
        }

        Err(EngineError::Conflict(format!(
            "fingerprints {primary} and {secondary} kept moving during merge"
        )))
    }

    /// Merge with both owner keys held.
    async fn merge_locked(
        &self,
        site_id: i64,
        p: String,
        s: String,
        requested_secondary: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<MergeResult, EngineError> {
        let primary_summary = self
            .store
            .fingerprint_summary(site_id, &p)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("fingerprint {p} has no sessions on site {site_id}"))
            })?;

        if p == s {
            return Ok(MergeResult {
                primary: primary_summary.fingerprint,
                secondary: requested_secondary.to_string(),
                status: MergeStatus::AlreadyMerged,
            });
        }

        let secondary_summary = self
            .store
            .fingerprint_summary(site_id, &s)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("fingerprint {s} has no sessions on site {site_id}"))
            })?;

        let record = MergeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            site_id,
            primary: p.clone(),
            secondary: s.clone(),
            reason: reason.trim().to_string(),
            merged_at: at,
        };

        match self
            .store
            .apply_merge(&record, secondary_summary.session_count)
            .await?
        {
            MergeOutcome::Applied {
                sessions_moved,
                pageviews_tagged,
                events_tagged,
            } => {
                info!(
                    site_id,
                    primary = %p,
                    secondary = %s,
                    reason = %record.reason,
                    sessions_moved,
                    "fingerprints merged"
                );
                Ok(MergeResult {
                    primary: p,
                    secondary: s,
                    status: MergeStatus::Merged {
                        sessions_moved,
                        pageviews_tagged,
                        events_tagged,
                    },
                })
            }
            MergeOutcome::Conflict { expected, found } => Err(EngineError::Conflict(format!(
                "fingerprint {s} changed during merge: expected {expected} sessions, found {found}"
            ))),
        }
    }

    async fn canonical_pair(
        &self,
        site_id: i64,
        primary: &str,
        secondary: &str,
    ) -> Result<(String, String), EngineError> {
        let p = self.store.canonical_fingerprint(site_id, primary).await?;
        let s = self.store.canonical_fingerprint(site_id, secondary).await?;
        Ok((p, s))
    }

    /// Fold the merge log and identify events into the person owning `person_id`.
    pub async fn get_identities(
        &self,
        site_id: i64,
        person_id: &str,
        window: &CohortWindow,
    ) -> Result<Person, EngineError> {
        let summary = self
            .store
            .fingerprint_summary(site_id, person_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("person {person_id} not found on site {site_id}"))
            })?;
        let log = MergeLog::new(self.store.merge_log(site_id).await?);

        let mut signals = IdentitySignals::default();
        for obs in self.store.identify_signals(site_id, window).await? {
            if obs.fingerprint == person_id {
                signals.fill_from(&obs.signals);
            }
        }

        Ok(Person {
            person_id: person_id.to_string(),
            site_id,
            session_count: summary.session_count,
            first_visit: summary.first_visit,
            signals,
            merged_from: log.merged_from(person_id),
            merges: log.records_for(person_id),
        })
    }

    /// Merge every duplicate group found in `window`, keeping the earliest
    /// fingerprint of each group. One failed merge is recorded and the sweep
    /// moves on. Running the sweep again over merged data only yields no-ops.
    pub async fn auto_merge_sweep(
        &self,
        site_id: i64,
        window: &CohortWindow,
    ) -> Result<SweepReport, EngineError> {
        let groups = self.find_duplicate_candidates(site_id, window).await?;
        let mut report = SweepReport {
            groups: groups.len(),
            ..Default::default()
        };

        for group in groups {
            let mut summaries = Vec::with_capacity(group.fingerprints.len());
            let mut seen = HashSet::new();
            for fp in &group.fingerprints {
                let canonical = match self.store.canonical_fingerprint(site_id, fp).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(
                            site_id,
                            fingerprint = %fp,
                            error = %e,
                            "canonical lookup failed; skipping"
                        );
                        continue;
                    }
                };
                if !seen.insert(canonical.clone()) {
                    continue;
                }
                match self.store.fingerprint_summary(site_id, &canonical).await {
                    Ok(Some(summary)) => summaries.push(summary),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            site_id,
                            fingerprint = %canonical,
                            error = %e,
                            "summary lookup failed; skipping"
                        );
                    }
                }
            }

            let Some(primary) = choose_primary(&summaries).map(|s| s.fingerprint.clone()) else {
                continue;
            };
            if summaries.len() < 2 {
                report.no_ops += 1;
                continue;
            }

            let reason = format!("auto:{}", group.signal.kind());
            for secondary in summaries.iter().filter(|s| s.fingerprint != primary) {
                match self
                    .merge(site_id, &primary, &secondary.fingerprint, &reason)
                    .await
                {
                    Ok(MergeResult {
                        status: MergeStatus::Merged { .. },
                        ..
                    }) => report.merged += 1,
                    Ok(_) => report.no_ops += 1,
                    Err(e) => {
                        warn!(
                            site_id,
                            primary = %primary,
                            secondary = %secondary.fingerprint,
                            error = %e,
                            "auto-merge failed; continuing sweep"
                        );
                        report.failures.push(SweepFailure {
                            primary: primary.clone(),
                            secondary: secondary.fingerprint.clone(),
                            reason: e.public_message(Operation::Merge),
                        });
                    }
                }
            }
        }

        info!(
            site_id,
            groups = report.groups,
            merged = report.merged,
            failures = report.failures.len(),
            "auto-merge sweep finished"
        );
        Ok(report)
    }
}
