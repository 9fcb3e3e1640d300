//! Reconciliation of upstream streams with local metadata
//!
//! NPM is the source of truth for which rules exist; the local store is a
//! side-table keyed by rule id with no referential integrity against NPM.
//! The pure functions here (`merge`, `plan_reap`) decide what the combined
//! view looks like and which local records to mark or drop. `Reconciler`
//! wires them to a `StreamApi` and a `MetadataStore`.

use crate::error::{MetaError, Result};
use crate::ports::{suggest_next_port, PortRange, RecentPorts};
use crate::session::Session;
use crate::storage::MetadataStore;
use crate::types::{Config, ForwardingRule, MergedEntry, Metadata, MetadataRecord, RuleId, RuleSpec};
use crate::upstream::StreamApi;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Combined view, ordered by incoming port.
pub type MergedView = Vec<MergedEntry>;

/// Result of merging upstream rules with local records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub view: MergedView,
    /// Ids of local records with no upstream rule, ascending
    pub orphaned: Vec<RuleId>,
}

/// Merge upstream rules with local records.
///
/// The view holds exactly one entry per upstream rule id. If upstream repeats
/// an id, the last occurrence wins. Entries are sorted by incoming port, then
/// id, so input order never shows through.
pub fn merge(rules: Vec<ForwardingRule>, records: Vec<MetadataRecord>) -> Reconciliation {
    let rules: BTreeMap<RuleId, ForwardingRule> =
        rules.into_iter().map(|rule| (rule.id, rule)).collect();

    let mut metadata: BTreeMap<RuleId, Metadata> = BTreeMap::new();
    let mut orphaned = Vec::new();
    for record in records {
        if rules.contains_key(&record.rule_id) {
            metadata.insert(record.rule_id, record.metadata);
        } else {
            orphaned.push(record.rule_id);
        }
    }
    orphaned.sort_unstable();
    orphaned.dedup();

    let mut view: MergedView = rules
        .into_values()
        .map(|rule| {
            let metadata = metadata.remove(&rule.id).unwrap_or_default();
            MergedEntry { rule, metadata }
        })
        .collect();
    view.sort_by_key(|entry| (entry.rule.incoming_port, entry.rule.id));

    Reconciliation { view, orphaned }
}

/// What a reaping pass should do to the local store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapPlan {
    /// Absent upstream for longer than the grace window
    pub remove: Vec<RuleId>,
    /// Newly seen as absent; start their grace clock
    pub mark: Vec<RuleId>,
    /// Marked earlier but present upstream again
    pub unmark: Vec<RuleId>,
}

impl ReapPlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.mark.is_empty() && self.unmark.is_empty()
    }
}

/// Decide which records to reap, mark or unmark at `now`.
///
/// A record is removed only when it has been absent for strictly longer than
/// `grace`, measured from its `orphaned_since` mark. Records absent without a
/// mark get one; nothing is removed on first sight.
pub fn plan_reap(
    records: &[MetadataRecord],
    rules: &[ForwardingRule],
    grace: Duration,
    now: DateTime<Utc>,
) -> ReapPlan {
    let live: HashSet<RuleId> = rules.iter().map(|r| r.id).collect();
    let mut plan = ReapPlan::default();

    for record in records {
        match (live.contains(&record.rule_id), record.orphaned_since) {
            (true, Some(_)) => plan.unmark.push(record.rule_id),
            (true, None) => {}
            (false, None) => plan.mark.push(record.rule_id),
            (false, Some(since)) if now - since > grace => plan.remove.push(record.rule_id),
            (false, Some(_)) => {}
        }
    }

    plan
}

/// Outcome of creating a rule together with its metadata.
#[derive(Debug)]
pub enum CreateOutcome {
    /// Rule and metadata both stored
    Annotated(MergedEntry),
    /// Rule exists upstream but its metadata was not stored; the entry
    /// carries empty metadata, which is what later merges will show.
    MetadataPersistFailed { entry: MergedEntry, error: MetaError },
}

impl CreateOutcome {
    pub fn entry(&self) -> &MergedEntry {
        match self {
            Self::Annotated(entry) => entry,
            Self::MetadataPersistFailed { entry, .. } => entry,
        }
    }

    pub fn warning(&self) -> Option<&MetaError> {
        match self {
            Self::Annotated(_) => None,
            Self::MetadataPersistFailed { error, .. } => Some(error),
        }
    }

    pub fn into_entry(self) -> MergedEntry {
        match self {
            Self::Annotated(entry) => entry,
            Self::MetadataPersistFailed { entry, .. } => entry,
        }
    }
}

/// Reconciliation service over an upstream API and a local store.
pub struct Reconciler {
    api: Arc<dyn StreamApi>,
    store: Arc<dyn MetadataStore>,
    port_range: PortRange,
    orphan_grace: Duration,
    recent_ports: RecentPorts,
}

impl Reconciler {
    pub fn new(api: Arc<dyn StreamApi>, store: Arc<dyn MetadataStore>, config: &Config) -> Self {
        let orphan_grace =
            Duration::from_std(config.orphan_grace).unwrap_or_else(|_| Duration::days(365 * 100));
        Self {
            api,
            store,
            port_range: config.port_range,
            orphan_grace,
            recent_ports: RecentPorts::new(config.recent_port_ttl),
        }
    }

    /// Fetch both sides, merge, and start the grace clock on new orphans.
    ///
    /// Fails as a whole if either read fails; a partial view is never returned.
    pub async fn list_view(&self, session: &Session) -> Result<Reconciliation> {
        let (rules, records) = tokio::join!(
            self.api.list_streams(session.token()),
            self.store.list_all()
        );
        let rules = rules?;
        let records = records.map_err(local_read_error)?;

        // Only the marking half of the plan; removal is left to reap_orphans
        let now = Utc::now();
        let plan = plan_reap(&records, &rules, self.orphan_grace, now);
        self.apply_marks(&plan, now).await;

        Ok(merge(rules, records))
    }

    /// Lowest free incoming port, counting ports this process just created.
    pub async fn suggest_port(&self, session: &Session) -> Result<u16> {
        let rules = self.api.list_streams(session.token()).await?;
        let mut used: HashSet<u16> = rules.iter().map(|r| r.incoming_port).collect();
        used.extend(self.recent_ports.active(Instant::now()));
        suggest_next_port(&used, self.port_range)
    }

    /// Create a rule upstream, then store its metadata under the new id.
    ///
    /// Upstream failure returns the error and writes nothing locally. A store
    /// failure after upstream success is reported as
    /// `CreateOutcome::MetadataPersistFailed`, not as an error.
    pub async fn create_annotated_rule(
        &self,
        session: &Session,
        spec: &RuleSpec,
        metadata: Metadata,
    ) -> Result<CreateOutcome> {
        spec.validate()?;
        let metadata = metadata.normalized();

        let rule = self
            .api
            .create_stream(session.token(), spec)
            .await
            .map_err(|e| {
                tracing::warn!(incoming_port = spec.incoming_port, error = %e, "Stream creation failed");
                e
            })?;
        self.recent_ports.record(rule.incoming_port, Instant::now());
        tracing::info!(
            rule_id = rule.id,
            incoming_port = rule.incoming_port,
            "Stream created"
        );

        let record = MetadataRecord::new(rule.id, metadata.clone());
        match self.store.upsert(&record).await {
            Ok(()) => Ok(CreateOutcome::Annotated(MergedEntry { rule, metadata })),
            Err(e) => {
                tracing::warn!(
                    rule_id = rule.id,
                    error = %e,
                    "Stream created but metadata was not saved"
                );
                let rule_id = rule.id;
                Ok(CreateOutcome::MetadataPersistFailed {
                    entry: MergedEntry {
                        rule,
                        metadata: Metadata::default(),
                    },
                    error: MetaError::MetadataPersistFailed {
                        rule_id,
                        reason: e.to_string(),
                    },
                })
            }
        }
    }

    /// Replace the metadata of an existing rule (last write wins).
    pub async fn annotate(
        &self,
        session: &Session,
        rule_id: RuleId,
        metadata: Metadata,
    ) -> Result<MergedEntry> {
        let rules = self.api.list_streams(session.token()).await?;
        let rule = rules
            .into_iter()
            .find(|r| r.id == rule_id)
            .ok_or(MetaError::RuleNotFound(rule_id))?;

        let metadata = metadata.normalized();
        self.store
            .upsert(&MetadataRecord::new(rule_id, metadata.clone()))
            .await
            .map_err(local_write_error)?;
        tracing::info!(rule_id, "Metadata updated");

        Ok(MergedEntry { rule, metadata })
    }

    /// Delete a rule upstream and its local metadata.
    ///
    /// Local cleanup runs whatever upstream answered; the upstream result is
    /// what the caller gets back.
    pub async fn delete_rule(&self, session: &Session, rule_id: RuleId) -> Result<()> {
        let upstream = self.api.delete_stream(session.token(), rule_id).await;
        let local = self.store.delete(rule_id).await;

        if let Err(e) = &local {
            // A leftover record is reaped once the grace window passes
            tracing::warn!(rule_id, error = %e, "Failed to remove local metadata");
        }

        match upstream {
            Ok(()) => {
                tracing::info!(rule_id, "Stream deleted");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(rule_id, error = %e, "Upstream stream deletion failed");
                Err(e)
            }
        }
    }

    /// Drop records absent upstream for longer than the grace window.
    ///
    /// Returns the ids actually removed.
    pub async fn reap_orphans(&self, session: &Session) -> Result<Vec<RuleId>> {
        let (rules, records) = tokio::join!(
            self.api.list_streams(session.token()),
            self.store.list_all()
        );
        let rules = rules?;
        let records = records.map_err(local_read_error)?;

        let now = Utc::now();
        let plan = plan_reap(&records, &rules, self.orphan_grace, now);
        self.apply_marks(&plan, now).await;

        let mut removed = Vec::with_capacity(plan.remove.len());
        for rule_id in plan.remove {
            match self.store.delete(rule_id).await {
                Ok(()) => removed.push(rule_id),
                Err(e) => tracing::warn!(rule_id, error = %e, "Failed to reap orphaned metadata"),
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), ids = ?removed, "Reaped orphaned metadata");
        }
        Ok(removed)
    }

    /// Persist orphan marks. Failures are logged; the next pass retries.
    ///
    /// Only the mark is written, so a record deleted or re-annotated since
    /// `records` was read is left as it is now.
    async fn apply_marks(&self, plan: &ReapPlan, now: DateTime<Utc>) {
        let marks = plan.mark.iter().map(|id| (*id, Some(now)));
        let unmarks = plan.unmark.iter().map(|id| (*id, None));

        for (rule_id, orphaned_since) in marks.chain(unmarks) {
            if let Err(e) = self.store.set_orphaned_since(rule_id, orphaned_since).await {
                tracing::warn!(rule_id, error = %e, "Failed to update orphan mark");
            } else if orphaned_since.is_some() {
                tracing::debug!(rule_id, "Metadata marked as orphaned");
            }
        }
    }
}

fn local_read_error(e: MetaError) -> MetaError {
    match e {
        MetaError::LocalStoreUnavailable(_) => e,
        other => MetaError::store(format!("Failed to read metadata: {}", other)),
    }
}

fn local_write_error(e: MetaError) -> MetaError {
    match e {
        MetaError::LocalStoreUnavailable(_) => e,
        other => MetaError::store(format!("Failed to write metadata: {}", other)),
    }
}
