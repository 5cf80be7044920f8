//! Recipient side of a shard merge or multitenant migration
//!
//! Phases: `started -> learned_filenames -> consistent -> done`, plus
//! `aborted`. Each phase action first checkpoints its durable marker and the
//! phase only moves once the marker is committed, so a new primary skips any
//! phase whose marker survived the failover. The recipient parks in
//! `consistent`, applying donor oplog, until the migration is forgotten.

use crate::common::storage::NS_MIGRATION_RECIPIENTS;
use crate::common::{Error, Result};
use crate::coordinator::document::{Progress, StateDocument, WorkloadPhase};
use crate::coordinator::workload::{PhaseContext, Transition, Workload, WorkloadError};
use crate::workloads::{ConnectionString, OpTime, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const DONOR_FILENAMES: &str = "donorFilenames";
const DONOR_SYNC_SOURCE: &str = "donorSyncSource";
const BACKUP_CURSOR_TS: &str = "backupCursorTimestamp";
const CLONE_FINISHED: &str = "cloneFinishedRecipientOpTime";
const START_FETCHING: &str = "startFetchingDonorOpTime";
const START_APPLYING: &str = "startApplyingDonorOpTime";
const DATA_CONSISTENT_STOP: &str = "dataConsistentStopDonorOpTime";
const NUM_OPS_APPLIED: &str = "numOpsApplied";
const DONOR_CONNECTION_RESTARTS: &str = "numRestartsDueToDonorConnectionFailure";

const RESERVED_DATABASES: &[&str] = &["admin", "local", "config"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationProtocol {
    ShardMerge,
    MultitenantMigrations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: String,
}

impl Default for ReadPreference {
    fn default() -> Self {
        Self {
            mode: "primary".to_string(),
        }
    }
}

/// Start (or rejoin) the recipient side of a migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientSyncRequest {
    pub migration_id: Uuid,
    pub protocol: MigrationProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub donor_connection_string: String,
    pub start_migration_donor_timestamp: Timestamp,
    #[serde(default)]
    pub read_preference: ReadPreference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_after_reaching_donor_timestamp: Option<Timestamp>,
    /// Opaque credentials presented to the donor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_certificate_for_donor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Started,
    LearnedFilenames,
    Consistent,
    Done,
    Aborted,
}

impl WorkloadPhase for MigrationPhase {
    fn initial() -> Self {
        MigrationPhase::Started
    }

    fn failed() -> Self {
        MigrationPhase::Aborted
    }

    fn next(self) -> Option<Self> {
        match self {
            MigrationPhase::Started => Some(MigrationPhase::LearnedFilenames),
            MigrationPhase::LearnedFilenames => Some(MigrationPhase::Consistent),
            MigrationPhase::Consistent => Some(MigrationPhase::Done),
            MigrationPhase::Done | MigrationPhase::Aborted => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Done | MigrationPhase::Aborted)
    }

    fn name(self) -> &'static str {
        match self {
            MigrationPhase::Started => "started",
            MigrationPhase::LearnedFilenames => "learned_filenames",
            MigrationPhase::Consistent => "consistent",
            MigrationPhase::Done => "done",
            MigrationPhase::Aborted => "aborted",
        }
    }
}

/// Files the donor pinned for this migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCursor {
    pub sync_source: String,
    pub filenames: Vec<String>,
    pub backup_cursor_ts: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedFiles {
    pub clone_finished_op_time: OpTime,
    pub start_fetching_op_time: OpTime,
    pub start_applying_op_time: OpTime,
}

/// Data movement primitives provided by the donor connection
pub trait MigrationDonor: Send + Sync {
    /// Pin the donor's files as of `start_at` on a member of `donor`.
    fn open_backup_cursor(
        &self,
        migration_id: Uuid,
        donor: &ConnectionString,
        start_at: Timestamp,
    ) -> std::result::Result<BackupCursor, WorkloadError>;

    fn import_files(
        &self,
        migration_id: Uuid,
        sync_source: &str,
        filenames: &[String],
    ) -> std::result::Result<ImportedFiles, WorkloadError>;

    /// Fetch and apply one oplog batch, returning the number of entries.
    fn apply_oplog_batch(&self, migration_id: Uuid) -> u64;
}

/// Donor living in the same process
pub struct InMemoryDonor {
    filenames: Vec<String>,
    ops_per_batch: u64,
    term: i64,
    failures: Mutex<VecDeque<WorkloadError>>,
    backup_cursors_opened: AtomicU64,
    files_imported: AtomicU64,
}

impl InMemoryDonor {
    pub fn new(filenames: Vec<String>) -> Self {
        Self {
            filenames,
            ops_per_batch: 1,
            term: 1,
            failures: Mutex::new(VecDeque::new()),
            backup_cursors_opened: AtomicU64::new(0),
            files_imported: AtomicU64::new(0),
        }
    }

    pub fn with_ops_per_batch(mut self, ops: u64) -> Self {
        self.ops_per_batch = ops;
        self
    }

    /// Make the next donor call fail with `error`
    pub fn fail_next(&self, error: WorkloadError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn backup_cursors_opened(&self) -> u64 {
        self.backup_cursors_opened.load(Ordering::SeqCst)
    }

    pub fn files_imported(&self) -> u64 {
        self.files_imported.load(Ordering::SeqCst)
    }

    fn injected(&self) -> std::result::Result<(), WorkloadError> {
        match self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl MigrationDonor for InMemoryDonor {
    fn open_backup_cursor(
        &self,
        _migration_id: Uuid,
        donor: &ConnectionString,
        start_at: Timestamp,
    ) -> std::result::Result<BackupCursor, WorkloadError> {
        self.injected()?;
        let sync_source = donor
            .hosts
            .first()
            .cloned()
            .ok_or_else(|| WorkloadError::Fatal(format!("{} has no members", donor)))?;
        self.backup_cursors_opened.fetch_add(1, Ordering::SeqCst);
        Ok(BackupCursor {
            sync_source,
            filenames: self.filenames.clone(),
            backup_cursor_ts: Timestamp::new(start_at.secs.saturating_add(1), 1),
        })
    }

    fn import_files(
        &self,
        _migration_id: Uuid,
        _sync_source: &str,
        filenames: &[String],
    ) -> std::result::Result<ImportedFiles, WorkloadError> {
        self.injected()?;
        self.files_imported
            .fetch_add(filenames.len() as u64, Ordering::SeqCst);
        let now = chrono::Utc::now().timestamp().max(1) as u32;
        Ok(ImportedFiles {
            clone_finished_op_time: OpTime::new(Timestamp::new(now, 2), self.term),
            start_fetching_op_time: OpTime::new(Timestamp::new(now, 1), self.term),
            start_applying_op_time: OpTime::new(Timestamp::new(now, 1), self.term),
        })
    }

    fn apply_oplog_batch(&self, _migration_id: Uuid) -> u64 {
        self.ops_per_batch
    }
}

pub struct MigrationRecipientWorkload {
    recipient: ConnectionString,
    donor: Arc<dyn MigrationDonor>,
    oplog_apply_interval: Duration,
}

impl MigrationRecipientWorkload {
    /// `recipient` is this replica set, used to reject self-migrations.
    pub fn new(
        recipient: ConnectionString,
        donor: Arc<dyn MigrationDonor>,
        oplog_apply_interval: Duration,
    ) -> Self {
        Self {
            recipient,
            donor,
            oplog_apply_interval,
        }
    }

    fn count_donor_failure(&self, ctx: &PhaseContext, err: WorkloadError) -> WorkloadError {
        if matches!(err, WorkloadError::Transient(_)) {
            ctx.live.increment(DONOR_CONNECTION_RESTARTS, 1);
        }
        err
    }

    fn decode<T: serde::de::DeserializeOwned>(
        progress: &Progress,
        field: &str,
    ) -> std::result::Result<T, WorkloadError> {
        let value = progress
            .get(field)
            .ok_or_else(|| WorkloadError::Fatal(format!("missing {}", field)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| WorkloadError::Fatal(format!("malformed {}: {}", field, e)))
    }
}

impl Workload for MigrationRecipientWorkload {
    type Phase = MigrationPhase;
    type Request = RecipientSyncRequest;

    const KIND: &'static str = "migration_recipient";
    const NAMESPACE: &'static str = NS_MIGRATION_RECIPIENTS;

    fn validate(&self, request: &Self::Request) -> Result<()> {
        match (request.protocol, request.tenant_id.as_deref()) {
            (MigrationProtocol::ShardMerge, Some(_)) => {
                return Err(Error::InvalidOptions(
                    "tenantId is not allowed with the shard merge protocol".into(),
                ));
            }
            (MigrationProtocol::MultitenantMigrations, None) => {
                return Err(Error::BadValue(
                    "tenantId is required with the multitenant migrations protocol".into(),
                ));
            }
            (MigrationProtocol::MultitenantMigrations, Some(tenant)) => {
                if tenant.is_empty() || RESERVED_DATABASES.contains(&tenant) {
                    return Err(Error::BadValue(format!(
                        "'{}' is not a valid tenant id",
                        tenant
                    )));
                }
            }
            (MigrationProtocol::ShardMerge, None) => {}
        }

        let donor = ConnectionString::parse(&request.donor_connection_string)?;
        if donor.overlaps(&self.recipient) {
            return Err(Error::BadValue(format!(
                "donor {} and recipient {} must be different replica sets",
                donor, self.recipient
            )));
        }

        if request.start_migration_donor_timestamp.is_null() {
            return Err(Error::BadValue(
                "startMigrationDonorTimestamp cannot be null".into(),
            ));
        }
        if request
            .return_after_reaching_donor_timestamp
            .is_some_and(|ts| ts.is_null())
        {
            return Err(Error::BadValue(
                "returnAfterReachingDonorTimestamp cannot be null".into(),
            ));
        }
        Ok(())
    }

    fn instance_key(&self, request: &Self::Request) -> String {
        request.migration_id.to_string()
    }

    fn fingerprint_fields(&self, request: &Self::Request) -> serde_json::Value {
        let mut fields = serde_json::to_value(request).unwrap_or_default();
        if let Some(map) = fields.as_object_mut() {
            map.remove("returnAfterReachingDonorTimestamp");
        }
        fields
    }

    fn wait_target(&self, _request: &Self::Request) -> Self::Phase {
        MigrationPhase::Consistent
    }

    fn awaits_forget(&self, phase: Self::Phase) -> bool {
        phase == MigrationPhase::Consistent
    }

    fn forget_target(&self, phase: Self::Phase) -> Option<Self::Phase> {
        match phase {
            MigrationPhase::Started | MigrationPhase::LearnedFilenames => {
                Some(MigrationPhase::Aborted)
            }
            _ => None,
        }
    }

    fn can_skip(&self, phase: Self::Phase, progress: &Progress) -> bool {
        match phase {
            MigrationPhase::Started => progress.contains_key(DONOR_FILENAMES),
            MigrationPhase::LearnedFilenames => progress.contains_key(CLONE_FINISHED),
            _ => false,
        }
    }

    async fn advance(
        &self,
        ctx: &PhaseContext,
        phase: Self::Phase,
        request: &Self::Request,
        progress: &Progress,
    ) -> std::result::Result<Transition<Self::Phase>, WorkloadError> {
        match phase {
            MigrationPhase::Started => {
                let donor = ConnectionString::parse(&request.donor_connection_string)
                    .map_err(|e| WorkloadError::Fatal(e.to_string()))?;
                let cursor = self
                    .donor
                    .open_backup_cursor(
                        request.migration_id,
                        &donor,
                        request.start_migration_donor_timestamp,
                    )
                    .map_err(|e| self.count_donor_failure(ctx, e))?;
                tracing::info!(
                    migration = %request.migration_id,
                    sync_source = %cursor.sync_source,
                    files = cursor.filenames.len(),
                    "Opened donor backup cursor"
                );
                Ok(Transition::to(MigrationPhase::Started)
                    .with(DONOR_SYNC_SOURCE, &cursor.sync_source)
                    .with(DONOR_FILENAMES, &cursor.filenames)
                    .with(BACKUP_CURSOR_TS, cursor.backup_cursor_ts))
            }
            MigrationPhase::LearnedFilenames => {
                let sync_source: String = Self::decode(progress, DONOR_SYNC_SOURCE)?;
                let filenames: Vec<String> = Self::decode(progress, DONOR_FILENAMES)?;
                let imported = self
                    .donor
                    .import_files(request.migration_id, &sync_source, &filenames)
                    .map_err(|e| self.count_donor_failure(ctx, e))?;
                tracing::info!(
                    migration = %request.migration_id,
                    files = filenames.len(),
                    "Imported donor files"
                );
                Ok(Transition::to(MigrationPhase::LearnedFilenames)
                    .with(CLONE_FINISHED, imported.clone_finished_op_time)
                    .with(START_FETCHING, imported.start_fetching_op_time)
                    .with(START_APPLYING, imported.start_applying_op_time)
                    .with(DATA_CONSISTENT_STOP, imported.clone_finished_op_time))
            }
            MigrationPhase::Consistent => {
                Ok(Transition::to(MigrationPhase::Done).with("completedAt", ctx.now))
            }
            MigrationPhase::Done | MigrationPhase::Aborted => Err(WorkloadError::Fatal(format!(
                "nothing to do in phase {}",
                phase.name()
            ))),
        }
    }

    async fn idle(&self, ctx: &PhaseContext, phase: Self::Phase, request: &Self::Request) {
        if phase != MigrationPhase::Consistent {
            return;
        }
        let mut ticker = tokio::time::interval(self.oplog_apply_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let applied = self.donor.apply_oplog_batch(request.migration_id);
            ctx.live.increment(NUM_OPS_APPLIED, applied);
        }
    }

    fn report(
        &self,
        doc: &StateDocument<Self::Phase, Self::Request>,
        live: &Progress,
    ) -> serde_json::Map<String, serde_json::Value> {
        let request = &doc.desired_state;
        let mut fields = serde_json::Map::new();
        fields.insert("instanceID".into(), json!(request.migration_id));
        fields.insert(
            "donorConnectionString".into(),
            json!(request.donor_connection_string),
        );
        fields.insert("readPreference".into(), json!(request.read_preference));
        if let Some(tenant) = &request.tenant_id {
            fields.insert("tenantId".into(), json!(tenant));
        }
        fields.insert(
            DONOR_CONNECTION_RESTARTS.into(),
            live.get(DONOR_CONNECTION_RESTARTS)
                .cloned()
                .unwrap_or_else(|| json!(0)),
        );
        fields.insert(
            "numRestartsDueToRecipientFailure".into(),
            json!(doc.num_restarts),
        );
        fields.insert("state".into(), json!(doc.phase.name()));
        fields.insert("garbageCollectable".into(), json!(doc.garbage_collectable));
        fields.insert("dataSyncCompleted".into(), json!(doc.forget_requested));
        fields.insert("receiveStart".into(), json!(doc.created_at));

        let reached = |phase: MigrationPhase| doc.phase >= phase;
        let mut copy = |field: &str| {
            if let Some(value) = doc.progress_field(field) {
                fields.insert(field.to_string(), value.clone());
            }
        };

        if reached(MigrationPhase::LearnedFilenames) {
            copy(DONOR_SYNC_SOURCE);
        }
        if reached(MigrationPhase::Consistent) {
            copy(START_FETCHING);
            copy(START_APPLYING);
            copy(CLONE_FINISHED);
            if request.protocol == MigrationProtocol::MultitenantMigrations {
                copy(DATA_CONSISTENT_STOP);
            }
        }
        if reached(MigrationPhase::Consistent) && doc.progress.contains_key(CLONE_FINISHED) {
            fields.insert(
                NUM_OPS_APPLIED.into(),
                live.get(NUM_OPS_APPLIED).cloned().unwrap_or_else(|| json!(0)),
            );
        }
        if let Some(expire_at) = doc.expire_at.filter(|_| doc.garbage_collectable) {
            fields.insert("expireAt".into(), json!(expire_at));
        }
        if let Some(reason) = &doc.failure {
            fields.insert("abortReason".into(), json!(reason));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::document::Fingerprint;
    use chrono::Utc;

    fn workload() -> MigrationRecipientWorkload {
        MigrationRecipientWorkload::new(
            ConnectionString::parse("recipient/r1:27017,r2:27017").unwrap(),
            Arc::new(InMemoryDonor::new(vec![
                "collection-1.wt".into(),
                "index-1.wt".into(),
            ])),
            Duration::from_millis(10),
        )
    }

    fn request() -> RecipientSyncRequest {
        RecipientSyncRequest {
            migration_id: Uuid::new_v4(),
            protocol: MigrationProtocol::MultitenantMigrations,
            tenant_id: Some("tenantA".into()),
            donor_connection_string: "donor/d1:27017,d2:27017".into(),
            start_migration_donor_timestamp: Timestamp::new(1, 1),
            read_preference: ReadPreference::default(),
            return_after_reaching_donor_timestamp: None,
            recipient_certificate_for_donor: Some("-----BEGIN CERTIFICATE-----".into()),
        }
    }

    #[test]
    fn test_validation_rules() {
        let w = workload();
        assert!(w.validate(&request()).is_ok());

        let mut r = request();
        r.protocol = MigrationProtocol::ShardMerge;
        assert!(matches!(w.validate(&r), Err(Error::InvalidOptions(_))));

        for tenant in ["", "admin", "local", "config"] {
            let mut r = request();
            r.tenant_id = Some(tenant.into());
            assert!(matches!(w.validate(&r), Err(Error::BadValue(_))), "{tenant}");
        }

        let mut r = request();
        r.donor_connection_string = "d1:27017".into();
        assert!(matches!(w.validate(&r), Err(Error::BadValue(_))));

        let mut r = request();
        r.donor_connection_string = "recipient/r1:27017".into();
        assert!(matches!(w.validate(&r), Err(Error::BadValue(_))));

        let mut r = request();
        r.donor_connection_string = "donor/d1:27017,r2:27017".into();
        assert!(matches!(w.validate(&r), Err(Error::BadValue(_))));

        let mut r = request();
        r.start_migration_donor_timestamp = Timestamp::new(0, 0);
        assert!(matches!(w.validate(&r), Err(Error::BadValue(_))));

        let mut r = request();
        r.return_after_reaching_donor_timestamp = Some(Timestamp::new(0, 1));
        assert!(matches!(w.validate(&r), Err(Error::BadValue(_))));
    }

    #[test]
    fn test_fingerprint_ignores_return_after_timestamp() {
        let w = workload();
        let a = request();
        let mut b = a.clone();
        b.return_after_reaching_donor_timestamp = Some(Timestamp::new(5, 1));
        assert_eq!(
            Fingerprint::of(&w.fingerprint_fields(&a)),
            Fingerprint::of(&w.fingerprint_fields(&b))
        );

        b.donor_connection_string = "other/o1:27017".into();
        assert_ne!(
            Fingerprint::of(&w.fingerprint_fields(&a)),
            Fingerprint::of(&w.fingerprint_fields(&b))
        );
    }

    #[tokio::test]
    async fn test_phase_actions_checkpoint_markers() {
        let w = workload();
        let r = request();
        let ctx = PhaseContext {
            instance_key: r.migration_id.to_string(),
            term: 1,
            live: Default::default(),
            now: Utc::now(),
        };

        let mut progress = Progress::new();
        assert!(!w.can_skip(MigrationPhase::Started, &progress));
        let t = w
            .advance(&ctx, MigrationPhase::Started, &r, &progress)
            .await
            .unwrap();
        assert_eq!(t.next, MigrationPhase::Started);
        progress.extend(t.progress);
        assert!(w.can_skip(MigrationPhase::Started, &progress));

        let t = w
            .advance(&ctx, MigrationPhase::LearnedFilenames, &r, &progress)
            .await
            .unwrap();
        progress.extend(t.progress);
        assert!(w.can_skip(MigrationPhase::LearnedFilenames, &progress));
    }

    #[tokio::test]
    async fn test_transient_donor_error_counts_restart() {
        let donor = Arc::new(InMemoryDonor::new(vec![]));
        let w = MigrationRecipientWorkload::new(
            ConnectionString::parse("recipient/r1:27017").unwrap(),
            donor.clone(),
            Duration::from_millis(10),
        );
        donor.fail_next(WorkloadError::Transient("connection reset".into()));

        let ctx = PhaseContext {
            instance_key: "m".into(),
            term: 1,
            live: Default::default(),
            now: Utc::now(),
        };
        let err = w
            .advance(&ctx, MigrationPhase::Started, &request(), &Progress::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkloadError::Transient(_)));
        assert_eq!(ctx.live.get_u64(DONOR_CONNECTION_RESTARTS), 1);
        assert_eq!(donor.backup_cursors_opened(), 0);
    }

    #[test]
    fn test_report_gates_fields_on_phase() {
        let w = workload();
        let r = request();
        let mut doc: StateDocument<MigrationPhase, RecipientSyncRequest> = StateDocument::new(
            r.migration_id.to_string(),
            r.clone(),
            Fingerprint::of(&w.fingerprint_fields(&r)),
            1,
            Utc::now(),
        );
        doc.progress.insert(DONOR_SYNC_SOURCE.into(), json!("d1:27017"));
        doc.progress
            .insert(START_FETCHING.into(), json!(OpTime::new(Timestamp::new(9, 1), 1)));
        doc.progress
            .insert(CLONE_FINISHED.into(), json!(OpTime::new(Timestamp::new(9, 2), 1)));

        let fields = w.report(&doc, &Progress::new());
        assert_eq!(fields["state"], "started");
        assert!(!fields.contains_key(DONOR_SYNC_SOURCE));

        doc.phase = MigrationPhase::LearnedFilenames;
        let fields = w.report(&doc, &Progress::new());
        assert_eq!(fields[DONOR_SYNC_SOURCE], "d1:27017");
        assert!(!fields.contains_key(START_FETCHING));
        assert!(!fields.contains_key(NUM_OPS_APPLIED));

        doc.phase = MigrationPhase::Consistent;
        let fields = w.report(&doc, &Progress::new());
        assert!(fields.contains_key(START_FETCHING));
        assert_eq!(fields[NUM_OPS_APPLIED], 0);
        assert!(!fields.contains_key("expireAt"));
    }
}
