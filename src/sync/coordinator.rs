//! Sync Coordinator: batched push of owed records, then pull of cloud state.
//!
//! Pushes are keyed by deterministic document ids and written with merge
//! semantics, so replaying an interrupted pass never creates a second
//! document. A record is marked synced only after its write is acknowledged.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::resolver::DedupResolver;
use crate::cloud::{document_id, CloudDocument, ScopedCloud, DRIVER_FIELD};
use crate::db::{timestamp, LocalStore};
use crate::errors::AppError;
use crate::models::{
    Advance, Client, Company, Driver, EntityKind, FuelEntry, PickupClientDistance,
    PickupLocation, RateSlab, Session, SyncRecord, Trip,
};

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pushed: usize,
    /// Records that reached the attempt ceiling during this pass.
    pub failed: usize,
    /// Records held back because their driver has no cloud id yet.
    pub deferred: usize,
    pub pulled: usize,
    pub skipped: usize,
    pub interrupted: bool,
}

/// Observable sync state for the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending: i64,
    pub failed: i64,
    pub running: bool,
    pub last_error: Option<String>,
    pub last_sync_at: Option<String>,
    pub last_report: Option<SyncReport>,
}

pub struct SyncCoordinator {
    store: LocalStore,
    cloud: ScopedCloud,
    resolver: DedupResolver,
    max_attempts: i64,
    status: watch::Sender<SyncStatus>,
    pass_lock: Mutex<()>,
    wake: Notify,
}

impl SyncCoordinator {
    pub fn new(store: LocalStore, cloud: ScopedCloud, max_attempts: i64) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            resolver: DedupResolver::new(store.clone()),
            store,
            cloud,
            max_attempts,
            status,
            pass_lock: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    pub fn max_attempts(&self) -> i64 {
        self.max_attempts
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Ask the background loop to run a pass now.
    pub fn request_sync(&self) {
        self.wake.notify_one();
    }

    /// Run one pass for the current tenant. Passes never overlap.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<SyncReport, AppError> {
        let _guard = self.pass_lock.lock().await;

        let session = self.cloud.scope().session();
        let Some(owner_id) = session.owner_id().map(str::to_string) else {
            tracing::debug!("No active session; sync pass skipped");
            return Ok(SyncReport::default());
        };

        self.status.send_modify(|s| s.running = true);
        tracing::info!(owner_id = owner_id.as_str(), "Sync pass started");

        let result = self.run_locked(&session, &owner_id, cancel).await;

        let counts = self.store.sync_counts(&owner_id, self.max_attempts).await;
        self.status.send_modify(|s| {
            s.running = false;
            if let Ok(counts) = &counts {
                s.pending = counts.pending;
                s.failed = counts.failed;
            }
            match &result {
                Ok(report) => {
                    s.last_error = None;
                    s.last_report = Some(*report);
                    if !report.interrupted {
                        s.last_sync_at = Some(timestamp());
                    }
                }
                Err(e) => s.last_error = Some(e.message()),
            }
        });

        match &result {
            Ok(report) => tracing::info!(
                owner_id = owner_id.as_str(),
                pushed = report.pushed,
                failed = report.failed,
                deferred = report.deferred,
                pulled = report.pulled,
                interrupted = report.interrupted,
                "Sync pass finished"
            ),
            Err(e) => tracing::warn!(owner_id = owner_id.as_str(), error = %e, "Sync pass aborted"),
        }
        result
    }

    /// Push everything owed, then pull. Pushes go kind by kind, drivers
    /// first, oldest-first within each kind: a driver-scoped record cannot be
    /// keyed until its driver has a cloud id, so ordering across kinds would
    /// only defer more records.
    async fn run_locked(
        &self,
        session: &Session,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, AppError> {
        let mut report = SyncReport::default();

        // Reference data first so financial records can resolve their driver
        self.push_kind::<Driver>(owner_id, cancel, &mut report).await?;
        self.push_kind::<Company>(owner_id, cancel, &mut report).await?;
        self.push_kind::<Client>(owner_id, cancel, &mut report).await?;
        self.push_kind::<PickupLocation>(owner_id, cancel, &mut report).await?;
        self.push_kind::<RateSlab>(owner_id, cancel, &mut report).await?;
        self.push_kind::<PickupClientDistance>(owner_id, cancel, &mut report).await?;
        self.push_kind::<Trip>(owner_id, cancel, &mut report).await?;
        self.push_kind::<FuelEntry>(owner_id, cancel, &mut report).await?;
        self.push_kind::<Advance>(owner_id, cancel, &mut report).await?;
        if report.interrupted {
            return Ok(report);
        }

        self.pull_kind::<Driver>(session, owner_id, &mut report).await?;
        self.pull_kind::<Company>(session, owner_id, &mut report).await?;
        self.pull_kind::<Client>(session, owner_id, &mut report).await?;
        self.pull_kind::<PickupLocation>(session, owner_id, &mut report).await?;
        self.pull_kind::<RateSlab>(session, owner_id, &mut report).await?;
        self.pull_kind::<PickupClientDistance>(session, owner_id, &mut report).await?;
        self.pull_kind::<Trip>(session, owner_id, &mut report).await?;
        self.pull_kind::<FuelEntry>(session, owner_id, &mut report).await?;
        self.pull_kind::<Advance>(session, owner_id, &mut report).await?;

        Ok(report)
    }

    async fn push_kind<T: SyncRecord>(
        &self,
        owner_id: &str,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<(), AppError> {
        if report.interrupted {
            return Ok(());
        }
        let pending = self.store.pending::<T>(owner_id, self.max_attempts).await?;
        for record in pending {
            if cancel.is_cancelled() {
                report.interrupted = true;
                return Ok(());
            }

            let local_id = record.meta().local_id;
            let Some((data, cloud_key)) = self.document_for(&record).await? else {
                tracing::debug!(table = T::KIND.table(), local_id, "Driver not synced yet; push deferred");
                report.deferred += 1;
                continue;
            };
            let doc_id = record
                .meta()
                .cloud_id
                .clone()
                .unwrap_or_else(|| document_id(owner_id, T::KIND.collection(), &cloud_key));

            match self
                .cloud
                .push(owner_id, T::KIND.collection(), &doc_id, data)
                .await
            {
                Ok(()) => {
                    match self
                        .store
                        .mark_synced(T::KIND, local_id, &doc_id, &timestamp())
                        .await
                    {
                        Ok(()) => report.pushed += 1,
                        Err(e @ AppError::Conflict(_)) => {
                            tracing::error!(table = T::KIND.table(), local_id, error = %e, "Pushed record could not be marked synced");
                            self.count_failure(T::KIND, local_id, &e, report).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_scope_violation() => return Err(e),
                Err(e) => self.count_failure(T::KIND, local_id, &e, report).await?,
            }
        }
        Ok(())
    }

    async fn count_failure(
        &self,
        kind: EntityKind,
        local_id: i64,
        error: &AppError,
        report: &mut SyncReport,
    ) -> Result<(), AppError> {
        let attempts = self
            .store
            .increment_sync_attempts(kind, local_id, &error.message())
            .await?;
        if attempts >= self.max_attempts {
            tracing::warn!(
                table = kind.table(),
                local_id,
                attempts,
                error = %error,
                "Record reached the sync attempt ceiling"
            );
            report.failed += 1;
        } else {
            tracing::debug!(table = kind.table(), local_id, attempts, error = %error, "Push failed; will retry");
        }
        Ok(())
    }

    /// Cloud form of a record and its device-independent key, or `None` if
    /// its driver has no cloud id yet.
    async fn document_for<T: SyncRecord>(
        &self,
        record: &T,
    ) -> Result<Option<(Value, String)>, AppError> {
        let mut data = serde_json::to_value(record)?;
        let Some(fields) = data.as_object_mut() else {
            return Err(AppError::Internal(format!(
                "{} did not serialize to an object",
                T::KIND.table()
            )));
        };
        fields.insert(
            "createdAt".to_string(),
            Value::String(record.meta().created_at.clone()),
        );

        let Some(driver_id) = record.driver_id() else {
            return Ok(Some((data, record.logical_key())));
        };
        let driver = self.store.get::<Driver>(driver_id).await?;
        let Some(driver_cloud_id) = driver.and_then(|d| d.meta.cloud_id) else {
            return Ok(None);
        };
        let cloud_key = format!("{}|{}", driver_cloud_id, record.fact_key());
        fields.insert(DRIVER_FIELD.to_string(), Value::String(driver_cloud_id));
        Ok(Some((data, cloud_key)))
    }

    async fn pull_kind<T: SyncRecord>(
        &self,
        session: &Session,
        owner_id: &str,
        report: &mut SyncReport,
    ) -> Result<(), AppError> {
        let mut documents = self.cloud.pull(owner_id, T::KIND.collection()).await?;
        if let Some(driver_cloud_id) = session.driver_cloud_id() {
            documents.retain(|doc| visible_to_driver(T::KIND, doc, driver_cloud_id));
        }

        self.cloud.scope().ensure("apply pull", owner_id)?;
        let applied = self
            .resolver
            .apply_documents::<T>(owner_id, &documents)
            .await?;
        report.pulled += applied.applied;
        report.skipped += applied.skipped;
        Ok(())
    }

    /// Make failed records eligible again and schedule a pass.
    pub async fn retry_failed(&self) -> Result<u64, AppError> {
        let owner_id = self.cloud.scope().require("retry")?;
        let reset = self.store.reset_failed(&owner_id, self.max_attempts).await?;
        let counts = self.store.sync_counts(&owner_id, self.max_attempts).await?;
        self.status.send_modify(|s| {
            s.pending = counts.pending;
            s.failed = counts.failed;
        });
        tracing::info!(owner_id = owner_id.as_str(), reset, "Failed records queued for retry");
        self.request_sync();
        Ok(reset)
    }

    /// Run passes on `interval` and whenever [`request_sync`](Self::request_sync) is called.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Sync loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = self.wake.notified() => {}
                }
                if let Err(e) = self.run_pass(&cancel).await {
                    tracing::warn!(error = %e, "Background sync pass failed");
                }
            }
        })
    }
}

/// A driver device only replicates its own profile and its own records.
fn visible_to_driver(kind: EntityKind, document: &CloudDocument, driver_cloud_id: &str) -> bool {
    match kind {
        EntityKind::Driver => document.id == driver_cloud_id,
        kind if kind.is_driver_scoped() => document.driver_cloud_id() == Some(driver_cloud_id),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudStore, ConsumeOutcome, MemoryCloudStore};
    use crate::db::init_database;
    use crate::models::{DriverLink, InviteCode, SyncMeta, SyncState};
    use crate::scope::ScopeManager;
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, Utc};
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    struct Harness {
        store: LocalStore,
        cloud: Arc<MemoryCloudStore>,
        scope: ScopeManager,
        coordinator: SyncCoordinator,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let cloud = Arc::new(MemoryCloudStore::new());
        harness_over(cloud.clone(), cloud).await
    }

    /// Harness whose coordinator talks to `transport` in front of `cloud`.
    async fn harness_over(cloud: Arc<MemoryCloudStore>, transport: Arc<dyn CloudStore>) -> Harness {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("test.sqlite"))
            .await
            .unwrap();
        let store = LocalStore::new(pool);
        let scope = ScopeManager::new();
        let coordinator = SyncCoordinator::new(
            store.clone(),
            ScopedCloud::new(transport, scope.scope()),
            3,
        );
        Harness {
            store,
            cloud,
            scope,
            coordinator,
            _dir: dir,
        }
    }

    type WriteHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

    /// Memory cloud that runs a hook once, right after the first document write lands.
    struct HookedCloud {
        inner: Arc<MemoryCloudStore>,
        hook: StdMutex<Option<WriteHook>>,
    }

    impl HookedCloud {
        fn new(inner: Arc<MemoryCloudStore>) -> Self {
            Self {
                inner,
                hook: StdMutex::new(None),
            }
        }

        fn after_first_write<F, Fut>(&self, hook: F)
        where
            F: FnOnce() -> Fut + Send + 'static,
            Fut: Future<Output = ()> + Send + 'static,
        {
            let hook: WriteHook =
                Box::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(hook()) });
            *self.hook.lock().unwrap() = Some(hook);
        }
    }

    #[async_trait]
    impl CloudStore for HookedCloud {
        async fn set_document(
            &self,
            owner_id: &str,
            collection: &str,
            doc_id: &str,
            data: Value,
        ) -> Result<(), AppError> {
            self.inner
                .set_document(owner_id, collection, doc_id, data)
                .await?;
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook().await;
            }
            Ok(())
        }

        async fn get_document(
            &self,
            owner_id: &str,
            collection: &str,
            doc_id: &str,
        ) -> Result<Option<CloudDocument>, AppError> {
            self.inner.get_document(owner_id, collection, doc_id).await
        }

        async fn list_documents(
            &self,
            owner_id: &str,
            collection: &str,
        ) -> Result<Vec<CloudDocument>, AppError> {
            self.inner.list_documents(owner_id, collection).await
        }

        async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>, AppError> {
            self.inner.get_invite(code).await
        }

        async fn create_invite(&self, invite: &InviteCode) -> Result<bool, AppError> {
            self.inner.create_invite(invite).await
        }

        async fn consume_invite(
            &self,
            code: &str,
            device_id: &str,
            used_at: DateTime<Utc>,
        ) -> Result<ConsumeOutcome, AppError> {
            self.inner.consume_invite(code, device_id, used_at).await
        }

        async fn put_driver_link(&self, link: &DriverLink) -> Result<(), AppError> {
            self.inner.put_driver_link(link).await
        }
    }

    fn driver(owner: &str, name: &str) -> Driver {
        Driver {
            meta: SyncMeta::new_local(owner),
            name: name.into(),
            phone: None,
            active: true,
        }
    }

    fn fuel(owner: &str, driver_id: i64, amount: f64) -> FuelEntry {
        FuelEntry {
            meta: SyncMeta::new_local(owner),
            driver_id,
            entry_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            amount,
            litres: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_pass_without_session_does_nothing() {
        let h = harness().await;
        h.store.insert(&driver("owner-1", "Raj")).await.unwrap();
        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(h.cloud.write_count(), 0);
    }

    #[tokio::test]
    async fn test_push_marks_synced_and_translates_driver() {
        let h = harness().await;
        h.scope.set_owner_session("owner-1").unwrap();
        let driver_id = h.store.insert(&driver("owner-1", "Raj")).await.unwrap();
        let fuel_id = h.store.insert(&fuel("owner-1", driver_id, 500.0)).await.unwrap();

        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(report.deferred, 0);

        let driver_row: Driver = h.store.get(driver_id).await.unwrap().unwrap();
        let fuel_row: FuelEntry = h.store.get(fuel_id).await.unwrap().unwrap();
        assert_eq!(fuel_row.meta.state(3), SyncState::Synced);

        let docs = h.cloud.list_documents("owner-1", "fuel").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, fuel_row.meta.cloud_id.clone().unwrap());
        assert_eq!(docs[0].driver_cloud_id(), driver_row.meta.cloud_id.as_deref());
        assert_eq!(docs[0].owner_id(), Some("owner-1"));
        assert!(docs[0].data.get("driverId").is_none());

        let status = h.coordinator.status();
        assert_eq!(status.pending, 0);
        assert!(status.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_failures_count_towards_ceiling() {
        let h = harness().await;
        h.scope.set_owner_session("owner-1").unwrap();
        let id = h.store.insert(&driver("owner-1", "Raj")).await.unwrap();
        h.cloud.set_offline(true);

        for _ in 0..3 {
            let _ = h.coordinator.run_pass(&CancellationToken::new()).await;
        }
        let row: Driver = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(row.meta.state(3), SyncState::Failed);
        assert_eq!(h.coordinator.status().failed, 1);

        // A failed record is not retried automatically
        h.cloud.set_offline(false);
        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed, 0);

        assert_eq!(h.coordinator.retry_failed().await.unwrap(), 1);
        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed, 1);
    }

    #[tokio::test]
    async fn test_record_waits_for_driver_cloud_id() {
        let h = harness().await;
        h.scope.set_owner_session("owner-1").unwrap();
        let driver_id = h.store.insert(&driver("owner-1", "Raj")).await.unwrap();
        h.store.insert(&fuel("owner-1", driver_id, 500.0)).await.unwrap();
        // First write (the driver) fails once; the fuel entry must not go out without it
        h.cloud.fail_next(1);

        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.deferred, 1);
        let fuel_row = h.store.list::<FuelEntry>("owner-1").await.unwrap();
        assert_eq!(fuel_row[0].meta.sync_attempts, 0);

        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed, 2);
    }

    #[tokio::test]
    async fn test_cancelled_pass_is_replayed_idempotently() {
        let h = harness().await;
        h.scope.set_owner_session("owner-1").unwrap();
        h.store.insert(&driver("owner-1", "Raj")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h.coordinator.run_pass(&cancel).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.pushed, 0);

        h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(h.cloud.list_documents("owner-1", "drivers").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_between_pushes_leaves_rest_pending() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let hooked = Arc::new(HookedCloud::new(cloud.clone()));
        let h = harness_over(cloud, hooked.clone()).await;
        h.scope.set_owner_session("owner-1").unwrap();
        for name in ["Raj", "Amit", "Vikram"] {
            h.store.insert(&driver("owner-1", name)).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        hooked.after_first_write(move || async move { token.cancel() });

        let report = h.coordinator.run_pass(&cancel).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.pushed, 1);
        assert_eq!(report.failed, 0);

        let drivers = h.store.list::<Driver>("owner-1").await.unwrap();
        let synced = drivers
            .iter()
            .filter(|d| d.meta.state(3) == SyncState::Synced)
            .count();
        assert_eq!(synced, 1);
        for waiting in drivers.iter().filter(|d| d.meta.cloud_id.is_none()) {
            assert_eq!(waiting.meta.sync_attempts, 0);
            assert!(waiting.meta.last_sync_error.is_none());
        }
        assert_eq!(h.store.pending::<Driver>("owner-1", 3).await.unwrap().len(), 2);
        assert_eq!(h.cloud.list_documents("owner-1", "drivers").await.unwrap().len(), 1);
        assert!(h.coordinator.status().last_sync_at.is_none());

        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(h.cloud.list_documents("owner-1", "drivers").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_replay_after_lost_mark_synced_writes_one_document() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let hooked = Arc::new(HookedCloud::new(cloud.clone()));
        let h = harness_over(cloud, hooked.clone()).await;
        h.scope.set_owner_session("owner-1").unwrap();
        let id = h.store.insert(&driver("owner-1", "Raj")).await.unwrap();

        // The write lands, then the session goes away before the local mark.
        let scope = h.scope.clone();
        hooked.after_first_write(move || async move { scope.logout() });

        let err = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_scope_violation());
        assert_eq!(h.cloud.list_documents("owner-1", "drivers").await.unwrap().len(), 1);
        let row: Driver = h.store.get(id).await.unwrap().unwrap();
        assert!(row.meta.cloud_id.is_none());
        assert_eq!(row.meta.sync_attempts, 0);

        h.scope.set_owner_session("owner-1").unwrap();
        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed, 1);

        let docs = h.cloud.list_documents("owner-1", "drivers").await.unwrap();
        assert_eq!(docs.len(), 1);
        let rows = h.store.list::<Driver>("owner-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].meta.cloud_id.as_deref(), Some(docs[0].id.as_str()));
        assert_eq!(rows[0].meta.state(3), SyncState::Synced);
    }

    #[tokio::test]
    async fn test_mark_synced_conflict_counts_as_attempt() {
        let cloud = Arc::new(MemoryCloudStore::new());
        let hooked = Arc::new(HookedCloud::new(cloud.clone()));
        let h = harness_over(cloud, hooked.clone()).await;
        h.scope.set_owner_session("owner-1").unwrap();
        let id = h.store.insert(&driver("owner-1", "Raj")).await.unwrap();

        // Another writer binds the row to a different document mid-push.
        let store = h.store.clone();
        hooked.after_first_write(move || async move {
            sqlx::query("UPDATE drivers SET cloud_id = 'elsewhere', dirty = 1 WHERE local_id = ?")
                .bind(id)
                .execute(store.pool())
                .await
                .unwrap();
        });

        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed, 0);
        let row: Driver = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(row.meta.sync_attempts, 1);
        assert!(row.meta.last_sync_error.is_some());
        assert_eq!(row.meta.state(3), SyncState::Pending);

        // The next push goes to the document the row is bound to.
        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed, 1);
        let row: Driver = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(row.meta.cloud_id.as_deref(), Some("elsewhere"));
        assert_eq!(row.meta.state(3), SyncState::Synced);
    }

    #[tokio::test]
    async fn test_driver_pull_only_sees_own_records() {
        let h = harness().await;
        for (id, name) in [("D1", "Raj"), ("D2", "Amit")] {
            h.cloud
                .seed_document("owner-1", "drivers", id, json!({ "ownerId": "owner-1", "name": name }))
                .await;
        }
        h.cloud
            .seed_document("owner-1", "fuel", "F1", json!({ "ownerId": "owner-1", "driverCloudId": "D1", "entryDate": "2024-03-01", "amount": 500.0 }))
            .await;
        h.cloud
            .seed_document("owner-1", "fuel", "F2", json!({ "ownerId": "owner-1", "driverCloudId": "D2", "entryDate": "2024-03-01", "amount": 700.0 }))
            .await;
        h.cloud
            .seed_document("owner-1", "companies", "C1", json!({ "ownerId": "owner-1", "name": "Acme" }))
            .await;

        h.scope.set_driver_session("D1", "owner-1").unwrap();
        let report = h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pulled, 3);

        let drivers = h.store.list::<Driver>("owner-1").await.unwrap();
        assert_eq!(drivers.len(), 1);
        assert_eq!(drivers[0].name, "Raj");
        let fuel = h.store.list::<FuelEntry>("owner-1").await.unwrap();
        assert_eq!(fuel.len(), 1);
        assert_eq!(fuel[0].meta.cloud_id.as_deref(), Some("F1"));
    }

    #[tokio::test]
    async fn test_status_published_after_pass() {
        let h = harness().await;
        h.scope.set_owner_session("owner-1").unwrap();
        h.store.insert(&driver("owner-1", "Raj")).await.unwrap();
        let mut status = h.coordinator.subscribe();

        h.cloud.set_offline(true);
        assert!(h.coordinator.run_pass(&CancellationToken::new()).await.is_err());
        assert!(status.has_changed().unwrap());
        let snapshot = status.borrow_and_update().clone();
        assert!(!snapshot.running);
        assert_eq!(snapshot.pending, 1);
        assert!(snapshot.last_error.is_some());

        h.cloud.set_offline(false);
        h.coordinator.run_pass(&CancellationToken::new()).await.unwrap();
        let snapshot = h.coordinator.status();
        assert_eq!(snapshot.pending, 0);
        assert!(snapshot.last_error.is_none());
        assert!(snapshot.last_sync_at.is_some());
        assert_eq!(snapshot.last_report.map(|r| r.pushed), Some(1));
    }

    #[tokio::test]
    async fn test_background_loop_runs_on_request() {
        let h = harness().await;
        h.scope.set_owner_session("owner-1").unwrap();
        let coordinator = Arc::new(h.coordinator);
        let cancel = CancellationToken::new();
        let task = coordinator
            .clone()
            .spawn(Duration::from_secs(3600), cancel.clone());

        let mut status = coordinator.subscribe();
        // The first tick fires immediately; wait for that pass to settle.
        while status.borrow_and_update().last_sync_at.is_none() {
            status.changed().await.unwrap();
        }

        h.store.insert(&driver("owner-1", "Raj")).await.unwrap();
        coordinator.request_sync();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.cloud.write_count() == 0 {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }
}
