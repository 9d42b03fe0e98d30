//! Export scheduler: owns the schedules, detects due ones on a fixed cadence
//! and dispatches each run to its own task.

use std::sync::Arc;
use std::time::Duration;

use audience_core::config::SchedulerConfig;
use audience_core::types::{Destination, ExportFormat};
use audience_core::{AudienceError, AudienceResult, Clock};
use audience_export::{ExportJob, ExportJobRunner, JobOutcome};
use chrono::FixedOffset;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::schedule::{ExportSchedule, ScheduleRequest};
use crate::store::ScheduleStore;
use crate::trigger::Trigger;

/// Marks a schedule as running until dropped.
struct RunClaim {
    in_flight: Arc<DashSet<Uuid>>,
    id: Uuid,
}

impl RunClaim {
    fn acquire(in_flight: &Arc<DashSet<Uuid>>, id: Uuid) -> Option<Self> {
        in_flight.insert(id).then(|| Self {
            in_flight: Arc::clone(in_flight),
            id,
        })
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

/// A run started by [`Scheduler::dispatch_due`].
pub struct DispatchHandle {
    pub schedule_id: Uuid,
    pub handle: JoinHandle<JobOutcome>,
}

/// Running control loop returned by [`Scheduler::start`].
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the due-check loop. Runs already dispatched keep going.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Scheduler loop ended abnormally");
        }
    }
}

pub struct Scheduler {
    schedules: DashMap<Uuid, ExportSchedule>,
    // Completed runs whose outcome did not reach the store. They count as run
    // for due detection but stay out of the visible state until persisted.
    unpersisted: DashMap<Uuid, ExportSchedule>,
    in_flight: Arc<DashSet<Uuid>>,
    store: Arc<dyn ScheduleStore>,
    runner: Arc<ExportJobRunner>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    tick: Duration,
    // Serializes store-then-memory updates so a completion never resurrects a
    // deleted schedule.
    mutation: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        runner: Arc<ExportJobRunner>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> AudienceResult<Self> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            AudienceError::config(format!(
                "scheduler.utc_offset_minutes {} is out of range",
                config.utc_offset_minutes
            ))
        })?;
        if config.tick_interval_secs == 0 {
            return Err(AudienceError::config(
                "scheduler.tick_interval_secs must be at least 1",
            ));
        }

        let schedules = DashMap::new();
        for schedule in store.load_all()? {
            schedules.insert(schedule.id, schedule);
        }
        info!(schedules = schedules.len(), offset = %offset, "Scheduler initialized");

        Ok(Self {
            schedules,
            unpersisted: DashMap::new(),
            in_flight: Arc::new(DashSet::new()),
            store,
            runner,
            clock,
            offset,
            tick: Duration::from_secs(config.tick_interval_secs),
            mutation: Mutex::new(()),
        })
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.in_flight.contains(&id)
    }

    pub fn create_schedule(&self, request: ScheduleRequest) -> AudienceResult<ExportSchedule> {
        let trigger = Trigger::from_request(request.interval_hours, request.run_time.as_deref())?;
        match self.runner.engine().get_segment(&request.segment_name) {
            Ok(_) => {}
            Err(AudienceError::NotFound(_)) => {
                return Err(AudienceError::config(format!(
                    "segment '{}' does not exist",
                    request.segment_name
                )))
            }
            Err(e) => return Err(e),
        }
        if !self.runner.registry().is_available(request.destination) {
            return Err(AudienceError::config(format!(
                "destination '{}' is not configured",
                request.destination.id()
            )));
        }

        let schedule = ExportSchedule {
            id: Uuid::new_v4(),
            segment_name: request.segment_name,
            format: request.format,
            destination: request.destination,
            trigger,
            created_at: self.clock.now(),
            last_run: None,
            last_status: None,
            last_error: None,
        };

        let _guard = self.mutation.lock();
        self.store.put(&schedule)?;
        self.schedules.insert(schedule.id, schedule.clone());
        info!(
            schedule_id = %schedule.id,
            segment = %schedule.segment_name,
            format = %schedule.format,
            destination = %schedule.destination,
            "Export schedule created"
        );
        Ok(schedule)
    }

    /// All schedules, oldest first.
    pub fn list_schedules(&self) -> Vec<ExportSchedule> {
        let mut all: Vec<ExportSchedule> =
            self.schedules.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn get_schedule(&self, id: Uuid) -> AudienceResult<ExportSchedule> {
        self.schedules
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| AudienceError::NotFound(format!("schedule '{id}'")))
    }

    pub fn delete_schedule(&self, id: Uuid) -> AudienceResult<()> {
        let _guard = self.mutation.lock();
        if !self.schedules.contains_key(&id) {
            return Err(AudienceError::NotFound(format!("schedule '{id}'")));
        }
        self.store.delete(id)?;
        self.schedules.remove(&id);
        self.unpersisted.remove(&id);
        info!(schedule_id = %id, running = self.is_running(id), "Export schedule deleted");
        Ok(())
    }

    /// Runs a one-off export of a saved segment and waits for its outcome.
    pub async fn export_now(
        &self,
        segment_name: &str,
        format: ExportFormat,
        destination: Destination,
    ) -> AudienceResult<JobOutcome> {
        let segment = self.runner.engine().get_segment(segment_name)?;
        let job = ExportJob {
            segment,
            format,
            destination,
            schedule_id: None,
        };
        Ok(self.runner.run(&job).await)
    }

    /// Claims and spawns every schedule that is due now. Schedules with a run
    /// still outstanding are skipped.
    pub fn dispatch_due(self: &Arc<Self>) -> Vec<DispatchHandle> {
        self.retry_unpersisted();
        let now = self.clock.now();
        let ids: Vec<Uuid> = self.schedules.iter().map(|s| *s.key()).collect();
        let candidates: Vec<Uuid> = ids
            .into_iter()
            .filter(|id| self.current(*id).is_some_and(|s| s.is_due(now, self.offset)))
            .collect();

        let mut dispatched = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(claim) = RunClaim::acquire(&self.in_flight, id) else {
                debug!(schedule_id = %id, "Previous run still in flight, skipping");
                continue;
            };
            // Re-read under the claim: a run that just finished may have
            // updated last_run since the snapshot.
            let Some(schedule) = self.current(id).filter(|s| s.is_due(now, self.offset)) else {
                continue;
            };

            metrics::counter!("scheduler.dispatched").increment(1);
            debug!(
                schedule_id = %id,
                segment = %schedule.segment_name,
                "Dispatching export"
            );
            let scheduler = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let _claim = claim;
                let outcome = scheduler.run_schedule(&schedule).await;
                scheduler.complete(&schedule, &outcome);
                outcome
            });
            dispatched.push(DispatchHandle {
                schedule_id: id,
                handle,
            });
        }
        dispatched
    }

    /// State due detection works from: a run whose outcome is still waiting
    /// for the store counts as run.
    fn current(&self, id: Uuid) -> Option<ExportSchedule> {
        if !self.schedules.contains_key(&id) {
            return None;
        }
        self.unpersisted
            .get(&id)
            .map(|s| s.value().clone())
            .or_else(|| self.schedules.get(&id).map(|s| s.value().clone()))
    }

    /// Writes back run outcomes whose earlier durable write failed.
    fn retry_unpersisted(&self) {
        let pending: Vec<Uuid> = self.unpersisted.iter().map(|e| *e.key()).collect();
        for id in pending {
            let _guard = self.mutation.lock();
            let Some((_, schedule)) = self.unpersisted.remove(&id) else {
                continue;
            };
            if !self.schedules.contains_key(&id) {
                continue;
            }
            match self.store.put(&schedule) {
                Ok(()) => {
                    info!(schedule_id = %id, "Run outcome persisted on retry");
                    self.schedules.insert(id, schedule);
                }
                Err(e) => {
                    debug!(schedule_id = %id, error = %e, "Run outcome still unpersisted");
                    self.unpersisted.insert(id, schedule);
                }
            }
        }
    }

    async fn run_schedule(&self, schedule: &ExportSchedule) -> JobOutcome {
        let segment = match self.runner.engine().get_segment(&schedule.segment_name) {
            Ok(segment) => segment,
            Err(e) => {
                warn!(
                    schedule_id = %schedule.id,
                    segment = %schedule.segment_name,
                    error = %e,
                    "Scheduled segment unavailable"
                );
                return JobOutcome::Failure {
                    reason: e.to_string(),
                };
            }
        };
        let job = ExportJob {
            segment,
            format: schedule.format,
            destination: schedule.destination,
            schedule_id: Some(schedule.id),
        };
        self.runner.run(&job).await
    }

    /// Folds an outcome into the live schedule, persisting first. When the
    /// write fails the outcome is parked in `unpersisted` so the export is not
    /// delivered again before its next trigger.
    fn complete(&self, dispatched: &ExportSchedule, outcome: &JobOutcome) {
        let _guard = self.mutation.lock();
        let pending = self.unpersisted.remove(&dispatched.id).map(|(_, s)| s);
        let parked = pending.is_some();
        let Some(mut schedule) = self
            .schedules
            .get(&dispatched.id)
            .map(|s| pending.unwrap_or_else(|| s.value().clone()))
        else {
            info!(
                schedule_id = %dispatched.id,
                success = outcome.is_success(),
                "Schedule deleted during run, outcome discarded"
            );
            return;
        };
        // A segment that disappeared mid-run is reported on the next dispatch.
        if outcome.is_success() && self.runner.engine().get_segment(&schedule.segment_name).is_err() {
            info!(
                schedule_id = %schedule.id,
                segment = %schedule.segment_name,
                "Segment deleted during run, outcome discarded"
            );
            if parked {
                self.unpersisted.insert(schedule.id, schedule);
            }
            return;
        }

        let error = match outcome {
            JobOutcome::Success { .. } => None,
            JobOutcome::Failure { reason } => Some(reason.clone()),
        };
        schedule.record_run(self.clock.now(), error);
        if let Err(e) = self.store.put(&schedule) {
            metrics::counter!("scheduler.persist_failures").increment(1);
            error!(
                schedule_id = %schedule.id,
                success = outcome.is_success(),
                error = %e,
                "Failed to persist run outcome, retrying on next tick"
            );
            self.unpersisted.insert(schedule.id, schedule);
            return;
        }
        self.schedules.insert(schedule.id, schedule);
    }

    /// Starts the due-check loop.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let tick = self.tick;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(tick_secs = tick.as_secs(), "Scheduler loop started");

            loop {
                tokio::select! {
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let dispatched = self.dispatch_due();
                        if !dispatched.is_empty() {
                            debug!(count = dispatched.len(), "Export runs dispatched");
                        }
                    }
                }
            }
            info!("Scheduler loop stopped");
        });
        SchedulerHandle { shutdown, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::RunStatus;
    use crate::store::{InMemoryScheduleStore, JsonScheduleStore};
    use async_trait::async_trait;
    use audience_cdp::{
        ConnectorRegistry, DeliveryAck, DeliveryMetadata, DestinationConnector, LocalConnector,
    };
    use audience_core::config::{DatasetConfig, QueryConfig};
    use audience_core::{DeliveryError, ManualClock, StoreError};
    use audience_segmentation::{
        ConditionSetBuilder, Dataset, InMemorySegmentStore, SegmentDefinition, SegmentationEngine,
    };
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const CSV: &str = "\
Id,Tier,Spend
1,gold,900
2,silver,120
3,gold,450
";

    /// Salesforce stand-in: fails while `failing` is set and can be held open
    /// until `release` is notified.
    #[derive(Default)]
    struct Scripted {
        failing: AtomicBool,
        hold: AtomicBool,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DestinationConnector for Scripted {
        fn destination(&self) -> Destination {
            Destination::Salesforce
        }

        async fn deliver(
            &self,
            payload: &[u8],
            metadata: &DeliveryMetadata,
        ) -> Result<DeliveryAck, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hold.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(DeliveryError::Transport("connection reset".into()));
            }
            Ok(DeliveryAck {
                destination: Destination::Salesforce,
                reference: format!("job-{}", metadata.segment_name),
                bytes: payload.len() as u64,
                digest: audience_cdp::payload_digest(payload),
                delivered_at: metadata.timestamp,
            })
        }
    }

    struct Harness {
        scheduler: Arc<Scheduler>,
        clock: Arc<ManualClock>,
        connector: Arc<Scripted>,
        _dir: tempfile::TempDir,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    async fn harness_with_store(store: Arc<dyn ScheduleStore>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let dataset = Dataset::from_csv_reader(CSV.as_bytes(), &DatasetConfig::default()).unwrap();
        let engine = SegmentationEngine::new(
            Arc::new(dataset),
            Arc::new(InMemorySegmentStore::new()),
            clock.clone(),
            &DatasetConfig::default(),
            &QueryConfig::default(),
        )
        .unwrap();
        engine
            .save_segment(
                "gold",
                SegmentDefinition::Conditions(ConditionSetBuilder::new().one_of("Tier", ["gold"]).build()),
                "ops",
            )
            .await
            .unwrap();

        let connector = Arc::new(Scripted::default());
        let registry = ConnectorRegistry::new(std::time::Duration::from_secs(5)).with_clock(clock.clone());
        registry.register(Arc::new(LocalConnector::new(dir.path())));
        registry.register(connector.clone());

        let runner = ExportJobRunner::new(Arc::new(engine), Arc::new(registry), clock.clone());
        let scheduler = Scheduler::new(
            store,
            Arc::new(runner),
            clock.clone(),
            &SchedulerConfig::default(),
        )
        .unwrap();
        Harness {
            scheduler: Arc::new(scheduler),
            clock,
            connector,
            _dir: dir,
        }
    }

    async fn harness() -> Harness {
        harness_with_store(Arc::new(InMemoryScheduleStore::new())).await
    }

    fn hourly(destination: Destination) -> ScheduleRequest {
        ScheduleRequest {
            segment_name: "gold".into(),
            format: ExportFormat::Csv,
            destination,
            interval_hours: Some(1),
            run_time: None,
        }
    }

    async fn dispatch_and_wait(scheduler: &Arc<Scheduler>) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        for dispatched in scheduler.dispatch_due() {
            outcomes.push(dispatched.handle.await.unwrap());
        }
        outcomes
    }

    #[tokio::test]
    async fn test_create_schedule_validates_input() {
        let h = harness().await;

        let mut missing = hourly(Destination::None);
        missing.segment_name = "platinum".into();
        assert!(matches!(
            h.scheduler.create_schedule(missing),
            Err(AudienceError::Configuration(_))
        ));

        assert!(matches!(
            h.scheduler.create_schedule(hourly(Destination::MetaAds)),
            Err(AudienceError::Configuration(_))
        ));

        let mut both = hourly(Destination::None);
        both.run_time = Some("08:00".into());
        assert!(h.scheduler.create_schedule(both).is_err());

        let created = h.scheduler.create_schedule(hourly(Destination::None)).unwrap();
        assert_eq!(created.created_at, start());
        assert_eq!(h.scheduler.list_schedules(), vec![created]);
    }

    #[tokio::test]
    async fn test_interval_schedule_runs_then_waits() {
        let h = harness().await;
        let schedule = h.scheduler.create_schedule(hourly(Destination::None)).unwrap();

        let outcomes = dispatch_and_wait(&h.scheduler).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success());

        let after = h.scheduler.get_schedule(schedule.id).unwrap();
        assert_eq!(after.last_run, Some(start()));
        assert_eq!(after.last_status, Some(RunStatus::Success));

        h.clock.advance(ChronoDuration::minutes(59));
        assert!(h.scheduler.dispatch_due().is_empty());

        h.clock.advance(ChronoDuration::minutes(1));
        assert_eq!(dispatch_and_wait(&h.scheduler).await.len(), 1);
    }

    #[tokio::test]
    async fn test_daily_schedule_fires_once_per_day() {
        let h = harness().await;
        let mut request = hourly(Destination::None);
        request.interval_hours = None;
        request.run_time = Some("12:00".into());
        h.scheduler.create_schedule(request).unwrap();

        // Created at 09:00, before the run time.
        assert!(h.scheduler.dispatch_due().is_empty());

        h.clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        assert_eq!(dispatch_and_wait(&h.scheduler).await.len(), 1);

        h.clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap());
        assert!(h.scheduler.dispatch_due().is_empty());

        h.clock.set(Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 30).unwrap());
        assert_eq!(dispatch_and_wait(&h.scheduler).await.len(), 1);
    }

    #[tokio::test]
    async fn test_connector_failure_is_recorded_and_retried_next_trigger() {
        let h = harness().await;
        h.connector.failing.store(true, Ordering::SeqCst);
        let schedule = h.scheduler.create_schedule(hourly(Destination::Salesforce)).unwrap();

        let outcomes = dispatch_and_wait(&h.scheduler).await;
        assert!(!outcomes[0].is_success());

        let failed = h.scheduler.get_schedule(schedule.id).unwrap();
        assert_eq!(failed.last_status, Some(RunStatus::Failure));
        assert!(failed.last_error.unwrap().contains("connection reset"));
        assert!(!h.scheduler.is_running(schedule.id));
        assert!(h.scheduler.dispatch_due().is_empty());

        h.connector.failing.store(false, Ordering::SeqCst);
        h.clock.advance(ChronoDuration::hours(1));
        let outcomes = dispatch_and_wait(&h.scheduler).await;
        assert!(outcomes[0].is_success());
        let recovered = h.scheduler.get_schedule(schedule.id).unwrap();
        assert_eq!(recovered.last_status, Some(RunStatus::Success));
        assert!(recovered.last_error.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_runs_once() {
        let h = harness().await;
        h.connector.hold.store(true, Ordering::SeqCst);
        let schedule = h.scheduler.create_schedule(hourly(Destination::Salesforce)).unwrap();

        let first = h.scheduler.dispatch_due();
        assert_eq!(first.len(), 1);
        assert!(h.scheduler.is_running(schedule.id));

        // Still due, but claimed.
        assert!(h.scheduler.dispatch_due().is_empty());
        let racing: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = Arc::clone(&h.scheduler);
                tokio::spawn(async move { scheduler.dispatch_due().len() })
            })
            .collect();
        for task in racing {
            assert_eq!(task.await.unwrap(), 0);
        }

        h.connector.hold.store(false, Ordering::SeqCst);
        h.connector.release.notify_one();
        for dispatched in first {
            assert!(dispatched.handle.await.unwrap().is_success());
        }
        assert_eq!(h.connector.calls.load(Ordering::SeqCst), 1);
        assert!(!h.scheduler.is_running(schedule.id));
        assert!(h.scheduler.dispatch_due().is_empty());
    }

    #[tokio::test]
    async fn test_missing_segment_recorded_as_failure() {
        let h = harness().await;
        let schedule = h.scheduler.create_schedule(hourly(Destination::None)).unwrap();
        h.scheduler.runner.engine().delete_segment("gold").unwrap();

        let outcomes = dispatch_and_wait(&h.scheduler).await;
        assert!(matches!(&outcomes[0], JobOutcome::Failure { reason } if reason.contains("gold")));
        let after = h.scheduler.get_schedule(schedule.id).unwrap();
        assert_eq!(after.last_status, Some(RunStatus::Failure));
        assert_eq!(h.connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_schedule_deleted_mid_run_discards_outcome() {
        let h = harness().await;
        h.connector.hold.store(true, Ordering::SeqCst);
        let schedule = h.scheduler.create_schedule(hourly(Destination::Salesforce)).unwrap();

        let running = h.scheduler.dispatch_due();
        h.scheduler.delete_schedule(schedule.id).unwrap();
        assert!(matches!(
            h.scheduler.delete_schedule(schedule.id),
            Err(AudienceError::NotFound(_))
        ));

        h.connector.hold.store(false, Ordering::SeqCst);
        h.connector.release.notify_one();
        for dispatched in running {
            assert!(dispatched.handle.await.unwrap().is_success());
        }
        assert!(h.scheduler.list_schedules().is_empty());
    }

    struct FailingStore {
        inner: InMemoryScheduleStore,
        broken: AtomicBool,
    }

    impl ScheduleStore for FailingStore {
        fn load_all(&self) -> Result<Vec<ExportSchedule>, StoreError> {
            self.inner.load_all()
        }

        fn put(&self, schedule: &ExportSchedule) -> Result<(), StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Io("disk full".into()));
            }
            self.inner.put(schedule)
        }

        fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Io("disk full".into()));
            }
            self.inner.delete(id)
        }
    }

    #[tokio::test]
    async fn test_store_failure_leaves_state_unchanged() {
        let store = Arc::new(FailingStore {
            inner: InMemoryScheduleStore::new(),
            broken: AtomicBool::new(false),
        });
        let h = harness_with_store(store.clone()).await;
        let schedule = h.scheduler.create_schedule(hourly(Destination::None)).unwrap();

        store.broken.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.scheduler.create_schedule(hourly(Destination::None)),
            Err(AudienceError::Store(_))
        ));
        assert!(h.scheduler.delete_schedule(schedule.id).is_err());
        assert_eq!(h.scheduler.list_schedules().len(), 1);

        // The run itself succeeds but its outcome cannot be persisted.
        let outcomes = dispatch_and_wait(&h.scheduler).await;
        assert!(outcomes[0].is_success());
        assert!(h.scheduler.get_schedule(schedule.id).unwrap().last_run.is_none());

        store.broken.store(false, Ordering::SeqCst);
        assert!(h.scheduler.dispatch_due().is_empty());
        let persisted = store.inner.load_all().unwrap();
        assert_eq!(persisted[0].last_run, Some(start()));
        assert_eq!(
            h.scheduler.get_schedule(schedule.id).unwrap().last_status,
            Some(RunStatus::Success)
        );
    }

    #[tokio::test]
    async fn test_unpersisted_outcome_is_not_delivered_again() {
        let store = Arc::new(FailingStore {
            inner: InMemoryScheduleStore::new(),
            broken: AtomicBool::new(false),
        });
        let h = harness_with_store(store.clone()).await;
        let schedule = h.scheduler.create_schedule(hourly(Destination::Salesforce)).unwrap();
        store.broken.store(true, Ordering::SeqCst);

        assert!(dispatch_and_wait(&h.scheduler).await[0].is_success());
        for _ in 0..3 {
            h.clock.advance(ChronoDuration::minutes(1));
            assert!(h.scheduler.dispatch_due().is_empty());
        }
        assert_eq!(h.connector.calls.load(Ordering::SeqCst), 1);
        assert!(h.scheduler.get_schedule(schedule.id).unwrap().last_run.is_none());

        // The next trigger still fires while the store is down.
        h.clock.set(start() + ChronoDuration::hours(1));
        assert_eq!(dispatch_and_wait(&h.scheduler).await.len(), 1);
        assert_eq!(h.connector.calls.load(Ordering::SeqCst), 2);

        store.broken.store(false, Ordering::SeqCst);
        assert!(h.scheduler.dispatch_due().is_empty());
        assert_eq!(
            h.scheduler.get_schedule(schedule.id).unwrap().last_run,
            Some(start() + ChronoDuration::hours(1))
        );
    }

    #[tokio::test]
    async fn test_schedules_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");

        let h = harness_with_store(Arc::new(JsonScheduleStore::open(&path).unwrap())).await;
        let schedule = h.scheduler.create_schedule(hourly(Destination::None)).unwrap();
        dispatch_and_wait(&h.scheduler).await;

        let reopened = harness_with_store(Arc::new(JsonScheduleStore::open(&path).unwrap())).await;
        let restored = reopened.scheduler.get_schedule(schedule.id).unwrap();
        assert_eq!(restored.last_run, Some(start()));
        assert_eq!(restored.last_status, Some(RunStatus::Success));
    }

    #[tokio::test]
    async fn test_export_now() {
        let h = harness().await;
        let outcome = h
            .scheduler
            .export_now("gold", ExportFormat::Json, Destination::Salesforce)
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert!(matches!(
            h.scheduler
                .export_now("bronze", ExportFormat::Json, Destination::None)
                .await,
            Err(AudienceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_bad_config() {
        let h = harness().await;
        let runner = Arc::clone(&h.scheduler.runner);
        let bad_offset = SchedulerConfig {
            utc_offset_minutes: 24 * 60,
            ..SchedulerConfig::default()
        };
        assert!(Scheduler::new(
            Arc::new(InMemoryScheduleStore::new()),
            Arc::clone(&runner),
            h.clock.clone(),
            &bad_offset
        )
        .is_err());

        let no_tick = SchedulerConfig {
            tick_interval_secs: 0,
            ..SchedulerConfig::default()
        };
        assert!(Scheduler::new(Arc::new(InMemoryScheduleStore::new()), runner, h.clock.clone(), &no_tick).is_err());
    }

    #[tokio::test]
    async fn test_loop_dispatches_until_stopped() {
        let h = harness().await;
        let schedule = h.scheduler.create_schedule(hourly(Destination::None)).unwrap();

        let handle = Arc::clone(&h.scheduler).start();
        // The first interval tick completes immediately.
        for _ in 0..200 {
            if h.scheduler.get_schedule(schedule.id).unwrap().last_run.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        handle.stop().await;

        assert_eq!(
            h.scheduler.get_schedule(schedule.id).unwrap().last_status,
            Some(RunStatus::Success)
        );
    }
}
