//! Wiring of the storage manager components for one storage group.

use std::sync::Arc;

use anyhow::{Context, Result};
use common::config::{Configuration, QueueBackend};
use common::queue::{FileQueue, InMemoryQueue, Queue};
use tokio::sync::Mutex;

use crate::deletion::{
    DeleteOrderProcessor, DeletionScheduler, ExternalRetrieveChecker, NoExternalArchive,
    PassOutcome, RetryIntervals, SchedulerSettings,
};
use crate::events::EventBus;
use crate::metrics::DeletionMetrics;
use crate::orphan::{OrphanedFileSweeper, SweepOutcome};
use crate::retention::RetentionPolicy;
use crate::store::{ArchiveDatabase, ArchiveIndex, SqliteIndex};
use crate::task::PeriodicTask;
use crate::volume::{
    Availability, FsSpaceGauge, NewVolume, SelectorSettings, SpaceGauge, Volume, VolumeRegistry,
    VolumeSelector, VolumeStatus,
};

/// Result of [`StorageManager::run_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub pass: PassOutcome,
    pub orders_processed: usize,
    pub sweep: SweepOutcome,
}

pub struct StorageManagerBuilder {
    config: Configuration,
    gauge: Option<Arc<dyn SpaceGauge>>,
    external: Option<Arc<dyn ExternalRetrieveChecker>>,
    queue: Option<Arc<dyn Queue>>,
    events: Option<EventBus>,
}

impl StorageManagerBuilder {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            gauge: None,
            external: None,
            queue: None,
            events: None,
        }
    }

    /// Replace the file system space gauge.
    pub fn with_gauge(mut self, gauge: Arc<dyn SpaceGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn with_external_checker(mut self, checker: Arc<dyn ExternalRetrieveChecker>) -> Self {
        self.external = Some(checker);
        self
    }

    /// Use `queue` instead of the configured backend.
    pub fn with_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn build(self) -> Result<StorageManager> {
        let config = self.config;
        config.validate().context("Invalid configuration")?;

        let database = ArchiveDatabase::connect(&config.database.dsn)
            .await
            .with_context(|| format!("Failed to open archive database {}", config.database.dsn))?;

        let gauge: Arc<dyn SpaceGauge> = match self.gauge {
            Some(gauge) => gauge,
            None => Arc::new(FsSpaceGauge),
        };
        let registry = Arc::new(VolumeRegistry::new(
            database.pool().clone(),
            gauge,
            &config.group,
        ));
        seed_volumes(&registry, &config).await?;

        let events = self.events.unwrap_or_default();
        let selector_settings =
            SelectorSettings::from_config(&config.group).context("Invalid group configuration")?;
        let selector = Arc::new(VolumeSelector::new(
            Arc::clone(&registry),
            selector_settings,
            events.clone(),
        ));

        let policy = Arc::new(
            RetentionPolicy::new(&config.retention).context("Invalid retention configuration")?,
        );
        let retry_intervals: RetryIntervals = config
            .processor
            .retry_intervals
            .parse()
            .context("Invalid processor.retry_intervals")?;

        let index: Arc<dyn ArchiveIndex> = Arc::new(SqliteIndex::new(database.pool().clone()));
        let queue: Arc<dyn Queue> = match self.queue {
            Some(queue) => queue,
            None => match config.queue.backend {
                QueueBackend::Memory => Arc::new(InMemoryQueue::new()),
                QueueBackend::File => Arc::new(
                    FileQueue::open(&config.queue.dir)
                        .await
                        .with_context(|| format!("Failed to open queue in {}", config.queue.dir))?,
                ),
            },
        };
        let external: Arc<dyn ExternalRetrieveChecker> = match self.external {
            Some(external) => external,
            None => Arc::new(NoExternalArchive),
        };
        let metrics = DeletionMetrics::new();

        let scheduler = Arc::new(DeletionScheduler::new(
            SchedulerSettings::from_config(&config.group, &config.scheduler),
            Arc::clone(&policy),
            Arc::clone(&index),
            Arc::clone(&selector),
            Arc::clone(&queue),
            external,
            metrics.clone(),
        ));
        let processor = Arc::new(DeleteOrderProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&index),
            Arc::clone(&registry),
            Arc::clone(&selector),
            events.clone(),
            metrics.clone(),
            retry_intervals,
            config.queue.poll_interval,
        ));
        let sweeper = Arc::new(OrphanedFileSweeper::new(
            config.group.id.clone(),
            config.orphan.batch_size,
            Arc::clone(&index),
            Arc::clone(&registry),
            events.clone(),
            metrics.clone(),
        ));

        tracing::info!(
            group_id = %config.group.id,
            dsn = %config.database.dsn,
            queue = ?config.queue.backend,
            "Storage manager initialized"
        );

        Ok(StorageManager {
            config,
            database,
            registry,
            selector,
            policy,
            index,
            queue,
            events,
            metrics,
            scheduler,
            processor,
            sweeper,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Register configured volumes whose directory is not yet known.
async fn seed_volumes(registry: &VolumeRegistry, config: &Configuration) -> Result<()> {
    for seed in &config.group.volumes {
        if registry.volume_by_path(&seed.path).await?.is_some() {
            continue;
        }
        let status: VolumeStatus = seed
            .status
            .parse()
            .with_context(|| format!("Invalid status of volume {}", seed.path))?;
        let availability: Availability = seed
            .availability
            .parse()
            .with_context(|| format!("Invalid availability of volume {}", seed.path))?;

        let mut volume = NewVolume::new(config.group.id.clone(), seed.path.clone())
            .with_status(status)
            .with_availability(availability)
            .with_retrieve_aet(config.group.retrieve_aet.clone());
        if let Some(next) = &seed.next {
            volume = volume.with_next(next.clone());
        }
        let added = registry
            .add_volume(volume)
            .await
            .with_context(|| format!("Failed to register volume {}", seed.path))?;
        tracing::info!(
            volume_id = added.id,
            path = %added.path,
            status = %added.status,
            "Registered volume"
        );
    }
    Ok(())
}

/// Storage tiering and retention for one storage group.
pub struct StorageManager {
    config: Configuration,
    database: ArchiveDatabase,
    registry: Arc<VolumeRegistry>,
    selector: Arc<VolumeSelector>,
    policy: Arc<RetentionPolicy>,
    index: Arc<dyn ArchiveIndex>,
    queue: Arc<dyn Queue>,
    events: EventBus,
    metrics: DeletionMetrics,
    scheduler: Arc<DeletionScheduler>,
    processor: Arc<DeleteOrderProcessor>,
    sweeper: Arc<OrphanedFileSweeper>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl StorageManager {
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn database(&self) -> &ArchiveDatabase {
        &self.database
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    pub fn selector(&self) -> &Arc<VolumeSelector> {
        &self.selector
    }

    pub fn policy(&self) -> &Arc<RetentionPolicy> {
        &self.policy
    }

    pub fn index(&self) -> &Arc<dyn ArchiveIndex> {
        &self.index
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &DeletionMetrics {
        &self.metrics
    }

    pub fn scheduler(&self) -> &Arc<DeletionScheduler> {
        &self.scheduler
    }

    pub fn processor(&self) -> &Arc<DeleteOrderProcessor> {
        &self.processor
    }

    pub fn sweeper(&self) -> &Arc<OrphanedFileSweeper> {
        &self.sweeper
    }

    /// Volume new objects of the group should be written to.
    pub async fn write_volume(&self) -> Result<Volume> {
        Ok(self.selector.current_volume().await?)
    }

    /// Human readable summary of the active deletion criteria.
    pub fn show_criteria(&self) -> String {
        self.policy.describe_criteria()
    }

    /// Start the periodic scheduler, the order consumer and the sweeper.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        self.scheduler.resume();
        self.sweeper.resume();

        if let Err(e) = self.selector.current_volume().await {
            tracing::warn!(
                group_id = %self.config.group.id,
                error = %e,
                "No write volume at startup"
            );
        }
        tracing::info!("{}", self.policy.describe_criteria());

        if self.config.scheduler.enabled {
            let scheduler = Arc::clone(&self.scheduler);
            let metrics = self.metrics.clone();
            tasks.push(PeriodicTask::spawn(
                "deletion-scheduler",
                self.config.scheduler.interval,
                move || {
                    let scheduler = Arc::clone(&scheduler);
                    let metrics = metrics.clone();
                    async move {
                        match scheduler.run_pass().await {
                            Ok(PassOutcome::Completed(_)) => metrics.summary().log(),
                            Ok(PassOutcome::Skipped) => {}
                            Err(e) => tracing::error!(error = %e, "Deletion pass failed"),
                        }
                    }
                },
            ));
        } else {
            tracing::info!("Deletion scheduler is disabled (scheduler.enabled = false)");
        }

        self.processor.start().await;

        if self.config.orphan.enabled {
            let sweeper = Arc::clone(&self.sweeper);
            tasks.push(PeriodicTask::spawn(
                "orphan-sweeper",
                self.config.orphan.interval,
                move || {
                    let sweeper = Arc::clone(&sweeper);
                    async move {
                        if let Err(e) = sweeper.sweep().await {
                            tracing::error!(error = %e, "Orphan sweep failed");
                        }
                    }
                },
            ));
        }

        tracing::info!(group_id = %self.config.group.id, "Storage manager started");
    }

    /// Cancel running passes and wait for every background task. Later
    /// passes and sweeps end immediately until the next [`Self::start`].
    pub async fn stop(&self) {
        self.scheduler.cancel();
        self.sweeper.cancel();

        let tasks: Vec<PeriodicTask> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            tracing::debug!(task = task.name(), "Stopping");
            task.stop().await;
        }
        self.processor.stop().await;

        self.metrics.summary().log();
        tracing::info!(group_id = %self.config.group.id, "Storage manager stopped");
    }

    /// One deletion pass, then every due delete order, then one sweep.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let pass = self
            .scheduler
            .run_pass()
            .await
            .context("Deletion pass failed")?;
        let orders_processed = self
            .processor
            .drain()
            .await
            .context("Delete order processing failed")?;
        let sweep = self.sweeper.sweep().await.context("Orphan sweep failed")?;

        self.metrics.summary().log();
        Ok(CycleReport {
            pass,
            orders_processed,
            sweep,
        })
    }
}
