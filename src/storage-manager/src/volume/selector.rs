//! Selection of the volume new objects are written to.
//!
//! Each group has one active write volume, its `WritableDefault`. The
//! selector re-checks the free space of that volume on a throttled
//! schedule and, once it drops to the configured minimum, walks the group
//! ring (`next` links) to promote the first volume that can take writes.
//! When the walk finds nothing the group is exhausted until space is freed
//! or the group is reset.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::config::GroupConfig;
use common::units::MinFreeSpace;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::registry::VolumeRegistry;
use super::{Availability, NewVolume, Volume, VolumeError, VolumeStatus};
use crate::events::{ArchiveEvent, EventBus};

/// Selection parameters of one storage group.
#[derive(Debug, Clone)]
pub struct SelectorSettings {
    pub group_id: String,
    pub retrieve_aet: String,
    pub availability: Availability,
    pub min_free_space: MinFreeSpace,
    pub min_check_interval: Duration,
    pub max_check_interval: Duration,
    pub fallback_directory: Option<PathBuf>,
}

impl SelectorSettings {
    pub fn from_config(group: &GroupConfig) -> Result<Self, VolumeError> {
        Ok(Self {
            group_id: group.id.clone(),
            retrieve_aet: group.retrieve_aet.clone(),
            availability: group.availability.parse()?,
            min_free_space: group.min_free_space,
            min_check_interval: group.check_free_space_min_interval,
            max_check_interval: group.check_free_space_max_interval,
            fallback_directory: group.fallback_directory.as_ref().map(PathBuf::from),
        })
    }
}

/// Delay until the next free space check of a volume with `free` bytes.
///
/// Scales with the headroom above the minimum: a volume with ten times the
/// minimum free is checked ten `min_interval`s later, capped at
/// `max_interval`.
pub fn next_check_delay(
    free: u64,
    min_free: u64,
    min_interval: Duration,
    max_interval: Duration,
) -> Duration {
    if min_free == 0 {
        return max_interval;
    }
    let ratio = free as f64 / min_free as f64;
    Duration::try_from_secs_f64(min_interval.as_secs_f64() * ratio)
        .unwrap_or(max_interval)
        .min(max_interval)
}

/// Result of a free space check of the active volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The active volume keeps enough headroom
    Retained(Volume),
    /// A ring walk promoted another volume after visiting `visited` volumes
    Switched { volume: Volume, visited: usize },
    /// Another caller switched while this one waited
    AlreadySwitched(Volume),
    Exhausted { visited: usize },
}

impl CheckOutcome {
    fn into_volume(self, group_id: &str) -> Result<Volume, VolumeError> {
        match self {
            CheckOutcome::Retained(volume)
            | CheckOutcome::Switched { volume, .. }
            | CheckOutcome::AlreadySwitched(volume) => Ok(volume),
            CheckOutcome::Exhausted { .. } => {
                Err(VolumeError::GroupExhausted(group_id.to_string()))
            }
        }
    }
}

#[derive(Debug)]
struct ActiveVolume {
    volume: Volume,
    /// Resolved on the first successful check
    min_free_bytes: Option<u64>,
    next_check: Instant,
}

#[derive(Debug)]
enum SelectorState {
    Uninitialized,
    Active(ActiveVolume),
    Exhausted { retry_at: Instant },
}

#[derive(Debug)]
pub struct VolumeSelector {
    registry: Arc<VolumeRegistry>,
    settings: SelectorSettings,
    events: EventBus,
    state: Mutex<SelectorState>,
}

impl VolumeSelector {
    pub fn new(
        registry: Arc<VolumeRegistry>,
        settings: SelectorSettings,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            settings,
            events,
            state: Mutex::new(SelectorState::Uninitialized),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.settings.group_id
    }

    pub fn settings(&self) -> &SelectorSettings {
        &self.settings
    }

    /// Volume new objects of the group should be written to.
    ///
    /// Initializes the group on first use and runs the free space check when
    /// it is due. Fails with `GroupExhausted` while no volume can take writes.
    pub async fn current_volume(&self) -> Result<Volume, VolumeError> {
        let (volume, min_free) = {
            let mut state = self.state.lock().await;
            self.ensure_initialized(&mut state).await?;
            match &*state {
                SelectorState::Active(active) if Instant::now() < active.next_check => {
                    return Ok(active.volume.clone());
                }
                SelectorState::Active(active) => {
                    (active.volume.clone(), active.min_free_bytes)
                }
                SelectorState::Exhausted { .. } | SelectorState::Uninitialized => {
                    return Err(VolumeError::GroupExhausted(self.settings.group_id.clone()));
                }
            }
        };

        self.check(volume, min_free)
            .await?
            .into_volume(&self.settings.group_id)
    }

    /// Check the active volume now, regardless of the throttle.
    pub async fn force_check(&self) -> Result<CheckOutcome, VolumeError> {
        let (volume, min_free) = {
            let mut state = self.state.lock().await;
            if let SelectorState::Exhausted { retry_at } = &mut *state {
                *retry_at = Instant::now();
            }
            self.ensure_initialized(&mut state).await?;
            match &*state {
                SelectorState::Active(active) => (active.volume.clone(), active.min_free_bytes),
                SelectorState::Exhausted { .. } | SelectorState::Uninitialized => {
                    return Ok(CheckOutcome::Exhausted { visited: 0 });
                }
            }
        };
        self.check(volume, min_free).await
    }

    /// Make the next `current_volume` call re-check free space, then run it.
    pub async fn on_space_freed(&self) {
        {
            let mut state = self.state.lock().await;
            match &mut *state {
                SelectorState::Uninitialized => return,
                SelectorState::Active(active) => active.next_check = Instant::now(),
                SelectorState::Exhausted { retry_at } => *retry_at = Instant::now(),
            }
        }
        match self.current_volume().await {
            Ok(volume) => tracing::debug!(
                group_id = %self.settings.group_id,
                volume_id = volume.id,
                "Re-evaluated write volume after deletion"
            ),
            Err(e) => tracing::warn!(
                group_id = %self.settings.group_id,
                error = %e,
                "No write volume after deletion"
            ),
        }
    }

    /// Forget the active volume; the next call re-initializes the group.
    pub async fn reset_group(&self) {
        *self.state.lock().await = SelectorState::Uninitialized;
        tracing::info!(group_id = %self.settings.group_id, "Volume selection reset");
    }

    /// Remove a volume from the registry and re-initialize the group.
    pub async fn remove_volume(&self, id: i64) -> Result<Volume, VolumeError> {
        let removed = self.registry.remove_volume(id).await?;
        self.reset_group().await;
        Ok(removed)
    }

    /// Free bytes above the minimum, summed over the writable volumes of
    /// the group with the configured availability.
    pub async fn usable_bytes(&self) -> Result<u64, VolumeError> {
        let mut usable = 0u64;
        for volume in self
            .registry
            .volumes_in_group(&self.settings.group_id)
            .await?
        {
            if !self.is_candidate(&volume) {
                continue;
            }
            match self.measure(&volume, None).await {
                Ok((free, min_free)) => {
                    usable = usable.saturating_add(free.saturating_sub(min_free));
                }
                Err(e) => tracing::warn!(
                    volume_id = volume.id,
                    path = %volume.path,
                    error = %e,
                    "Skipping unusable volume"
                ),
            }
        }
        Ok(usable)
    }

    fn is_candidate(&self, volume: &Volume) -> bool {
        volume.status.is_writable() && volume.availability == self.settings.availability
    }

    async fn min_free_for(&self, volume: &Volume) -> Result<u64, VolumeError> {
        match self.settings.min_free_space {
            MinFreeSpace::Percent(_) => {
                let total = self.registry.total_bytes(volume).await?;
                Ok(self.settings.min_free_space.resolve(total))
            }
            other => Ok(other.resolve(0)),
        }
    }

    /// Free bytes and resolved minimum of a volume.
    async fn measure(
        &self,
        volume: &Volume,
        min_free: Option<u64>,
    ) -> Result<(u64, u64), VolumeError> {
        let free = self.registry.free_bytes(volume).await?;
        let min_free = match min_free {
            Some(bytes) => bytes,
            None => self.min_free_for(volume).await?,
        };
        Ok((free, min_free))
    }

    async fn ensure_initialized(&self, state: &mut SelectorState) -> Result<(), VolumeError> {
        match state {
            SelectorState::Active(_) => return Ok(()),
            SelectorState::Exhausted { retry_at } if Instant::now() < *retry_at => return Ok(()),
            _ => {}
        }
        let was_exhausted = matches!(state, SelectorState::Exhausted { .. });

        let group_id = &self.settings.group_id;
        let volume = match self.registry.writable_default(group_id).await? {
            Some(volume) => Some(volume),
            None => match &self.settings.fallback_directory {
                Some(dir) => Some(self.provision_fallback(dir).await?),
                None => None,
            },
        };

        match volume {
            Some(volume) => {
                tracing::info!(
                    group_id = %group_id,
                    volume_id = volume.id,
                    path = %volume.path,
                    "Initialized write volume"
                );
                *state = SelectorState::Active(ActiveVolume {
                    volume,
                    min_free_bytes: None,
                    next_check: Instant::now(),
                });
            }
            None => {
                if !was_exhausted {
                    tracing::error!(group_id = %group_id, "No writable volume configured");
                    self.events.emit(ArchiveEvent::VolumeExhausted {
                        group_id: group_id.clone(),
                    });
                }
                *state = SelectorState::Exhausted {
                    retry_at: Instant::now() + self.settings.min_check_interval,
                };
            }
        }
        Ok(())
    }

    async fn provision_fallback(&self, dir: &std::path::Path) -> Result<Volume, VolumeError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| VolumeError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        let path = dir.to_string_lossy().to_string();

        if let Some(existing) = self.registry.volume_by_path(&path).await? {
            if existing.group_id != self.settings.group_id {
                return Err(VolumeError::ForeignNext {
                    path: path.clone(),
                    next: path,
                    group: existing.group_id,
                });
            }
            return self
                .registry
                .update_status(existing.id, VolumeStatus::WritableDefault)
                .await;
        }

        tracing::info!(
            group_id = %self.settings.group_id,
            path = %path,
            "Provisioning volume from fallback directory"
        );
        self.registry
            .add_volume(NewVolume {
                group_id: self.settings.group_id.clone(),
                path,
                status: VolumeStatus::WritableDefault,
                availability: self.settings.availability,
                retrieve_aet: self.settings.retrieve_aet.clone(),
                next: None,
            })
            .await
    }

    async fn check(
        &self,
        volume: Volume,
        min_free: Option<u64>,
    ) -> Result<CheckOutcome, VolumeError> {
        match self.measure(&volume, min_free).await {
            Ok((free, min_free)) if free > min_free => {
                let delay = next_check_delay(
                    free,
                    min_free,
                    self.settings.min_check_interval,
                    self.settings.max_check_interval,
                );
                let mut state = self.state.lock().await;
                if let SelectorState::Active(active) = &mut *state {
                    if active.volume.id == volume.id {
                        active.min_free_bytes = Some(min_free);
                        active.next_check = Instant::now() + delay;
                    }
                }
                tracing::debug!(
                    volume_id = volume.id,
                    free_bytes = free,
                    min_free_bytes = min_free,
                    next_check_secs = delay.as_secs(),
                    "Write volume has headroom"
                );
                Ok(CheckOutcome::Retained(volume))
            }
            Ok((free, min_free)) => {
                tracing::info!(
                    group_id = %self.settings.group_id,
                    volume_id = volume.id,
                    free_bytes = free,
                    min_free_bytes = min_free,
                    "Write volume reached minimum free space"
                );
                self.switch_from(&volume).await
            }
            Err(e) => {
                tracing::warn!(
                    group_id = %self.settings.group_id,
                    volume_id = volume.id,
                    path = %volume.path,
                    error = %e,
                    "Write volume unusable"
                );
                self.switch_from(&volume).await
            }
        }
    }

    async fn switch_from(&self, current: &Volume) -> Result<CheckOutcome, VolumeError> {
        let mut state = self.state.lock().await;
        match &*state {
            SelectorState::Active(active) if active.volume.id != current.id => {
                return Ok(CheckOutcome::AlreadySwitched(active.volume.clone()));
            }
            SelectorState::Active(_) => {}
            SelectorState::Exhausted { .. } | SelectorState::Uninitialized => {
                return Ok(CheckOutcome::Exhausted { visited: 0 });
            }
        }

        let group_id = &self.settings.group_id;
        let mut visited = HashSet::from([current.id]);
        let mut next = current.next.clone();

        while let Some(path) = next {
            let Some(candidate) = self.registry.volume_by_path(&path).await? else {
                tracing::warn!(group_id = %group_id, next = %path, "Ring points at unknown volume");
                break;
            };
            if candidate.group_id != *group_id {
                tracing::warn!(
                    group_id = %group_id,
                    next = %path,
                    other_group = %candidate.group_id,
                    "Ring points into another group"
                );
                break;
            }
            if !visited.insert(candidate.id) {
                break;
            }

            if self.is_candidate(&candidate) {
                match self.measure(&candidate, None).await {
                    Ok((free, min_free)) if free > min_free => {
                        let promoted = self
                            .registry
                            .update_status(candidate.id, VolumeStatus::WritableDefault)
                            .await?;
                        let delay = next_check_delay(
                            free,
                            min_free,
                            self.settings.min_check_interval,
                            self.settings.max_check_interval,
                        );
                        *state = SelectorState::Active(ActiveVolume {
                            volume: promoted.clone(),
                            min_free_bytes: Some(min_free),
                            next_check: Instant::now() + delay,
                        });

                        tracing::info!(
                            group_id = %group_id,
                            from = current.id,
                            to = promoted.id,
                            path = %promoted.path,
                            visited = visited.len(),
                            "Switched write volume"
                        );
                        self.events.emit(ArchiveEvent::VolumeSwitched {
                            group_id: group_id.clone(),
                            from: Some(current.id),
                            to: promoted.id,
                            path: promoted.path.clone(),
                        });
                        return Ok(CheckOutcome::Switched {
                            volume: promoted,
                            visited: visited.len(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(
                        volume_id = candidate.id,
                        error = %e,
                        "Ring volume unusable"
                    ),
                }
            }
            next = candidate.next.clone();
        }

        tracing::error!(
            group_id = %group_id,
            visited = visited.len(),
            "No volume of the group can take writes"
        );
        *state = SelectorState::Exhausted {
            retry_at: Instant::now() + self.settings.min_check_interval,
        };
        self.events.emit(ArchiveEvent::VolumeExhausted {
            group_id: group_id.clone(),
        });
        Ok(CheckOutcome::Exhausted {
            visited: visited.len(),
        })
    }
}
