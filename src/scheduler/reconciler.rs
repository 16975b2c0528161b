use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::media::MediaPlane;
use crate::lock::LockManager;
use crate::presence::{PresenceStatus, PresenceStore, RoomUser};
use crate::room::durable::{RoomInfoRepository, RoomSession};
use crate::room::{RoomStateStore, RoomStatus};
use crate::shared::StoreError;

pub const ACTIVE_ROOM_CHECKER: &str = "activeRoomChecker";
pub const EMPTY_ROOM_CHECKER: &str = "emptyRoomChecker";
pub const ENDED_ROOM_SWEEPER: &str = "endedRoomSweeper";

/// Configuration for the reconciliation loops
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub fast_interval: Duration,
    pub slow_interval: Duration,
    /// Rooms older than this are ended; `None` disables the policy
    pub max_room_duration: Option<Duration>,
    /// An online user without a heartbeat for this long is marked disconnected
    pub ping_timeout: Duration,
    /// A disconnected user who has not come back after this long goes offline
    pub offline_threshold: Duration,
    /// Age after which a room the media server reports empty is closed
    pub zero_participant_grace: Duration,
    pub task_lock_ttl: Duration,
    /// Delay between ending a room and removing its data
    pub cleanup_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(5),
            slow_interval: Duration::from_secs(120),
            max_room_duration: None,
            ping_timeout: Duration::from_secs(30),
            offline_threshold: Duration::from_secs(30),
            zero_participant_grace: Duration::from_secs(10 * 60),
            task_lock_ttl: Duration::from_secs(5 * 60),
            cleanup_grace: Duration::from_secs(30),
        }
    }
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// What one pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub rooms_scanned: usize,
    pub rooms_ended: usize,
    pub counts_corrected: usize,
    pub users_disconnected: usize,
    pub users_offline: usize,
    /// Ended rooms whose bus data was removed
    pub rooms_cleaned: usize,
    /// Rooms whose processing failed and was skipped
    pub failures: usize,
    /// Another process held the task lock, nothing was done
    pub lock_held: bool,
}

/// Periodic control loop that repairs drift between the bus, durable
/// storage and the media server
pub struct ReconciliationScheduler {
    rooms: Arc<RoomStateStore>,
    presence: Arc<PresenceStore>,
    locks: Arc<LockManager>,
    durable: Arc<dyn RoomInfoRepository>,
    media: Arc<dyn MediaPlane>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl ReconciliationScheduler {
    /// Intervals are clamped to at least one millisecond
    pub fn new(
        rooms: Arc<RoomStateStore>,
        presence: Arc<PresenceStore>,
        locks: Arc<LockManager>,
        durable: Arc<dyn RoomInfoRepository>,
        media: Arc<dyn MediaPlane>,
        mut config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        config.fast_interval = config.fast_interval.max(MIN_INTERVAL);
        config.slow_interval = config.slow_interval.max(MIN_INTERVAL);
        Self {
            rooms,
            presence,
            locks,
            durable,
            media,
            config,
            shutdown,
        }
    }

    /// Runs both cadences until the shutdown token fires
    pub async fn run(&self) {
        info!(
            fast_interval_secs = self.config.fast_interval.as_secs(),
            slow_interval_secs = self.config.slow_interval.as_secs(),
            "Starting reconciliation scheduler"
        );

        let mut fast = interval(self.config.fast_interval);
        let mut slow = interval(self.config.slow_interval);
        fast.set_missed_tick_behavior(MissedTickBehavior::Skip);
        slow.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Reconciliation scheduler stopping");
                    break;
                }
                _ = fast.tick() => {
                    match self.run_fast_tick(Utc::now()).await {
                        Ok(report) => debug!(?report, "Fast tick completed"),
                        Err(e) => error!(error = %e, "Fast tick failed"),
                    }
                }
                _ = slow.tick() => {
                    self.run_slow_tick(Utc::now()).await;
                }
            }
        }
    }

    /// Max-duration policy and presence decay for every durably active room
    #[instrument(skip(self))]
    pub async fn run_fast_tick(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();

        for session in self.durable.active_sessions().await? {
            report.rooms_scanned += 1;
            if let Err(e) = self.fast_tick_room(&session, now, &mut report).await {
                report.failures += 1;
                warn!(room_id = %session.room_id, error = %e, "Fast tick failed for room");
            }
        }
        Ok(report)
    }

    async fn fast_tick_room(
        &self,
        session: &RoomSession,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let Some(room) = self.rooms.read(&session.room_id).await? else {
            return Ok(());
        };

        if let (Some(max), Some(created_at)) = (self.config.max_room_duration, room.created_at) {
            if elapsed(now, created_at) >= max {
                info!(room_id = %room.room_id, "Room exceeded maximum duration");
                self.end_room(session, "max duration reached").await?;
                report.rooms_ended += 1;
                return Ok(());
            }
        }

        for RoomUser { user, status } in self.presence.scan_room_users(&room.room_id).await? {
            match (status, user.last_ping_at, user.disconnected_at) {
                (PresenceStatus::Online, Some(last_ping), _)
                    if elapsed(now, last_ping) >= self.config.ping_timeout =>
                {
                    if self
                        .presence
                        .transition_if(
                            &room.room_id,
                            &user.user_id,
                            PresenceStatus::Online,
                            PresenceStatus::Disconnected,
                        )
                        .await?
                    {
                        report.users_disconnected += 1;
                    }
                }
                (PresenceStatus::Disconnected, _, Some(disconnected_at))
                    if elapsed(now, disconnected_at) >= self.config.offline_threshold =>
                {
                    if self
                        .presence
                        .transition_if(
                            &room.room_id,
                            &user.user_id,
                            PresenceStatus::Disconnected,
                            PresenceStatus::Offline,
                        )
                        .await?
                    {
                        report.users_offline += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub async fn run_slow_tick(&self, now: DateTime<Utc>) {
        match self.run_active_room_checker(now).await {
            Ok(report) => info!(?report, "Active room check completed"),
            Err(e) => error!(error = %e, "Active room check failed"),
        }
        match self.run_empty_room_checker(now).await {
            Ok(report) => info!(?report, "Empty room check completed"),
            Err(e) => error!(error = %e, "Empty room check failed"),
        }
        match self.run_ended_room_sweeper(now).await {
            Ok(report) => info!(?report, "Ended room sweep completed"),
            Err(e) => error!(error = %e, "Ended room sweep failed"),
        }
    }

    /// Reconciles durably active rooms against the media server
    #[instrument(skip(self))]
    pub async fn run_active_room_checker(
        &self,
        now: DateTime<Utc>,
    ) -> Result<TickReport, StoreError> {
        let lease = match self
            .locks
            .try_scheduler_task(ACTIVE_ROOM_CHECKER, self.config.task_lock_ttl)
            .await
        {
            Ok(lease) => lease,
            Err(StoreError::LockHeld { .. }) => {
                return Ok(TickReport {
                    lock_held: true,
                    ..TickReport::default()
                })
            }
            Err(e) => return Err(e),
        };

        let result = self.check_active_rooms(now).await;
        self.locks.release(lease).await?;
        result
    }

    async fn check_active_rooms(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();

        for session in self.durable.active_sessions().await? {
            report.rooms_scanned += 1;

            let participants = match self.media.list_participants(&session.room_id).await {
                Ok(participants) => participants,
                Err(e) => {
                    report.failures += 1;
                    warn!(room_id = %session.room_id, error = %e, "Media plane query failed, skipping room");
                    continue;
                }
            };

            let outcome = match participants {
                None => self.end_if_dropped(&session, now).await,
                Some(participants) => {
                    let count = participants.len() as i32;
                    if count != session.joined_participants {
                        debug!(
                            room_id = %session.room_id,
                            recorded = session.joined_participants,
                            actual = count,
                            "Correcting participant count"
                        );
                        if let Err(e) = self.durable.update_participants(&session.room_sid, count).await {
                            warn!(room_id = %session.room_id, error = %e, "Could not correct participant count");
                        } else {
                            report.counts_corrected += 1;
                        }
                    }

                    if count == 0 && elapsed(now, session.created_at) >= self.config.zero_participant_grace {
                        info!(room_id = %session.room_id, "Closing long-lived empty room");
                        self.end_room(&session, "no participants").await.map(|_| true)
                    } else {
                        Ok(false)
                    }
                }
            };

            match outcome {
                Ok(true) => report.rooms_ended += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(room_id = %session.room_id, error = %e, "Failed to end room");
                }
            }
        }
        Ok(report)
    }

    /// A room nobody has joined yet is unknown to the media plane until its
    /// first participant arrives; it only counts as dropped once active or
    /// past the zero-participant grace
    async fn end_if_dropped(
        &self,
        session: &RoomSession,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if let Some(room) = self.rooms.read(&session.room_id).await? {
            let waiting = room.status == RoomStatus::Created
                && elapsed(now, session.created_at) < self.config.zero_participant_grace;
            if waiting {
                debug!(room_id = %session.room_id, "Room not on the media plane yet");
                return Ok(false);
            }
        }

        info!(room_id = %session.room_id, "Media plane no longer knows the room");
        self.end_room(session, "dropped by media plane").await?;
        Ok(true)
    }

    /// Removes rooms that ended more than `cleanup_grace` ago but still
    /// have data on the bus, e.g. when a delayed cleanup failed or the
    /// process stopped before it ran
    #[instrument(skip(self))]
    pub async fn run_ended_room_sweeper(
        &self,
        now: DateTime<Utc>,
    ) -> Result<TickReport, StoreError> {
        let lease = match self
            .locks
            .try_scheduler_task(ENDED_ROOM_SWEEPER, self.config.task_lock_ttl)
            .await
        {
            Ok(lease) => lease,
            Err(StoreError::LockHeld { .. }) => {
                return Ok(TickReport {
                    lock_held: true,
                    ..TickReport::default()
                })
            }
            Err(e) => return Err(e),
        };

        let result = self.sweep_ended_rooms(now).await;
        self.locks.release(lease).await?;
        result
    }

    async fn sweep_ended_rooms(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();

        for room in self.rooms.list_ended().await? {
            report.rooms_scanned += 1;
            let due = room
                .ended_at
                .map_or(true, |ended_at| elapsed(now, ended_at) >= self.config.cleanup_grace);
            if !due {
                continue;
            }

            match self.rooms.cleanup(&room.room_id).await {
                Ok(()) => report.rooms_cleaned += 1,
                Err(e) => {
                    report.failures += 1;
                    warn!(room_id = %room.room_id, error = %e, "Sweep cleanup failed");
                }
            }
        }
        Ok(report)
    }

    /// Ends rooms that have had no online user for longer than their empty timeout
    #[instrument(skip(self))]
    pub async fn run_empty_room_checker(
        &self,
        now: DateTime<Utc>,
    ) -> Result<TickReport, StoreError> {
        let lease = match self
            .locks
            .try_scheduler_task(EMPTY_ROOM_CHECKER, self.config.task_lock_ttl)
            .await
        {
            Ok(lease) => lease,
            Err(StoreError::LockHeld { .. }) => {
                return Ok(TickReport {
                    lock_held: true,
                    ..TickReport::default()
                })
            }
            Err(e) => return Err(e),
        };

        let result = self.check_empty_rooms(now).await;
        self.locks.release(lease).await?;
        result
    }

    async fn check_empty_rooms(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();

        for session in self.durable.active_sessions().await? {
            report.rooms_scanned += 1;
            match self.end_if_empty(&session, now).await {
                Ok(true) => report.rooms_ended += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(room_id = %session.room_id, error = %e, "Empty room check failed for room");
                }
            }
        }
        Ok(report)
    }

    async fn end_if_empty(
        &self,
        session: &RoomSession,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(room) = self.rooms.read(&session.room_id).await? else {
            return Ok(false);
        };
        let users = self.presence.scan_room_users(&room.room_id).await?;
        if users.iter().any(|u| u.status == PresenceStatus::Online) {
            return Ok(false);
        }

        let empty_since = users
            .iter()
            .filter_map(|u| u.user.disconnected_at)
            .chain(room.created_at)
            .max()
            .unwrap_or(session.created_at);

        if elapsed(now, empty_since) < Duration::from_secs(room.empty_timeout) {
            return Ok(false);
        }

        info!(room_id = %room.room_id, empty_timeout = room.empty_timeout, "Room empty past its timeout");
        self.end_room(session, "empty timeout").await?;
        Ok(true)
    }

    /// The single end-of-life path used by every policy
    async fn end_room(&self, session: &RoomSession, reason: &str) -> Result<(), StoreError> {
        if let Err(e) = self.media.end_room(&session.room_id).await {
            warn!(room_id = %session.room_id, error = %e, "Media plane end failed, continuing");
        }

        self.rooms.end(&session.room_id, reason).await?;
        self.durable.mark_ended(&session.room_sid).await?;
        self.schedule_cleanup(session.room_id.clone());
        Ok(())
    }

    fn schedule_cleanup(&self, room_id: String) {
        let rooms = Arc::clone(&self.rooms);
        let grace = self.config.cleanup_grace;
        let cancel = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(room_id = %room_id, "Shutdown before delayed cleanup");
                }
                _ = tokio::time::sleep(grace) => {
                    if let Err(e) = rooms.cleanup(&room_id).await {
                        warn!(room_id = %room_id, error = %e, "Delayed cleanup failed");
                    }
                }
            }
        });
    }
}

/// Time from `then` to `now`, zero if `then` is in the future
fn elapsed(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}
