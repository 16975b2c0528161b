use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::ConnectionAuthorizer;
use crate::bus::Substrate;
use crate::cache::LocalCache;
use crate::config::CoreConfig;
use crate::dispatch::TaskQueue;
use crate::event::EventBus;
use crate::lock::LockManager;
use crate::presence::PresenceStore;
use crate::room::{RoomInfoRepository, RoomStateStore};
use crate::scheduler::{MediaPlane, ReconciliationScheduler, SchedulerConfig};
use crate::shared::AppState;

/// Every store and collaborator of one server process, wired together
///
/// All stores share one bus handle and one local cache.
pub struct CoreServices {
    pub bus: Arc<dyn Substrate>,
    pub events: EventBus,
    pub cache: LocalCache,
    pub locks: Arc<LockManager>,
    pub durable: Arc<dyn RoomInfoRepository>,
    pub media: Arc<dyn MediaPlane>,
    pub rooms: Arc<RoomStateStore>,
    pub presence: Arc<PresenceStore>,
    pub authorizer: Arc<ConnectionAuthorizer>,
    pub tasks: TaskQueue,
    scheduler_config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl CoreServices {
    pub fn build(
        bus: Arc<dyn Substrate>,
        durable: Arc<dyn RoomInfoRepository>,
        media: Arc<dyn MediaPlane>,
        config: &CoreConfig,
    ) -> Self {
        let replicas = config.bus_replicas;
        let events = EventBus::new(Arc::clone(&bus), replicas);
        let cache = LocalCache::new(Arc::clone(&bus));
        let locks = Arc::new(LockManager::new(Arc::clone(&bus), replicas));

        let rooms = Arc::new(RoomStateStore::new(
            Arc::clone(&bus),
            events.clone(),
            cache.clone(),
            Arc::clone(&locks),
            Arc::clone(&durable),
            config.room_store_settings(),
        ));
        let presence = Arc::new(PresenceStore::new(
            Arc::clone(&bus),
            events.clone(),
            cache.clone(),
            replicas,
        ));
        let authorizer = Arc::new(ConnectionAuthorizer::new(
            config.token_config(),
            Arc::clone(&rooms),
            Arc::clone(&presence),
            events.clone(),
        ));
        let tasks = TaskQueue::new(Arc::clone(&bus), replicas);

        Self {
            bus,
            events,
            cache,
            locks,
            durable,
            media,
            rooms,
            presence,
            authorizer,
            tasks,
            scheduler_config: config.scheduler_config(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            Arc::clone(&self.rooms),
            Arc::clone(&self.presence),
            Arc::clone(&self.authorizer),
        )
    }

    /// A scheduler bound to this process's shutdown token
    pub fn scheduler(&self) -> ReconciliationScheduler {
        ReconciliationScheduler::new(
            Arc::clone(&self.rooms),
            Arc::clone(&self.presence),
            Arc::clone(&self.locks),
            Arc::clone(&self.durable),
            Arc::clone(&self.media),
            self.scheduler_config.clone(),
            self.shutdown.clone(),
        )
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops background loops and drops every cached entry
    pub async fn shutdown(&self) {
        info!("Shutting down core services");
        self.shutdown.cancel();
        self.cache.shutdown().await;
    }
}
