use std::sync::Arc;
use std::time::Duration;

use roomcore::{
    bus::InMemorySubstrate,
    config::CoreConfig,
    presence::JoinAttributes,
    room::{CreateRoomRequest, InMemoryRoomInfoRepository, RoomRecord},
    scheduler::InMemoryMediaPlane,
    CoreServices,
};

// ============================================================================
// Test Setup Infrastructure
// ============================================================================

/// Several server processes sharing one bus, one database and one media server
pub struct TestSetup {
    pub bus: Arc<InMemorySubstrate>,
    pub durable: Arc<InMemoryRoomInfoRepository>,
    pub media: Arc<InMemoryMediaPlane>,
    pub processes: Vec<CoreServices>,
    pub room_id: String,
}

impl TestSetup {
    pub fn process(&self, index: usize) -> &CoreServices {
        &self.processes[index]
    }

    pub async fn create_room(&self) -> RoomRecord {
        self.process(0)
            .rooms
            .create(CreateRoomRequest::new(self.room_id.clone()))
            .await
            .expect("room creation should succeed")
    }

    /// Registers a user through the first process
    pub async fn add_user(&self, user_id: &str, is_admin: bool) {
        let attrs = JoinAttributes {
            name: user_id.to_string(),
            is_admin,
            ..JoinAttributes::default()
        };
        self.process(0)
            .presence
            .add_user(&self.room_id, user_id, attrs)
            .await
            .expect("user registration should succeed");
    }
}

pub struct TestSetupBuilder {
    process_count: usize,
    room_id: String,
    offline_threshold: Duration,
}

impl TestSetupBuilder {
    pub fn new() -> Self {
        Self {
            process_count: 1,
            room_id: "room-123".to_string(),
            offline_threshold: Duration::from_secs(30),
        }
    }

    pub fn with_processes(mut self, count: usize) -> Self {
        self.process_count = count;
        self
    }

    #[allow(dead_code)]
    pub fn with_offline_threshold(mut self, threshold: Duration) -> Self {
        self.offline_threshold = threshold;
        self
    }

    pub fn build(self) -> TestSetup {
        let bus = Arc::new(InMemorySubstrate::new());
        let durable = Arc::new(InMemoryRoomInfoRepository::new());
        let media = Arc::new(InMemoryMediaPlane::new());

        let mut config =
            CoreConfig::from_lookup(|_| None).expect("default configuration is valid");
        config.offline_threshold = self.offline_threshold;

        let processes = (0..self.process_count)
            .map(|_| CoreServices::build(bus.clone(), durable.clone(), media.clone(), &config))
            .collect();

        TestSetup {
            bus,
            durable,
            media,
            processes,
            room_id: self.room_id,
        }
    }
}
