use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::events::{Envelope, RoomEvent};
use crate::bus::naming::{self, ChannelClass};
use crate::bus::{
    ConsumerConfig, FanoutMessage, RetentionPolicy, StreamConfig, StreamMessage, Substrate,
};
use crate::shared::StoreError;

/// Reliable and best-effort delivery for one process
///
/// Reliable messages go to the room's append-only log and are replayable;
/// best-effort messages are fanned out with no persistence.
#[derive(Clone)]
pub struct EventBus {
    bus: Arc<dyn Substrate>,
    replicas: usize,
    ack_wait: Duration,
}

/// A durable consumer a connection is allowed to pull from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerGrant {
    pub stream: String,
    pub consumer: String,
    pub filter_subject: String,
}

/// A decoded reliable message plus what is needed to acknowledge it
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub subject: String,
    pub sequence: u64,
    pub delivered: u32,
    pub envelope: Envelope<T>,
}

impl EventBus {
    pub fn new(bus: Arc<dyn Substrate>, replicas: usize) -> Self {
        Self {
            bus,
            replicas,
            ack_wait: Duration::from_secs(30),
        }
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Creates the room's reliable log; safe to call repeatedly
    #[instrument(skip(self))]
    pub async fn provision_room_stream(&self, room_id: &str) -> Result<(), StoreError> {
        self.bus
            .create_stream(StreamConfig {
                name: naming::room_stream(room_id),
                subjects: naming::room_stream_subjects(room_id),
                retention: RetentionPolicy::Limits,
                replicas: self.replicas,
            })
            .await?;
        debug!(room_id = %room_id, "Room stream provisioned");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_room_stream(&self, room_id: &str) -> Result<(), StoreError> {
        self.bus.delete_stream(&naming::room_stream(room_id)).await?;
        info!(room_id = %room_id, "Room stream deleted");
        Ok(())
    }

    /// Publishes a system event to one user, or to the whole room
    ///
    /// Fails if the room's log no longer exists.
    pub async fn publish(
        &self,
        room_id: &str,
        event: &RoomEvent,
        target_user_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        let sequence = self
            .publish_to(ChannelClass::System, room_id, event, target_user_id)
            .await?;

        debug!(
            room_id = %room_id,
            event_type = event.event_type(),
            target = ?target_user_id,
            sequence,
            "Room event published"
        );
        Ok(sequence)
    }

    /// Reliable publish on any reliable channel class
    pub async fn publish_to<T: Serialize>(
        &self,
        class: ChannelClass,
        room_id: &str,
        payload: &T,
        target_user_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        let subject = match target_user_id {
            Some(user_id) => {
                naming::validate_id("user", user_id)?;
                naming::private_subject(room_id, class, user_id)
            }
            None => naming::public_subject(room_id, class),
        };
        let envelope = Envelope::new(room_id, target_user_id, payload);
        let bytes = serde_json::to_vec(&envelope)?;

        Ok(self.bus.publish(&subject, bytes).await?)
    }

    /// Fire-and-forget fanout. Failures are logged and never returned.
    pub async fn broadcast<T: Serialize>(
        &self,
        class: ChannelClass,
        room_id: &str,
        payload: &T,
        target_user_id: Option<&str>,
    ) {
        let subject = match target_user_id {
            Some(user_id) => naming::fanout_user_subject(class, room_id, user_id),
            None => naming::fanout_subject(class, room_id),
        };

        let bytes = match serde_json::to_vec(&Envelope::new(room_id, target_user_id, payload)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(subject = %subject, error = %e, "Failed to encode best-effort message");
                return;
            }
        };

        if let Err(e) = self.bus.publish_fanout(&subject, bytes).await {
            warn!(subject = %subject, error = %e, "Best-effort publish failed");
        }
    }

    /// Subscribes to room-wide best-effort traffic of one class
    pub async fn subscribe(
        &self,
        class: ChannelClass,
        room_id: &str,
    ) -> Result<broadcast::Receiver<FanoutMessage>, StoreError> {
        Ok(self
            .bus
            .subscribe_fanout(&naming::fanout_subject(class, room_id))
            .await?)
    }

    /// Subscribes to best-effort traffic addressed to one user
    pub async fn subscribe_user(
        &self,
        class: ChannelClass,
        room_id: &str,
        user_id: &str,
    ) -> Result<broadcast::Receiver<FanoutMessage>, StoreError> {
        Ok(self
            .bus
            .subscribe_fanout(&naming::fanout_user_subject(class, room_id, user_id))
            .await?)
    }

    /// Provisions the room-shared consumers of every public reliable subject
    #[instrument(skip(self))]
    pub async fn ensure_public_consumers(
        &self,
        room_id: &str,
    ) -> Result<Vec<ConsumerGrant>, StoreError> {
        let mut grants = Vec::new();
        for class in ChannelClass::RELIABLE {
            let grant = ConsumerGrant {
                stream: naming::room_stream(room_id),
                consumer: naming::public_consumer(class),
                filter_subject: naming::public_subject(room_id, class),
            };
            self.create_consumer(&grant).await?;
            grants.push(grant);
        }
        Ok(grants)
    }

    /// Provisions one user's private consumers; also the user's delivery grant
    #[instrument(skip(self))]
    pub async fn ensure_user_consumers(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<Vec<ConsumerGrant>, StoreError> {
        naming::validate_id("user", user_id)?;

        let mut grants = Vec::new();
        for class in ChannelClass::RELIABLE {
            let grant = ConsumerGrant {
                stream: naming::room_stream(room_id),
                consumer: naming::private_consumer(class, user_id),
                filter_subject: naming::private_subject(room_id, class, user_id),
            };
            self.create_consumer(&grant).await?;
            grants.push(grant);
        }

        debug!(room_id = %room_id, user_id = %user_id, "User consumers provisioned");
        Ok(grants)
    }

    /// Removes a user's private consumers; a missing stream means nothing is left to remove
    #[instrument(skip(self))]
    pub async fn delete_user_consumers(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        naming::validate_id("user", user_id)?;
        let stream = naming::room_stream(room_id);
        if !self.bus.stream_exists(&stream).await? {
            return Ok(());
        }

        for class in ChannelClass::RELIABLE {
            self.bus
                .delete_consumer(&stream, &naming::private_consumer(class, user_id))
                .await?;
        }
        Ok(())
    }

    /// Pulls and decodes up to `max` reliable messages for a consumer
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        room_id: &str,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery<T>>, StoreError> {
        let messages = self
            .bus
            .fetch(&naming::room_stream(room_id), consumer, max, wait)
            .await?;

        let mut deliveries = Vec::with_capacity(messages.len());
        for message in messages {
            match decode_delivery(&message) {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => {
                    // Poison message: acknowledge so it is not redelivered forever
                    warn!(
                        subject = %message.subject,
                        sequence = message.sequence,
                        error = %e,
                        "Dropping undecodable message"
                    );
                    self.bus
                        .ack(&message.stream, consumer, message.sequence)
                        .await?;
                }
            }
        }
        Ok(deliveries)
    }

    pub async fn ack(&self, room_id: &str, consumer: &str, sequence: u64) -> Result<(), StoreError> {
        self.bus
            .ack(&naming::room_stream(room_id), consumer, sequence)
            .await?;
        Ok(())
    }

    async fn create_consumer(&self, grant: &ConsumerGrant) -> Result<(), StoreError> {
        let mut config = ConsumerConfig::new(&grant.consumer, Some(grant.filter_subject.clone()));
        config.ack_wait = self.ack_wait;
        self.bus
            .create_or_update_consumer(&grant.stream, config)
            .await?;
        Ok(())
    }
}

fn decode_delivery<T: DeserializeOwned>(
    message: &StreamMessage,
) -> Result<Delivery<T>, serde_json::Error> {
    Ok(Delivery {
        subject: message.subject.clone(),
        sequence: message.sequence,
        delivered: message.delivered,
        envelope: serde_json::from_slice(&message.payload)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, InMemorySubstrate};

    fn event_bus() -> (Arc<InMemorySubstrate>, EventBus) {
        let substrate = Arc::new(InMemorySubstrate::new());
        let bus = EventBus::new(substrate.clone(), 1);
        (substrate, bus)
    }

    #[tokio::test]
    async fn test_publish_requires_room_stream() {
        let (_, bus) = event_bus();
        let event = RoomEvent::SessionEnded {
            reason: "done".into(),
        };

        let result = bus.publish("r1", &event, None).await;
        assert!(matches!(
            result,
            Err(StoreError::Bus(BusError::NoStreamForSubject(_)))
        ));
    }

    #[tokio::test]
    async fn test_private_publish_only_reaches_target_consumer() {
        let (_, bus) = event_bus();
        bus.provision_room_stream("r1").await.unwrap();
        bus.ensure_user_consumers("r1", "u1").await.unwrap();
        bus.ensure_user_consumers("r1", "u2").await.unwrap();

        let event = RoomEvent::UserNotification {
            from_user_id: "u3".into(),
            message: "hand raised".into(),
        };
        bus.publish("r1", &event, Some("u1")).await.unwrap();

        let u1_consumer = naming::private_consumer(ChannelClass::System, "u1");
        let u2_consumer = naming::private_consumer(ChannelClass::System, "u2");

        let for_u1: Vec<Delivery<RoomEvent>> = bus
            .fetch("r1", &u1_consumer, 10, Duration::ZERO)
            .await
            .unwrap();
        let for_u2: Vec<Delivery<RoomEvent>> = bus
            .fetch("r1", &u2_consumer, 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(for_u1.len(), 1);
        assert_eq!(for_u1[0].envelope.payload, event);
        assert_eq!(for_u1[0].envelope.target_user_id.as_deref(), Some("u1"));
        assert!(for_u2.is_empty());
    }

    #[tokio::test]
    async fn test_public_order_is_preserved() {
        let (_, bus) = event_bus();
        bus.provision_room_stream("r1").await.unwrap();
        bus.ensure_public_consumers("r1").await.unwrap();

        for user in ["a", "b", "c"] {
            bus.publish(
                "r1",
                &RoomEvent::UserLeft {
                    user_id: user.into(),
                },
                None,
            )
            .await
            .unwrap();
        }

        let consumer = naming::public_consumer(ChannelClass::System);
        let deliveries: Vec<Delivery<RoomEvent>> =
            bus.fetch("r1", &consumer, 10, Duration::ZERO).await.unwrap();
        let order: Vec<String> = deliveries
            .iter()
            .map(|d| match &d.envelope.payload {
                RoomEvent::UserLeft { user_id } => user_id.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_consumer_provisioning_is_idempotent() {
        let (substrate, bus) = event_bus();
        bus.provision_room_stream("r1").await.unwrap();
        bus.provision_room_stream("r1").await.unwrap();

        bus.ensure_user_consumers("r1", "u1").await.unwrap();
        bus.ensure_user_consumers("r1", "u1").await.unwrap();

        use crate::bus::StreamBackend;
        let names = substrate.consumer_names("r1").await.unwrap();
        assert_eq!(names.len(), 2);

        bus.delete_user_consumers("r1", "u1").await.unwrap();
        assert!(substrate.consumer_names("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_failure_is_swallowed() {
        let (substrate, bus) = event_bus();
        let mut receiver = bus.subscribe(ChannelClass::Whiteboard, "r1").await.unwrap();

        bus.broadcast(ChannelClass::Whiteboard, "r1", &"stroke", None)
            .await;
        let message = receiver.recv().await.unwrap();
        assert_eq!(message.subject, "whiteboard.r1");

        substrate.set_offline(true);
        // Must not panic or block
        bus.broadcast(ChannelClass::Whiteboard, "r1", &"stroke", None)
            .await;
    }

    #[tokio::test]
    async fn test_similar_user_ids_get_separate_consumers() {
        let (_, bus) = event_bus();
        bus.provision_room_stream("r1").await.unwrap();

        let result = bus.ensure_user_consumers("r1", "a.b").await;
        assert!(matches!(result, Err(StoreError::InvalidIdentifier(_))));

        let first = bus.ensure_user_consumers("r1", "a-b").await.unwrap();
        let second = bus.ensure_user_consumers("r1", "a_b").await.unwrap();
        assert_ne!(first[0].consumer, second[0].consumer);

        let event = RoomEvent::UserNotification {
            from_user_id: "host".into(),
            message: "for a_b".into(),
        };
        bus.publish("r1", &event, Some("a_b")).await.unwrap();

        let system_grant = |grants: &[ConsumerGrant]| {
            grants
                .iter()
                .find(|g| g.filter_subject.contains(":system."))
                .unwrap()
                .consumer
                .clone()
        };
        let for_other: Vec<Delivery<RoomEvent>> = bus
            .fetch("r1", &system_grant(&first), 10, Duration::ZERO)
            .await
            .unwrap();
        let for_target: Vec<Delivery<RoomEvent>> = bus
            .fetch("r1", &system_grant(&second), 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(for_other.is_empty());
        assert_eq!(for_target.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_to_wildcard_target_is_rejected() {
        let (_, bus) = event_bus();
        bus.provision_room_stream("r1").await.unwrap();
        let event = RoomEvent::SessionEnded {
            reason: "done".into(),
        };

        let result = bus.publish("r1", &event, Some("*")).await;
        assert!(matches!(result, Err(StoreError::InvalidIdentifier(_))));
    }

    #[tokio::test]
    async fn test_user_fanout_reaches_only_that_user() {
        let (_, bus) = event_bus();
        let mut u1 = bus
            .subscribe_user(ChannelClass::DataChannel, "r1", "u1")
            .await
            .unwrap();
        let mut u2 = bus
            .subscribe_user(ChannelClass::DataChannel, "r1", "u2")
            .await
            .unwrap();

        bus.broadcast(ChannelClass::DataChannel, "r1", &"ping", Some("u1"))
            .await;

        let message = u1.recv().await.unwrap();
        assert_eq!(message.subject, "dataChannel.r1.u1");
        assert!(u2.try_recv().is_err());
    }
}
