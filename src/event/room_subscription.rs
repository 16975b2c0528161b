use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{bus::EventBus, events::RoomEvent, room_handler::RoomEventHandler};
use crate::bus::naming::{self, ChannelClass};
use crate::bus::BusError;
use crate::shared::StoreError;

const FETCH_BATCH: usize = 32;
const FETCH_WAIT: Duration = Duration::from_secs(1);

/// Pulls a room's public system events and routes them to a handler
pub struct RoomSubscription {
    room_id: String,
    handler: Arc<dyn RoomEventHandler>,
    event_bus: EventBus,
}

impl RoomSubscription {
    pub fn new(room_id: String, handler: Arc<dyn RoomEventHandler>, event_bus: EventBus) -> Self {
        Self {
            room_id,
            handler,
            event_bus,
        }
    }

    /// Provisions the room's public consumers, then spawns the pull loop
    ///
    /// The loop stops when `cancel` fires or the room's log is deleted.
    pub async fn start(self, cancel: CancellationToken) -> Result<JoinHandle<()>, StoreError> {
        let room_id = self.room_id.clone();
        let handler_name = self.handler.handler_name();

        self.event_bus.ensure_public_consumers(&room_id).await?;
        let consumer = naming::public_consumer(ChannelClass::System);

        info!(
            room_id = %room_id,
            handler = handler_name,
            "Starting room subscription"
        );

        Ok(tokio::spawn(async move {
            loop {
                let fetched = tokio::select! {
                    _ = cancel.cancelled() => break,
                    fetched = self.event_bus.fetch::<RoomEvent>(&room_id, &consumer, FETCH_BATCH, FETCH_WAIT) => fetched,
                };

                let deliveries = match fetched {
                    Ok(deliveries) => deliveries,
                    Err(StoreError::Bus(BusError::StreamNotFound(_)))
                    | Err(StoreError::Bus(BusError::ConsumerNotFound { .. })) => {
                        info!(room_id = %room_id, handler = handler_name, "Room log gone, stopping subscription");
                        break;
                    }
                    Err(e) => {
                        warn!(room_id = %room_id, handler = handler_name, error = %e, "Fetch failed");
                        tokio::time::sleep(FETCH_WAIT).await;
                        continue;
                    }
                };

                for delivery in deliveries {
                    debug!(
                        room_id = %room_id,
                        handler = handler_name,
                        event_type = delivery.envelope.payload.event_type(),
                        sequence = delivery.sequence,
                        "Received room event"
                    );

                    let sequence = delivery.sequence;
                    match self.handler.handle_room_event(&room_id, delivery.envelope).await {
                        Ok(()) => {
                            if let Err(e) = self.event_bus.ack(&room_id, &consumer, sequence).await {
                                warn!(room_id = %room_id, sequence, error = %e, "Ack failed");
                            }
                        }
                        Err(e) => {
                            warn!(
                                room_id = %room_id,
                                handler = handler_name,
                                sequence,
                                error = %e,
                                "Room event handler failed, leaving for redelivery"
                            );
                        }
                    }
                }
            }

            debug!(room_id = %room_id, handler = handler_name, "Room subscription ended");
        }))
    }
}
