use std::future::Future;
use std::time::Duration;

use roomcore::{
    bus::naming::{self, ChannelClass},
    event::Delivery,
    CoreServices, RoomEvent,
};

/// Acknowledges and returns everything on the room's public system consumer
pub async fn drain_system_events(process: &CoreServices, room_id: &str) -> Vec<RoomEvent> {
    let consumer = naming::public_consumer(ChannelClass::System);
    drain(process, room_id, &consumer).await
}

/// Acknowledges and returns everything addressed privately to `user_id`
pub async fn drain_private_events(
    process: &CoreServices,
    room_id: &str,
    user_id: &str,
) -> Vec<RoomEvent> {
    let consumer = naming::private_consumer(ChannelClass::System, user_id);
    drain(process, room_id, &consumer).await
}

async fn drain(process: &CoreServices, room_id: &str, consumer: &str) -> Vec<RoomEvent> {
    let deliveries: Vec<Delivery<RoomEvent>> = process
        .events
        .fetch(room_id, consumer, 1000, Duration::ZERO)
        .await
        .expect("fetch should succeed");

    let mut events = Vec::new();
    for delivery in deliveries {
        process
            .events
            .ack(room_id, consumer, delivery.sequence)
            .await
            .expect("ack should succeed");
        events.push(delivery.envelope.payload);
    }
    events
}

/// Polls `check` until it holds, for watch-driven state that converges asynchronously
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
