mod utils;

use std::time::Duration;

use roomcore::{
    presence::{JoinAttributes, UserMetadata},
    PresenceStatus, RoomEvent,
};
use utils::{drain_private_events, drain_system_events, eventually, TestSetupBuilder};

fn after(duration: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now() + chrono::Duration::from_std(duration).unwrap()
}

#[tokio::test]
async fn user_attributes_survive_a_cold_cache() {
    let setup = TestSetupBuilder::new().with_processes(2).build();
    let room = setup.create_room().await;
    let presence = &setup.process(0).presence;

    let attrs = JoinAttributes {
        name: "Ada".into(),
        is_admin: true,
        is_presenter: true,
        metadata: UserMetadata {
            raised_hand: true,
            ..UserMetadata::default()
        },
    };
    presence.add_user(&room.room_id, "u1", attrs).await.unwrap();
    presence
        .update_status(&room.room_id, "u1", PresenceStatus::Online)
        .await
        .unwrap();

    setup.process(0).cache.evict_user(&room.room_id, "u1").await;

    for process in &setup.processes {
        let user = process
            .presence
            .get_user(&room.room_id, "u1")
            .await
            .unwrap()
            .expect("user should be readable through the fallback path");
        assert!(user.is_admin);
        assert!(user.is_presenter);
        assert!(user.metadata.raised_hand);
        assert_eq!(user.name, "Ada");
    }
}

#[tokio::test]
async fn two_schedulers_announce_offline_once() {
    let setup = TestSetupBuilder::new().with_processes(2).build();
    let room = setup.create_room().await;
    setup.add_user("u1", false).await;

    let presence = &setup.process(0).presence;
    presence
        .update_status(&room.room_id, "u1", PresenceStatus::Online)
        .await
        .unwrap();
    presence
        .update_status(&room.room_id, "u1", PresenceStatus::Disconnected)
        .await
        .unwrap();

    let first = setup.process(0).scheduler();
    let second = setup.process(1).scheduler();
    let now = after(Duration::from_secs(31));
    let (a, b) = tokio::join!(first.run_fast_tick(now), second.run_fast_tick(now));
    assert_eq!(a.unwrap().users_offline + b.unwrap().users_offline, 1);

    // Later ticks find nothing left to do
    let again = first.run_fast_tick(after(Duration::from_secs(60))).await.unwrap();
    assert_eq!(again.users_offline, 0);

    let offline = drain_system_events(setup.process(0), &room.room_id)
        .await
        .into_iter()
        .filter(|e| matches!(e, RoomEvent::UserOffline { .. }))
        .count();
    assert_eq!(offline, 1);
}

#[tokio::test]
async fn join_token_authorizes_on_any_process() {
    let setup = TestSetupBuilder::new().with_processes(2).build();
    let room = setup.create_room().await;

    let token = setup
        .process(0)
        .authorizer
        .issue_join_token(&room.room_id, "u1", JoinAttributes::default())
        .await
        .unwrap();
    let grant = setup
        .process(1)
        .authorizer
        .authorize_connection(&token)
        .await
        .unwrap();
    assert_eq!(grant.room_sid, room.room_sid);

    // Process 0 watches the roster while process 1 reports the connection
    let observer = &setup.process(0).presence;
    assert_eq!(observer.get_room_users(&room.room_id).await.unwrap().len(), 1);
    setup
        .process(1)
        .presence
        .update_status(&room.room_id, "u1", PresenceStatus::Online)
        .await
        .unwrap();

    let room_id = room.room_id.as_str();
    let online = eventually(move || async move {
        observer
            .get_online_users(room_id)
            .await
            .map(|users| users.len() == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(online, "observer never saw the user come online");
}

#[tokio::test]
async fn raised_hand_reaches_online_admins_only() {
    let setup = TestSetupBuilder::new().build();
    let room = setup.create_room().await;
    let process = setup.process(0);

    for (user_id, is_admin) in [("host", true), ("cohost", true), ("guest", false)] {
        setup.add_user(user_id, is_admin).await;
        process
            .events
            .ensure_user_consumers(&room.room_id, user_id)
            .await
            .unwrap();
        process
            .presence
            .update_status(&room.room_id, user_id, PresenceStatus::Online)
            .await
            .unwrap();
    }

    let room_id = room.room_id.as_str();
    let all_online = eventually(move || async move {
        process
            .presence
            .get_online_users(room_id)
            .await
            .map(|users| users.len() == 3)
            .unwrap_or(false)
    })
    .await;
    assert!(all_online);

    let notified = process
        .presence
        .notify_admins(&room.room_id, "guest", "raised hand")
        .await
        .unwrap();
    assert_eq!(notified, 2);

    let host_events = drain_private_events(process, &room.room_id, "host").await;
    assert!(matches!(
        host_events.as_slice(),
        [RoomEvent::UserNotification { from_user_id, .. }] if from_user_id == "guest"
    ));
    assert!(drain_private_events(process, &room.room_id, "guest")
        .await
        .is_empty());
}

#[tokio::test]
async fn logout_removes_the_user_and_announces_it() {
    let setup = TestSetupBuilder::new().build();
    let room = setup.create_room().await;
    setup.add_user("u1", false).await;
    let presence = &setup.process(0).presence;

    assert!(presence.remove_user(&room.room_id, "u1").await.unwrap());
    assert!(!presence.remove_user(&room.room_id, "u1").await.unwrap());
    assert!(presence.get_user(&room.room_id, "u1").await.unwrap().is_none());

    let left = drain_system_events(setup.process(0), &room.room_id)
        .await
        .into_iter()
        .filter(|e| matches!(e, RoomEvent::UserLeft { .. }))
        .count();
    assert_eq!(left, 1);
}
