//! Deterministic names for buckets, streams, subjects and consumers.
//!
//! Every process derives the same names from the same identifiers, which is
//! what makes provisioning idempotent and lets a connection's permission grant
//! be computed from the addressing scheme alone.

use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

const BUCKET_PREFIX: &str = "pnm";

/// Stream shared by the worker pool for one-shot task dispatch
pub const WORKER_TASK_STREAM: &str = "pnm-worker-tasks";
pub const WORKER_TASK_SUBJECT: &str = "pnm.worker.tasks";
pub const WORKER_TASK_CONSUMER: &str = "pnm-worker-pool";

/// Fixed key under which a scheduler task lease is stored in its lock bucket
pub const LOCK_KEY: &str = "lock";

/// Shared TTL bucket holding one room-creation lease per room id
pub const ROOM_CREATION_LOCK_BUCKET: &str = "pnm-lock-room-creation";

/// Subject token separators and wildcards
const RESERVED: [char; 4] = ['.', '*', '>', ':'];

/// A room or user id that cannot be used as a single subject token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} id {id:?}: must be non-empty without '.', '*', '>', ':' or whitespace")]
pub struct InvalidIdentifier {
    pub kind: &'static str,
    pub id: String,
}

/// Checks that `id` stays exactly one token in every name derived from it
///
/// Every id reaching the addressing scheme must pass this, otherwise a
/// crafted id could widen a permission pattern or share another user's
/// consumer.
pub fn validate_id(kind: &'static str, id: &str) -> Result<(), InvalidIdentifier> {
    let valid = !id.is_empty()
        && !id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || RESERVED.contains(&c));
    if valid {
        Ok(())
    } else {
        Err(InvalidIdentifier {
            kind,
            id: id.to_string(),
        })
    }
}

/// Channel classes used in subjects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
pub enum ChannelClass {
    #[strum(serialize = "chat")]
    Chat,
    #[strum(serialize = "system")]
    System,
    #[strum(serialize = "whiteboard")]
    Whiteboard,
    #[strum(serialize = "dataChannel")]
    DataChannel,
}

impl ChannelClass {
    /// Classes delivered through the per-room reliable log
    pub const RELIABLE: [ChannelClass; 2] = [ChannelClass::Chat, ChannelClass::System];
}

pub fn room_bucket(room_id: &str) -> String {
    format!("{BUCKET_PREFIX}-room-{room_id}")
}

pub fn room_users_bucket(room_id: &str) -> String {
    format!("{BUCKET_PREFIX}-room-users-{room_id}")
}

pub fn user_info_bucket(room_id: &str, user_id: &str) -> String {
    format!("{BUCKET_PREFIX}-user-info-{room_id}-{user_id}")
}

pub fn lock_bucket(kind: &str, name: &str) -> String {
    format!("{BUCKET_PREFIX}-lock-{kind}-{name}")
}

/// Name of the reliable per-room stream
pub fn room_stream(room_id: &str) -> String {
    room_id.to_string()
}

/// Subject patterns captured by a room's stream
pub fn room_stream_subjects(room_id: &str) -> Vec<String> {
    ChannelClass::RELIABLE
        .iter()
        .map(|class| format!("{room_id}:{class}.>"))
        .collect()
}

/// `{roomId}:{class}.public`
pub fn public_subject(room_id: &str, class: ChannelClass) -> String {
    format!("{room_id}:{class}.public")
}

/// `{roomId}:{class}.private.{userId}`
pub fn private_subject(room_id: &str, class: ChannelClass, user_id: &str) -> String {
    format!("{room_id}:{class}.private.{user_id}")
}

/// `{class}.{roomId}` for best-effort fanout
pub fn fanout_subject(class: ChannelClass, room_id: &str) -> String {
    format!("{class}.{room_id}")
}

/// `{class}.{roomId}.{userId}` for best-effort messages aimed at one user
pub fn fanout_user_subject(class: ChannelClass, room_id: &str, user_id: &str) -> String {
    format!("{class}.{room_id}.{user_id}")
}

/// Durable consumer shared by the room for a public subject
pub fn public_consumer(class: ChannelClass) -> String {
    format!("{class}_public")
}

/// Durable consumer dedicated to one user's private subject
///
/// `user_id` must have passed [`validate_id`]; the id is used verbatim so
/// distinct users never share a consumer.
pub fn private_consumer(class: ChannelClass, user_id: &str) -> String {
    format!("{class}_private_{user_id}")
}
