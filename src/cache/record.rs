use chrono::{DateTime, Utc};
use std::str::FromStr;
use strum_macros::{Display, EnumString};

use crate::shared::StoreError;

/// The kinds of entity mirrored by the local cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EntityKind {
    Room,
    User,
    Presence,
}

/// A record stored one field per key inside its own bucket
///
/// Hydration applies every key in turn; a watch applies only the key that
/// changed, so an update costs the same whatever the record's size.
pub trait FieldRecord: Clone + Default + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Whether a bucket with no keys still represents an existing record
    const EMPTY_IS_PRESENT: bool = false;

    fn apply_field(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn clear_field(&mut self, key: &str);

    fn to_fields(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// A terminal record is evicted together with everything nested under it
    fn is_terminal(&self) -> bool {
        false
    }
}

pub(crate) fn decode_string(field: &str, value: &[u8]) -> Result<String, StoreError> {
    String::from_utf8(value.to_vec()).map_err(|e| StoreError::Decode {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn decode_parsed<T>(field: &str, value: &[u8]) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = decode_string(field, value)?;
    raw.trim().parse::<T>().map_err(|e| StoreError::Decode {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

/// Empty value means "never set"
pub(crate) fn decode_timestamp(
    field: &str,
    value: &[u8],
) -> Result<Option<DateTime<Utc>>, StoreError> {
    let raw = decode_string(field, value)?;
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(&raw)
        .map(|parsed| Some(parsed.with_timezone(&Utc)))
        .map_err(|e| StoreError::Decode {
            field: field.to_string(),
            reason: e.to_string(),
        })
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    field: &str,
    value: &[u8],
) -> Result<T, StoreError> {
    serde_json::from_slice(value).map_err(|e| StoreError::Decode {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn encode_timestamp(value: &Option<DateTime<Utc>>) -> Vec<u8> {
    value
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_default()
        .into_bytes()
}

pub(crate) fn encode_display(value: impl ToString) -> Vec<u8> {
    value.to_string().into_bytes()
}
