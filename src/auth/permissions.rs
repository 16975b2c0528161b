use serde::{Deserialize, Serialize};

use crate::bus::naming::{self, ChannelClass, InvalidIdentifier};

/// Subjects a connection may publish to and subscribe on
///
/// Computed from the addressing scheme alone, so every process grants the
/// same rights for the same `(room, user)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPermissions {
    pub publish_allow: Vec<String>,
    pub subscribe_allow: Vec<String>,
}

impl ConnectionPermissions {
    /// Fails for ids that are not a single subject token, since a wildcard
    /// id would widen the grant to other users' subjects
    pub fn for_user(
        room_id: &str,
        user_id: &str,
        is_admin: bool,
    ) -> Result<Self, InvalidIdentifier> {
        naming::validate_id("room", room_id)?;
        naming::validate_id("user", user_id)?;

        let mut publish_allow = vec![
            naming::public_subject(room_id, ChannelClass::Chat),
            naming::private_subject(room_id, ChannelClass::Chat, "*"),
        ];
        if is_admin {
            publish_allow.push(naming::public_subject(room_id, ChannelClass::System));
            publish_allow.push(naming::private_subject(room_id, ChannelClass::System, "*"));
        }

        let mut subscribe_allow = Vec::new();
        for class in ChannelClass::RELIABLE {
            subscribe_allow.push(naming::public_subject(room_id, class));
            subscribe_allow.push(naming::private_subject(room_id, class, user_id));
        }

        for class in [ChannelClass::Whiteboard, ChannelClass::DataChannel] {
            publish_allow.push(naming::fanout_subject(class, room_id));
            publish_allow.push(naming::fanout_user_subject(class, room_id, "*"));
            subscribe_allow.push(naming::fanout_subject(class, room_id));
            subscribe_allow.push(naming::fanout_user_subject(class, room_id, user_id));
        }

        Ok(Self {
            publish_allow,
            subscribe_allow,
        })
    }

    pub fn can_publish(&self, subject: &str) -> bool {
        self.publish_allow
            .iter()
            .any(|pattern| crate::bus::subject_matches(pattern, subject))
    }

    pub fn can_subscribe(&self, subject: &str) -> bool {
        self.subscribe_allow
            .iter()
            .any(|pattern| crate::bus::subject_matches(pattern, subject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_reads_only_own_private_subjects() {
        let perms = ConnectionPermissions::for_user("r1", "u1", false).unwrap();

        assert!(perms.can_subscribe("r1:system.private.u1"));
        assert!(perms.can_subscribe("r1:chat.public"));
        assert!(!perms.can_subscribe("r1:system.private.u2"));
        assert!(!perms.can_subscribe("r2:chat.public"));
        assert!(perms.can_subscribe("whiteboard.r1"));
    }

    #[test]
    fn test_only_admins_publish_system_events() {
        let guest = ConnectionPermissions::for_user("r1", "u1", false).unwrap();
        let admin = ConnectionPermissions::for_user("r1", "u2", true).unwrap();

        assert!(!guest.can_publish("r1:system.public"));
        assert!(admin.can_publish("r1:system.public"));
        assert!(guest.can_publish("r1:chat.private.u2"));
        assert!(guest.can_publish("dataChannel.r1.u2"));
    }

    #[test]
    fn test_wildcard_ids_get_no_grant() {
        for user_id in ["*", ">", "a.b", ""] {
            assert!(ConnectionPermissions::for_user("r1", user_id, false).is_err());
        }
        assert!(ConnectionPermissions::for_user("r1.*", "u1", false).is_err());

        let perms = ConnectionPermissions::for_user("r1", "u1", false).unwrap();
        assert!(!perms.can_subscribe("r1:system.private.victim"));
    }
}
