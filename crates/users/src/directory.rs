//! User directory read model.
//!
//! Built from `user.*` events; other event types are ignored. Lookups by email
//! are backed by an index kept next to the entries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use userserver_core::AggregateId;
use userserver_events::{EventEnvelope, Projection};

use crate::user::UserEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub user_id: AggregateId,
    pub email: String,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stream version of the last event applied to this entry.
    pub version: u64,
}

#[derive(Debug, Default)]
pub struct UserDirectory {
    users: HashMap<AggregateId, UserEntry>,
    by_email: HashMap<String, AggregateId>,
    /// Envelopes whose payload did not decode as a `UserEvent`.
    skipped: u64,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &AggregateId) -> Option<&UserEntry> {
        self.users.get(user_id)
    }

    pub fn find_by_email(&self, email: &str) -> Option<&UserEntry> {
        let normalized = email.trim().to_lowercase();
        self.by_email.get(&normalized).and_then(|id| self.users.get(id))
    }

    /// All entries, ordered by registration time.
    pub fn list(&self) -> Vec<&UserEntry> {
        let mut entries: Vec<_> = self.users.values().collect();
        entries.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.user_id.as_str().cmp(b.user_id.as_str()))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Projection for UserDirectory {
    fn apply(&mut self, envelope: &EventEnvelope) {
        if envelope.aggregate_type() != "user" {
            return;
        }

        let Ok(event) = serde_json::from_value::<UserEvent>(envelope.payload().clone()) else {
            self.skipped += 1;
            return;
        };

        let user_id = envelope.aggregate_id().clone();
        match event {
            UserEvent::Registered(e) => {
                self.by_email.insert(e.email.clone(), user_id.clone());
                self.users.insert(
                    user_id.clone(),
                    UserEntry {
                        user_id,
                        email: e.email,
                        registered_at: e.occurred_at,
                        updated_at: e.occurred_at,
                        version: envelope.stream_version(),
                    },
                );
            }
            UserEvent::EmailAddressChanged(e) => {
                let Some(entry) = self.users.get_mut(&user_id) else {
                    return;
                };
                if self.by_email.get(&entry.email) == Some(&user_id) {
                    self.by_email.remove(&entry.email);
                }
                self.by_email.insert(e.email.clone(), user_id);
                entry.email = e.email;
                entry.updated_at = e.occurred_at;
                entry.version = envelope.stream_version();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use userserver_events::{Event, ProjectionRunner};
    use uuid::Uuid;

    use super::*;
    use crate::user::{EmailAddressChanged, UserRegistered};

    fn envelope(id: &AggregateId, version: u64, event: &UserEvent) -> EventEnvelope {
        EventEnvelope::new(
            Uuid::now_v7(),
            id.clone(),
            "user",
            version,
            event.event_type(),
            event.version(),
            event.occurred_at(),
            None,
            serde_json::to_value(event).unwrap(),
        )
    }

    fn registered(email: &str) -> UserEvent {
        UserEvent::Registered(UserRegistered {
            email: email.to_string(),
            occurred_at: Utc::now(),
        })
    }

    fn changed(previous: &str, email: &str) -> UserEvent {
        UserEvent::EmailAddressChanged(EmailAddressChanged {
            previous: previous.to_string(),
            email: email.to_string(),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn registration_and_email_change_update_the_index() {
        let id = AggregateId::generate();
        let mut directory = UserDirectory::new();

        directory.apply(&envelope(&id, 1, &registered("ada@example.com")));
        directory.apply(&envelope(&id, 2, &changed("ada@example.com", "ada@lovelace.dev")));

        let entry = directory.find_by_email("ADA@lovelace.dev").unwrap();
        assert_eq!(entry.user_id, id);
        assert_eq!(entry.version, 2);
        assert!(directory.find_by_email("ada@example.com").is_none());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn foreign_and_undecodable_events_are_ignored() {
        let id = AggregateId::generate();
        let mut directory = UserDirectory::new();

        let foreign = EventEnvelope::new(
            Uuid::now_v7(),
            id.clone(),
            "ledger",
            1,
            "ledger.opened",
            1,
            Utc::now(),
            None,
            json!({}),
        );
        let garbage = EventEnvelope::new(
            Uuid::now_v7(),
            id.clone(),
            "user",
            1,
            "user.registered",
            1,
            Utc::now(),
            None,
            json!({ "Unknown": {} }),
        );
        directory.apply(&foreign);
        directory.apply(&garbage);

        assert!(directory.is_empty());
        assert_eq!(directory.skipped(), 1);
    }

    #[test]
    fn duplicate_deliveries_are_absorbed_by_the_runner() {
        let id = AggregateId::generate();
        let first = envelope(&id, 1, &registered("ada@example.com"));
        let second = envelope(&id, 2, &changed("ada@example.com", "ada@lovelace.dev"));

        let runner = ProjectionRunner::rebuild_from_scratch(
            UserDirectory::new,
            [&first, &second, &first, &second],
        )
        .unwrap();

        let entry = runner.projection().get(&id).unwrap();
        assert_eq!(entry.email, "ada@lovelace.dev");
        assert_eq!(entry.version, 2);
    }
}
