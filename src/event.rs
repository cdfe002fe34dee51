use std::collections::HashSet;

use serde::Serialize;

use crate::{FlagValue, Result, User};

/// Built-in user attributes that can be marked private. `key` is always sent.
const PRIVATABLE_BUILTINS: [&str; 7] = [
    "ip",
    "country",
    "email",
    "name",
    "avatar",
    "firstName",
    "lastName",
];

/// An analytics event queued for delivery.
///
/// Serialized as a JSON object tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Event {
    Feature(FeatureRequestEvent),
    Custom(CustomEvent),
    Identify(IdentifyEvent),
}

impl Event {
    pub fn user(&self) -> &User {
        match self {
            Event::Feature(e) => &e.user,
            Event::Custom(e) => &e.user,
            Event::Identify(e) => &e.user,
        }
    }
}

/// Records that a flag was evaluated for a user, either directly or as a prerequisite of
/// another flag (`prereq_of`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRequestEvent {
    pub creation_date: i64,
    pub key: String,
    pub user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    pub value: FlagValue,
    pub default: FlagValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prereq_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEvent {
    pub creation_date: i64,
    pub key: String,
    pub user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyEvent {
    pub creation_date: i64,
    pub key: String,
    pub user: User,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Turns a batch of events into the JSON payload handed to an
/// [`EventPublisher`](crate::EventPublisher), removing private user attributes on the way.
#[derive(Debug, Clone, Default)]
pub struct EventSerializer {
    all_attributes_private: bool,
    private_attribute_names: HashSet<String>,
}

impl EventSerializer {
    pub fn new(
        all_attributes_private: bool,
        private_attribute_names: impl IntoIterator<Item = String>,
    ) -> EventSerializer {
        EventSerializer {
            all_attributes_private,
            private_attribute_names: private_attribute_names.into_iter().collect(),
        }
    }

    pub fn serialize_batch(&self, events: &[Event]) -> Result<Vec<u8>> {
        let records = events
            .iter()
            .map(|event| self.to_record(event))
            .collect::<Result<Vec<_>>>()?;
        Ok(serde_json::to_vec(&records)?)
    }

    fn to_record(&self, event: &Event) -> Result<serde_json::Value> {
        let mut record = serde_json::to_value(event)?;
        if let Some(user_json) = record.get_mut("user") {
            self.scrub_user(user_json, event.user());
        }
        Ok(record)
    }

    fn scrub_user(&self, user_json: &mut serde_json::Value, user: &User) {
        let Some(object) = user_json.as_object_mut() else {
            return;
        };
        let is_private = |name: &str| {
            self.all_attributes_private
                || self.private_attribute_names.contains(name)
                || user.private_attribute_names().contains(name)
        };

        let mut private_attrs = Vec::new();
        for name in PRIVATABLE_BUILTINS {
            if object.contains_key(name) && is_private(name) {
                object.remove(name);
                private_attrs.push(name.to_owned());
            }
        }

        if let Some(serde_json::Value::Object(custom)) = object.get_mut("custom") {
            custom.retain(|name, _| {
                let private = is_private(name);
                if private {
                    private_attrs.push(name.clone());
                }
                !private
            });
            if custom.is_empty() {
                object.remove("custom");
            }
        }

        if !private_attrs.is_empty() {
            private_attrs.sort();
            object.insert("privateAttrs".to_owned(), private_attrs.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CustomEvent, Event, EventSerializer, FeatureRequestEvent, IdentifyEvent};
    use crate::User;

    fn user() -> User {
        User::builder("u1")
            .email("u1@example.com")
            .country("NZ")
            .custom("plan", "pro")
            .custom("team", "core")
            .build()
    }

    #[test]
    fn feature_event_shape() {
        let event = Event::Feature(FeatureRequestEvent {
            creation_date: 1_700_000_000_000,
            key: "flag".to_owned(),
            user: User::new("u1"),
            variation: Some(1),
            value: json!("b"),
            default: json!("a"),
            version: Some(3),
            prereq_of: Some("parent".to_owned()),
        });

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "kind": "feature",
                "creationDate": 1_700_000_000_000i64,
                "key": "flag",
                "user": {"key": "u1"},
                "variation": 1,
                "value": "b",
                "default": "a",
                "version": 3,
                "prereqOf": "parent",
            })
        );
    }

    #[test]
    fn custom_and_identify_shapes() {
        let custom = Event::Custom(CustomEvent {
            creation_date: 1,
            key: "purchase".to_owned(),
            user: User::new("u1"),
            data: Some(json!({"amount": 10})),
        });
        let identify = Event::Identify(IdentifyEvent {
            creation_date: 2,
            key: "u1".to_owned(),
            user: User::new("u1"),
        });

        let payload = EventSerializer::default()
            .serialize_batch(&[custom, identify])
            .unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&payload).unwrap(),
            json!([
                {"kind": "custom", "creationDate": 1, "key": "purchase", "user": {"key": "u1"}, "data": {"amount": 10}},
                {"kind": "identify", "creationDate": 2, "key": "u1", "user": {"key": "u1"}},
            ])
        );
    }

    fn identify(user: User) -> Event {
        Event::Identify(IdentifyEvent {
            creation_date: 0,
            key: user.key().to_owned(),
            user,
        })
    }

    fn serialized_user(serializer: &EventSerializer, user: User) -> serde_json::Value {
        let payload = serializer.serialize_batch(&[identify(user)]).unwrap();
        let records: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        records[0]["user"].clone()
    }

    #[test]
    fn globally_private_attributes_are_removed() {
        let serializer = EventSerializer::new(false, ["email".to_owned(), "plan".to_owned()]);
        assert_eq!(
            serialized_user(&serializer, user()),
            json!({
                "key": "u1",
                "country": "NZ",
                "custom": {"team": "core"},
                "privateAttrs": ["email", "plan"],
            })
        );
    }

    #[test]
    fn per_user_private_attributes_are_removed() {
        let user = User::builder("u1")
            .country("NZ")
            .private_attribute("country")
            .build();
        assert_eq!(
            serialized_user(&EventSerializer::default(), user),
            json!({"key": "u1", "privateAttrs": ["country"]})
        );
    }

    #[test]
    fn all_attributes_private_keeps_only_key() {
        let serializer = EventSerializer::new(true, Vec::new());
        assert_eq!(
            serialized_user(&serializer, user()),
            json!({
                "key": "u1",
                "privateAttrs": ["country", "email", "plan", "team"],
            })
        );
    }
}
