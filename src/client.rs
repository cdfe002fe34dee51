use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::{
    eval::{ErrorKind, Reason},
    event::{now_millis, CustomEvent, Event, FeatureRequestEvent, IdentifyEvent},
    flusher::{FlusherThread, FlusherThreadConfig},
    CachedFlagSource, ClientConfig, Error, EventProcessor, EventPublisher, EventSerializer,
    FeatureFlag, FlagSource, FlagStore, FlagValue, HttpEventPublisher, HttpFlagSource, Result, User,
};

/// Outcome of [`Client::variation_detail`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail {
    /// The flag value, or the default if the flag could not be evaluated.
    pub value: FlagValue,
    /// `None` when `value` is the default.
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

/// A feature flag client.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// Evaluation methods never fail: whenever a flag cannot be evaluated, the caller's default is
/// returned and the problem is logged. Once the SDK key is rejected by either the flag service or
/// the events service, the client stops all network activity and only returns defaults.
///
/// # Examples
/// ```
/// # use flagship::{Client, ClientConfig, User};
/// let client = ClientConfig::from_sdk_key("sdk-key").offline(true).to_client().unwrap();
/// assert!(!client.bool_variation("new-checkout", &User::new("user-key"), false));
/// ```
pub struct Client {
    sdk_key: String,
    offline: bool,
    flag_source: Arc<dyn FlagSource + Send + Sync>,
    events: Option<Arc<EventProcessor>>,
    defaults: HashMap<String, FlagValue>,
    /// Circuit breaker. Set once the SDK key is rejected and never cleared.
    unauthorized: AtomicBool,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// ```
    /// # use flagship::{ClientConfig, Client};
    /// let client = Client::new(ClientConfig::from_sdk_key("sdk-key")).unwrap();
    /// ```
    pub fn new(config: ClientConfig) -> Result<Client> {
        let flag_source: Arc<dyn FlagSource + Send + Sync> = match config.flag_source {
            _ if config.offline => Arc::new(FlagStore::new()),
            Some(flag_source) => flag_source,
            None => Arc::new(HttpFlagSource::new(
                &config.base_url,
                config.sdk_key.clone(),
                config.timeout,
                config.connect_timeout,
            )?),
        };
        let flag_source: Arc<dyn FlagSource + Send + Sync> = match config.flag_cache_ttl {
            Some(ttl) if !config.offline => Arc::new(CachedFlagSource::new(flag_source, ttl)),
            _ => flag_source,
        };

        let events = if config.offline || !config.send_events {
            None
        } else {
            let publisher: Arc<dyn EventPublisher + Send + Sync> = match config.event_publisher {
                Some(publisher) => publisher,
                None => Arc::new(HttpEventPublisher::new(
                    &config.events_url,
                    config.sdk_key.clone(),
                    config.timeout,
                    config.connect_timeout,
                )?),
            };
            let serializer = EventSerializer::new(
                config.all_attributes_private,
                config.private_attribute_names,
            );
            Some(Arc::new(EventProcessor::new(
                publisher,
                serializer,
                config.capacity,
            )))
        };

        Ok(Client {
            sdk_key: config.sdk_key,
            offline: config.offline,
            flag_source,
            events,
            defaults: config.defaults,
            unauthorized: AtomicBool::new(false),
        })
    }

    /// Evaluate `flag_key` for `user`, returning `default` if the flag cannot be evaluated.
    pub fn variation(&self, flag_key: &str, user: &User, default: FlagValue) -> FlagValue {
        self.variation_detail(flag_key, user, default).value
    }

    /// Evaluate `flag_key` for `user`, explaining how the value was chosen.
    pub fn variation_detail(
        &self,
        flag_key: &str,
        user: &User,
        default: FlagValue,
    ) -> EvaluationDetail {
        let default = self.defaults.get(flag_key).cloned().unwrap_or(default);
        let fallback = |error_kind| EvaluationDetail {
            value: default.clone(),
            variation_index: None,
            reason: Reason::Error { error_kind },
        };

        if self.is_offline() {
            return fallback(ErrorKind::ClientOffline);
        }

        if user.is_key_blank() {
            log::warn!(target: "flagship", flag_key; "{}, evaluating anyway", Error::MissingUser);
        }

        let flag = match self.flag_source.get_flag(flag_key) {
            Ok(Some(flag)) => flag,
            Ok(None) => {
                log::warn!(target: "flagship", flag_key, user_key = user.key(); "{}, returning default", Error::MissingFlag);
                self.send_feature_event(flag_key, None, user, None, &default, &default);
                return fallback(ErrorKind::FlagNotFound);
            }
            Err(Error::Unauthorized) => {
                self.handle_unauthorized();
                return fallback(ErrorKind::ClientOffline);
            }
            Err(err) => {
                log::error!(target: "flagship", flag_key; "failed to fetch flag, returning default: {err}");
                self.send_feature_event(flag_key, None, user, None, &default, &default);
                return fallback(ErrorKind::SourceUnavailable);
            }
        };

        let decision = match flag.evaluate(user, &*self.flag_source) {
            Ok(decision) => decision,
            Err(err) => {
                // Only a rejected SDK key fails evaluation.
                log::error!(target: "flagship", flag_key; "failed to evaluate flag: {err}");
                self.handle_unauthorized();
                return fallback(ErrorKind::ClientOffline);
            }
        };
        for event in decision.prerequisite_events {
            self.send_event(event);
        }

        let (value, variation_index) = match decision.value {
            Some(value) => (value, decision.variation_index),
            None => (default.clone(), None),
        };
        self.send_feature_event(
            flag_key,
            Some(&*flag),
            user,
            variation_index,
            &value,
            &default,
        );

        EvaluationDetail {
            value,
            variation_index,
            reason: decision.reason,
        }
    }

    /// Evaluate a boolean flag. Values of another type resolve to `default`.
    pub fn bool_variation(&self, flag_key: &str, user: &User, default: bool) -> bool {
        self.typed_variation(flag_key, user, default.into(), FlagValue::as_bool)
            .unwrap_or(default)
    }

    pub fn string_variation(&self, flag_key: &str, user: &User, default: &str) -> String {
        self.typed_variation(flag_key, user, default.into(), |value| {
            value.as_str().map(str::to_owned)
        })
        .unwrap_or_else(|| default.to_owned())
    }

    pub fn int_variation(&self, flag_key: &str, user: &User, default: i64) -> i64 {
        self.typed_variation(flag_key, user, default.into(), FlagValue::as_i64)
            .unwrap_or(default)
    }

    pub fn float_variation(&self, flag_key: &str, user: &User, default: f64) -> f64 {
        self.typed_variation(flag_key, user, default.into(), FlagValue::as_f64)
            .unwrap_or(default)
    }

    /// Evaluate a flag holding arbitrary JSON.
    pub fn json_variation(&self, flag_key: &str, user: &User, default: FlagValue) -> FlagValue {
        self.variation(flag_key, user, default)
    }

    fn typed_variation<T>(
        &self,
        flag_key: &str,
        user: &User,
        default: FlagValue,
        convert: impl FnOnce(&FlagValue) -> Option<T>,
    ) -> Option<T> {
        let value = self.variation(flag_key, user, default);
        let converted = convert(&value);
        if converted.is_none() {
            log::warn!(target: "flagship", flag_key, value:display = value; "flag value has an unexpected type, returning default");
        }
        converted
    }

    /// Evaluate every flag for `user`. Prerequisites resolve against the same snapshot.
    ///
    /// Returns `None` if the client is offline, the user key is blank, or the flags could not be
    /// fetched. No events are recorded.
    pub fn all_flags(&self, user: &User) -> Option<HashMap<String, FlagValue>> {
        if self.is_offline() {
            log::warn!(target: "flagship", "all_flags called while offline");
            return None;
        }
        if user.is_key_blank() {
            log::warn!(target: "flagship", "all_flags: {}", Error::MissingUser);
            return None;
        }

        let flags: HashMap<String, Arc<FeatureFlag>> = match self.flag_source.get_all_flags() {
            Ok(flags) => flags,
            Err(Error::Unauthorized) => {
                self.handle_unauthorized();
                return None;
            }
            Err(err) => {
                log::error!(target: "flagship", "failed to fetch flags: {err}");
                return None;
            }
        };

        let mut values = HashMap::with_capacity(flags.len());
        for (key, flag) in &flags {
            match flag.evaluate(user, &flags) {
                Ok(decision) => {
                    values.insert(key.clone(), decision.value.unwrap_or(FlagValue::Null));
                }
                Err(err) => {
                    log::error!(target: "flagship", "failed to evaluate flags: {err}");
                    self.handle_unauthorized();
                    return None;
                }
            }
        }
        Some(values)
    }

    /// Record a custom event for `user`.
    pub fn track(&self, event_name: &str, user: &User, data: Option<serde_json::Value>) {
        if self.is_offline() {
            return;
        }
        if user.is_key_blank() {
            log::warn!(target: "flagship", event_name; "track: {}, skipping event", Error::MissingUser);
            return;
        }
        self.send_event(Event::Custom(CustomEvent {
            creation_date: now_millis(),
            key: event_name.to_owned(),
            user: user.clone(),
            data,
        }));
    }

    /// Record the attributes of `user`.
    pub fn identify(&self, user: &User) {
        if self.is_offline() {
            return;
        }
        if user.is_key_blank() {
            log::warn!(target: "flagship", "identify: {}, skipping event", Error::MissingUser);
            return;
        }
        self.send_event(Event::Identify(IdentifyEvent {
            creation_date: now_millis(),
            key: user.key().to_owned(),
            user: user.clone(),
        }));
    }

    /// HMAC-SHA256 of the user key, keyed by the SDK key, as lowercase hex. Lets a client-side
    /// SDK prove that the user was vouched for by this server.
    ///
    /// Returns an empty string for a blank user key.
    pub fn secure_mode_hash(&self, user: &User) -> String {
        if user.is_key_blank() {
            return String::new();
        }
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.sdk_key.as_bytes()) else {
            return String::new();
        };
        mac.update(user.key().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Publish queued events now, blocking until the events service answers.
    ///
    /// Returns `false` if the batch was lost or the SDK key was rejected.
    pub fn flush(&self) -> bool {
        let Some(events) = &self.events else {
            return true;
        };
        match events.flush() {
            Ok(flushed) => flushed,
            Err(Error::Unauthorized) => {
                self.handle_unauthorized();
                false
            }
            Err(err) => {
                log::warn!(target: "flagship", "failed to flush events: {err}");
                false
            }
        }
    }

    /// Whether the client was configured offline or its SDK key was rejected.
    pub fn is_offline(&self) -> bool {
        self.offline
            || self.unauthorized.load(Ordering::Acquire)
            || self
                .events
                .as_ref()
                .map_or(false, |events| events.is_disabled())
    }

    /// Start a thread that flushes events periodically.
    ///
    /// Returns `None` if the client does not send events.
    pub fn start_flusher_thread(
        &self,
        config: FlusherThreadConfig,
    ) -> Result<Option<FlusherThread>> {
        match &self.events {
            Some(events) => FlusherThread::start(events.clone(), config).map(Some),
            None => Ok(None),
        }
    }

    fn handle_unauthorized(&self) {
        if !self.unauthorized.swap(true, Ordering::AcqRel) {
            log::error!(target: "flagship", "{}, switching to offline mode", Error::Unauthorized);
        }
        if let Some(events) = &self.events {
            events.disable();
        }
    }

    fn send_feature_event(
        &self,
        flag_key: &str,
        flag: Option<&FeatureFlag>,
        user: &User,
        variation: Option<usize>,
        value: &FlagValue,
        default: &FlagValue,
    ) {
        self.send_event(Event::Feature(FeatureRequestEvent {
            creation_date: now_millis(),
            key: flag_key.to_owned(),
            user: user.clone(),
            variation,
            value: value.clone(),
            default: default.clone(),
            version: flag.map(|flag| flag.version),
            prereq_of: None,
        }));
    }

    fn send_event(&self, event: Event) {
        let Some(events) = &self.events else {
            return;
        };
        if event.user().is_key_blank() {
            return;
        }
        events.enqueue(event);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use serde_json::json;

    use super::Client;
    use crate::{
        eval::{ErrorKind, Reason},
        ClientConfig, Error, EventPublisher, FeatureFlag, FlagSource, FlagStore, Result, User,
    };

    #[derive(Default)]
    struct RecordingPublisher {
        batches: Mutex<Vec<serde_json::Value>>,
        unauthorized: bool,
    }

    impl RecordingPublisher {
        fn records(&self) -> Vec<serde_json::Value> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|batch| batch.as_array().unwrap().clone())
                .collect()
        }
    }

    impl EventPublisher for RecordingPublisher {
        fn publish(&self, payload: &[u8]) -> Result<()> {
            self.batches
                .lock()
                .unwrap()
                .push(serde_json::from_slice(payload).unwrap());
            if self.unauthorized {
                Err(Error::Unauthorized)
            } else {
                Ok(())
            }
        }
    }

    /// Serves `served` flags and rejects the SDK key for everything else, counting every call.
    #[derive(Default)]
    struct RejectingSource {
        calls: AtomicUsize,
        served: HashMap<String, Arc<FeatureFlag>>,
    }

    impl FlagSource for RejectingSource {
        fn get_flag(&self, key: &str) -> Result<Option<Arc<FeatureFlag>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.served.get(key) {
                Some(flag) => Ok(Some(flag.clone())),
                None => Err(Error::Unauthorized),
            }
        }

        fn get_all_flags(&self) -> Result<HashMap<String, Arc<FeatureFlag>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Unauthorized)
        }
    }

    fn store() -> Arc<FlagStore> {
        let flags: Vec<FeatureFlag> = serde_json::from_value(json!([
            {
                "key": "banner", "version": 4, "on": true,
                "variations": ["red", "green"],
                "targets": [{"values": ["vip"], "variation": 1}],
                "fallthrough": {"variation": 0}
            },
            {
                "key": "limit", "version": 1, "on": true,
                "variations": [10, 20],
                "fallthrough": {"variation": 1}
            },
            {
                "key": "gated", "version": 2, "on": true,
                "variations": [false, true], "offVariation": 0,
                "prerequisites": [{"key": "banner", "variation": 1}],
                "fallthrough": {"variation": 1}
            }
        ]))
        .unwrap();
        Arc::new(FlagStore::with_flags(flags))
    }

    fn client(publisher: &Arc<RecordingPublisher>) -> Client {
        ClientConfig::from_sdk_key("sdk-key")
            .flag_source(store())
            .event_publisher(publisher.clone())
            .to_client()
            .unwrap()
    }

    #[test]
    fn evaluates_flags_and_records_feature_events() {
        let publisher = Arc::new(RecordingPublisher::default());
        let client = client(&publisher);

        assert_eq!(
            client.string_variation("banner", &User::new("vip"), "none"),
            "green"
        );
        assert_eq!(client.int_variation("limit", &User::new("vip"), 0), 20);
        assert!(client.flush());

        let records = publisher.records();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            json!({
                "kind": "feature",
                "creationDate": records[0]["creationDate"],
                "key": "banner",
                "user": {"key": "vip"},
                "variation": 1,
                "value": "green",
                "default": "none",
                "version": 4,
            })
        );
    }

    #[test]
    fn missing_flag_returns_default_and_still_records_an_event() {
        let publisher = Arc::new(RecordingPublisher::default());
        let client = client(&publisher);

        let detail = client.variation_detail("nope", &User::new("u1"), json!("fallback"));
        assert_eq!(detail.value, json!("fallback"));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::FlagNotFound
            }
        );

        client.flush();
        let records = publisher.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["value"], json!("fallback"));
        assert!(records[0].get("version").is_none());
    }

    #[test]
    fn type_mismatch_returns_default() {
        let publisher = Arc::new(RecordingPublisher::default());
        let client = client(&publisher);

        assert!(client.bool_variation("banner", &User::new("u1"), true));
    }

    #[test]
    fn configured_defaults_win_over_caller_default() {
        let client = ClientConfig::from_sdk_key("sdk-key")
            .offline(true)
            .default_value("banner", "blue")
            .to_client()
            .unwrap();

        assert_eq!(
            client.string_variation("banner", &User::new("u1"), "none"),
            "blue"
        );
        assert_eq!(
            client.string_variation("other", &User::new("u1"), "none"),
            "none"
        );
    }

    #[test]
    fn prerequisite_events_precede_the_requested_flag() {
        let publisher = Arc::new(RecordingPublisher::default());
        let client = client(&publisher);

        assert!(client.bool_variation("gated", &User::new("vip"), false));
        assert!(!client.bool_variation("gated", &User::new("someone"), true));
        client.flush();

        let summary: Vec<(serde_json::Value, serde_json::Value)> = publisher
            .records()
            .iter()
            .map(|record| (record["key"].clone(), record["prereqOf"].clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (json!("banner"), json!("gated")),
                (json!("gated"), json!(null)),
                (json!("banner"), json!("gated")),
                (json!("gated"), json!(null)),
            ]
        );
    }

    #[test]
    fn unauthorized_flag_source_engages_circuit_breaker() {
        let source = Arc::new(RejectingSource::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let client = ClientConfig::from_sdk_key("bad-key")
            .flag_source(source.clone())
            .event_publisher(publisher.clone())
            .to_client()
            .unwrap();

        assert_eq!(client.int_variation("limit", &User::new("u1"), 7), 7);
        assert!(client.is_offline());

        assert_eq!(client.int_variation("limit", &User::new("u1"), 8), 8);
        assert!(client.all_flags(&User::new("u1")).is_none());
        client.track("purchase", &User::new("u1"), None);
        assert!(client.flush());

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(publisher.records().is_empty());
    }

    #[test]
    fn unauthorized_prerequisite_fetch_engages_circuit_breaker() {
        let gated: FeatureFlag = serde_json::from_value(json!({
            "key": "gated", "version": 1, "on": true,
            "variations": ["off-value", "on-value"], "offVariation": 0,
            "prerequisites": [{"key": "pre", "variation": 0}],
            "fallthrough": {"variation": 1}
        }))
        .unwrap();
        let source = Arc::new(RejectingSource {
            served: HashMap::from([("gated".to_owned(), Arc::new(gated))]),
            ..Default::default()
        });
        let publisher = Arc::new(RecordingPublisher::default());
        let client = ClientConfig::from_sdk_key("bad-key")
            .flag_source(source.clone())
            .event_publisher(publisher.clone())
            .to_client()
            .unwrap();

        let detail = client.variation_detail("gated", &User::new("u1"), json!("DEFAULT"));
        assert_eq!(detail.value, json!("DEFAULT"));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::ClientOffline
            }
        );
        assert!(client.is_offline());

        assert_eq!(
            client.variation("gated", &User::new("u1"), json!("DEFAULT")),
            json!("DEFAULT")
        );
        assert!(client.flush());

        // One call for `gated`, one for `pre`, nothing after the rejection.
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(publisher.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn all_flags_resolves_prerequisites_from_the_snapshot() {
        let flags: HashMap<String, Arc<FeatureFlag>> = serde_json::from_value::<Vec<FeatureFlag>>(
            json!([{
                "key": "gated", "on": true, "variations": [false, true],
                "prerequisites": [{"key": "pre", "variation": 0}],
                "fallthrough": {"variation": 1}
            }]),
        )
        .unwrap()
        .into_iter()
        .map(|flag| (flag.key.clone(), Arc::new(flag)))
        .collect();

        /// Lists `gated` but rejects single-flag fetches.
        struct Snapshot(HashMap<String, Arc<FeatureFlag>>);

        impl FlagSource for Snapshot {
            fn get_flag(&self, _key: &str) -> Result<Option<Arc<FeatureFlag>>> {
                Err(Error::Unauthorized)
            }

            fn get_all_flags(&self) -> Result<HashMap<String, Arc<FeatureFlag>>> {
                Ok(self.0.clone())
            }
        }

        let client = ClientConfig::from_sdk_key("sdk-key")
            .flag_source(Arc::new(Snapshot(flags)))
            .event_publisher(Arc::new(RecordingPublisher::default()))
            .to_client()
            .unwrap();

        // Prerequisites resolve against the snapshot, so `pre` is simply missing.
        let values = client.all_flags(&User::new("u1")).unwrap();
        assert_eq!(values, HashMap::from([("gated".to_owned(), json!(null))]));
        assert!(!client.is_offline());
    }

    #[test]
    fn unauthorized_publisher_engages_circuit_breaker() {
        let publisher = Arc::new(RecordingPublisher {
            unauthorized: true,
            ..Default::default()
        });
        let client = client(&publisher);

        client.identify(&User::new("u1"));
        assert!(!client.flush());
        assert!(client.is_offline());

        assert_eq!(
            client.string_variation("banner", &User::new("vip"), "none"),
            "none"
        );
        client.identify(&User::new("u2"));
        client.flush();
        assert_eq!(publisher.batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn blank_users_are_evaluated_but_not_recorded() {
        let publisher = Arc::new(RecordingPublisher::default());
        let client = client(&publisher);

        assert_eq!(
            client.string_variation("banner", &User::new(" "), "none"),
            "red"
        );
        client.track("purchase", &User::new(""), Some(json!({"amount": 1})));
        client.identify(&User::new(""));
        client.flush();

        assert!(publisher.records().is_empty());
    }

    #[test]
    fn all_flags_evaluates_every_flag_without_events() {
        let publisher = Arc::new(RecordingPublisher::default());
        let client = client(&publisher);

        let flags = client.all_flags(&User::new("vip")).unwrap();
        assert_eq!(
            flags,
            HashMap::from([
                ("banner".to_owned(), json!("green")),
                ("limit".to_owned(), json!(20)),
                ("gated".to_owned(), json!(true)),
            ])
        );

        assert!(client.all_flags(&User::new("")).is_none());
        client.flush();
        assert!(publisher.records().is_empty());
    }

    #[test]
    fn secure_mode_hash() {
        let client = ClientConfig::from_sdk_key("sdk-key")
            .offline(true)
            .to_client()
            .unwrap();

        assert_eq!(
            client.secure_mode_hash(&User::new("user-key")),
            "12a38d8e0c8d5172b1c49ed0fcc487b09ca5cdd4409fd0c6b1b453c9fdca9020"
        );
        assert_eq!(client.secure_mode_hash(&User::new("")), "");
    }

    #[test]
    fn offline_client_returns_defaults_without_events() {
        let client = ClientConfig::from_sdk_key("sdk-key")
            .offline(true)
            .flag_source(store())
            .to_client()
            .unwrap();

        let detail = client.variation_detail("banner", &User::new("vip"), json!("none"));
        assert_eq!(detail.value, json!("none"));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::ClientOffline
            }
        );
        assert!(client.is_offline());
        assert!(client.start_flusher_thread(Default::default()).unwrap().is_none());
    }
}
