use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{Client, EventPublisher, FlagSource, FlagValue, Result};

/// Configuration for [`Client`].
pub struct ClientConfig {
    pub(crate) sdk_key: String,
    pub(crate) base_url: String,
    pub(crate) events_url: String,
    pub(crate) timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) capacity: usize,
    pub(crate) offline: bool,
    pub(crate) send_events: bool,
    pub(crate) defaults: HashMap<String, FlagValue>,
    pub(crate) all_attributes_private: bool,
    pub(crate) private_attribute_names: Vec<String>,
    pub(crate) flag_cache_ttl: Option<Duration>,
    pub(crate) flag_source: Option<Arc<dyn FlagSource + Send + Sync>>,
    pub(crate) event_publisher: Option<Arc<dyn EventPublisher + Send + Sync>>,
}

impl ClientConfig {
    /// Default base URL of the flag service.
    pub const DEFAULT_BASE_URL: &'static str = "https://app.launchdarkly.com";
    /// Default base URL of the events service.
    pub const DEFAULT_EVENTS_URL: &'static str = "https://events.launchdarkly.com";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use flagship::ClientConfig;
    /// ClientConfig::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Self {
        ClientConfig {
            sdk_key: sdk_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            events_url: ClientConfig::DEFAULT_EVENTS_URL.to_owned(),
            timeout: ClientConfig::DEFAULT_TIMEOUT,
            connect_timeout: ClientConfig::DEFAULT_CONNECT_TIMEOUT,
            capacity: crate::EventProcessor::DEFAULT_CAPACITY,
            offline: false,
            send_events: true,
            defaults: HashMap::new(),
            all_attributes_private: false,
            private_attribute_names: Vec::new(),
            flag_cache_ttl: None,
            flag_source: None,
            event_publisher: None,
        }
    }

    /// Override base URL of the flag service. Clients should use the default setting in most
    /// cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override base URL of the events service.
    pub fn events_url(mut self, events_url: impl Into<String>) -> Self {
        self.events_url = events_url.into();
        self
    }

    /// Total request timeout for flag and event requests.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Maximum number of events held between flushes. Events beyond it are dropped.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// An offline client never touches the network: every evaluation returns the default value
    /// and no events are recorded.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn send_events(mut self, send_events: bool) -> Self {
        self.send_events = send_events;
        self
    }

    /// Use `value` instead of the caller's default whenever `flag_key` resolves to a default.
    ///
    /// ```
    /// # use flagship::ClientConfig;
    /// let config = ClientConfig::from_sdk_key("sdk-key").default_value("new-checkout", false);
    /// ```
    pub fn default_value(mut self, flag_key: impl Into<String>, value: impl Into<FlagValue>) -> Self {
        self.defaults.insert(flag_key.into(), value.into());
        self
    }

    /// Strip every user attribute except `key` from events.
    pub fn all_attributes_private(mut self, all_attributes_private: bool) -> Self {
        self.all_attributes_private = all_attributes_private;
        self
    }

    /// Strip the named user attribute from events for all users.
    pub fn private_attribute(mut self, name: impl Into<String>) -> Self {
        self.private_attribute_names.push(name.into());
        self
    }

    /// Cache flags fetched from the flag source for `ttl`.
    /// [`CachedFlagSource::DEFAULT_TTL`](crate::CachedFlagSource::DEFAULT_TTL) is a sensible value.
    pub fn flag_cache_ttl(mut self, ttl: Duration) -> Self {
        self.flag_cache_ttl = Some(ttl);
        self
    }

    /// Use a custom flag source instead of fetching flags over HTTP.
    pub fn flag_source(mut self, flag_source: Arc<dyn FlagSource + Send + Sync>) -> Self {
        self.flag_source = Some(flag_source);
        self
    }

    /// Use a custom event publisher instead of posting events over HTTP.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use flagship::{ClientConfig, CurlEventPublisher};
    /// let publisher = CurlEventPublisher::new(ClientConfig::DEFAULT_EVENTS_URL, "sdk-key").unwrap();
    /// let config = ClientConfig::from_sdk_key("sdk-key").event_publisher(Arc::new(publisher));
    /// ```
    pub fn event_publisher(
        mut self,
        event_publisher: Arc<dyn EventPublisher + Send + Sync>,
    ) -> Self {
        self.event_publisher = Some(event_publisher);
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// Fails only if a base URL is invalid or the HTTP client cannot be built.
    ///
    /// ```
    /// # use flagship::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_sdk_key("sdk-key").to_client().unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}
