//! Sources of feature flag definitions.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::{Duration, Instant},
};

use reqwest::{
    header::{AUTHORIZATION, USER_AGENT},
    StatusCode, Url,
};
use serde::de::DeserializeOwned;

use crate::{flag::TryParse, Error, FeatureFlag, Result};

/// Supplies flag definitions to the client and to prerequisite evaluation.
///
/// Implementations must return [`Error::Unauthorized`] when the SDK key is rejected; the client
/// treats that as permanent and stops using the source.
pub trait FlagSource {
    /// Fetch a single flag. `Ok(None)` means the flag does not exist.
    fn get_flag(&self, key: &str) -> Result<Option<Arc<FeatureFlag>>>;

    /// Fetch a snapshot of all flags, keyed by flag key.
    fn get_all_flags(&self) -> Result<HashMap<String, Arc<FeatureFlag>>>;
}

impl<T: FlagSource + ?Sized> FlagSource for Arc<T> {
    fn get_flag(&self, key: &str) -> Result<Option<Arc<FeatureFlag>>> {
        (**self).get_flag(key)
    }

    fn get_all_flags(&self) -> Result<HashMap<String, Arc<FeatureFlag>>> {
        (**self).get_all_flags()
    }
}

/// A fixed snapshot, as returned by [`FlagSource::get_all_flags`].
impl FlagSource for HashMap<String, Arc<FeatureFlag>> {
    fn get_flag(&self, key: &str) -> Result<Option<Arc<FeatureFlag>>> {
        Ok(self.get(key).cloned())
    }

    fn get_all_flags(&self) -> Result<HashMap<String, Arc<FeatureFlag>>> {
        Ok(self.clone())
    }
}

const LATEST_FLAGS_ENDPOINT: &str = "/sdk/latest-flags";

/// Fetches flags from the flag service over HTTP on every call.
///
/// Wrap it in a [`CachedFlagSource`] to avoid a round trip per evaluation.
pub struct HttpFlagSource {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    flags_url: Url,
    sdk_key: String,
    /// If we receive a 401 Unauthorized error during a request, it means the SDK key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpFlagSource {
    pub fn new(
        base_url: &str,
        sdk_key: impl Into<String>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<HttpFlagSource> {
        let flags_url = Url::parse(&format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            LATEST_FLAGS_ENDPOINT
        ))
        .map_err(Error::InvalidBaseUrl)?;

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(HttpFlagSource {
            client,
            flags_url,
            sdk_key: sdk_key.into(),
            unauthorized: AtomicBool::new(false),
        })
    }

    fn flag_url(&self, key: &str) -> Result<Url> {
        let mut url = self.flags_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .push(key);
        Ok(url)
    }

    fn fetch<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        if self.unauthorized.load(Ordering::Acquire) {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "flagship", url:display = url; "fetching flags");
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, &self.sdk_key)
            .header(USER_AGENT, crate::USER_AGENT)
            .send()?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "flagship", "flag source rejected the SDK key");
                self.unauthorized.store(true, Ordering::Release);
                Err(Error::Unauthorized)
            }
            status if status.is_success() => Ok(Some(response.json()?)),
            status => {
                log::warn!(target: "flagship", status = status.as_u16(); "unexpected response while fetching flags");
                Err(Error::UnexpectedStatus(status.as_u16()))
            }
        }
    }
}

impl FlagSource for HttpFlagSource {
    fn get_flag(&self, key: &str) -> Result<Option<Arc<FeatureFlag>>> {
        let url = self.flag_url(key)?;
        let flag: Option<TryParse<FeatureFlag>> = self.fetch(url)?;
        Ok(match flag {
            None => None,
            Some(TryParse::Parsed(flag)) => Some(Arc::new(flag)),
            Some(TryParse::ParseFailed(_)) => {
                log::warn!(target: "flagship", flag_key = key; "failed to parse flag definition");
                None
            }
        })
    }

    fn get_all_flags(&self) -> Result<HashMap<String, Arc<FeatureFlag>>> {
        let flags: HashMap<String, TryParse<FeatureFlag>> =
            self.fetch(self.flags_url.clone())?.unwrap_or_default();

        log::debug!(target: "flagship", count = flags.len(); "fetched all flags");
        Ok(flags
            .into_iter()
            .filter_map(|(key, flag)| match flag {
                TryParse::Parsed(flag) => Some((key, Arc::new(flag))),
                TryParse::ParseFailed(_) => {
                    log::warn!(target: "flagship", flag_key:display = key; "failed to parse flag definition");
                    None
                }
            })
            .collect())
    }
}

struct CacheEntry {
    fetched_at: Instant,
    flag: Option<Arc<FeatureFlag>>,
}

/// Caches flags fetched from another source for a fixed time-to-live.
///
/// Missing flags are cached too. Errors are never cached.
pub struct CachedFlagSource<S> {
    inner: S,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl<S: FlagSource> CachedFlagSource<S> {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

    pub fn new(inner: S, ttl: Duration) -> CachedFlagSource<S> {
        CachedFlagSource {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &str) -> Option<Option<Arc<FeatureFlag>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.flag.clone())
    }

    fn store(&self, key: &str, flag: Option<Arc<FeatureFlag>>) {
        let entry = CacheEntry {
            fetched_at: Instant::now(),
            flag,
        };
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| entry.fetched_at.elapsed() < self.ttl);
        entries.insert(key.to_owned(), entry);
    }
}

impl<S: FlagSource> FlagSource for CachedFlagSource<S> {
    fn get_flag(&self, key: &str) -> Result<Option<Arc<FeatureFlag>>> {
        if let Some(flag) = self.cached(key) {
            return Ok(flag);
        }
        let flag = self.inner.get_flag(key)?;
        self.store(key, flag.clone());
        Ok(flag)
    }

    fn get_all_flags(&self) -> Result<HashMap<String, Arc<FeatureFlag>>> {
        let flags = self.inner.get_all_flags()?;
        for (key, flag) in &flags {
            self.store(key, Some(flag.clone()));
        }
        Ok(flags)
    }
}
