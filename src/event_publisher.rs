//! Delivery of serialized event batches to the events service.
use std::{
    io::Write,
    process::{Command, Stdio},
    sync::Arc,
    time::Duration,
};

use reqwest::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT},
    StatusCode, Url,
};

use crate::{Error, Result};

/// Header carrying the event payload schema version.
pub const EVENT_SCHEMA_HEADER: &str = "X-LaunchDarkly-Event-Schema";
/// Schema version of the payloads produced by [`EventSerializer`](crate::EventSerializer).
pub const EVENT_SCHEMA_VERSION: u32 = 2;

const BULK_ENDPOINT: &str = "/bulk";

/// Delivers a JSON array of events.
///
/// `Ok(())` means the batch was accepted. [`Error::Unauthorized`] means the SDK key was rejected,
/// which permanently disables event delivery. Any other error is a transient failure and the
/// batch is dropped.
pub trait EventPublisher {
    fn publish(&self, payload: &[u8]) -> Result<()>;
}

impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    fn publish(&self, payload: &[u8]) -> Result<()> {
        (**self).publish(payload)
    }
}

fn bulk_url(events_url: &str) -> Result<Url> {
    Url::parse(&format!(
        "{}{}",
        events_url.trim_end_matches('/'),
        BULK_ENDPOINT
    ))
    .map_err(Error::InvalidBaseUrl)
}

/// Posts batches in-process using a blocking HTTP client. The call returns once the server has
/// answered or the request timed out.
pub struct HttpEventPublisher {
    client: reqwest::blocking::Client,
    bulk_url: Url,
    sdk_key: String,
}

impl HttpEventPublisher {
    pub fn new(
        events_url: &str,
        sdk_key: impl Into<String>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<HttpEventPublisher> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(HttpEventPublisher {
            client,
            bulk_url: bulk_url(events_url)?,
            sdk_key: sdk_key.into(),
        })
    }
}

impl EventPublisher for HttpEventPublisher {
    fn publish(&self, payload: &[u8]) -> Result<()> {
        log::debug!(target: "flagship", bytes = payload.len(); "publishing events");
        let response = self
            .client
            .post(self.bulk_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, &self.sdk_key)
            .header(USER_AGENT, crate::USER_AGENT)
            .header(EVENT_SCHEMA_HEADER, EVENT_SCHEMA_VERSION.to_string())
            .body(payload.to_vec())
            .send()?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(Error::Unauthorized),
            status if status.is_success() => Ok(()),
            status => Err(Error::UnexpectedStatus(status.as_u16())),
        }
    }
}

/// Hands batches to a detached `curl` process so the caller never waits on the network.
///
/// Delivery failures are invisible to this publisher: `publish` succeeds as soon as the process
/// has been spawned.
pub struct CurlEventPublisher {
    curl: String,
    bulk_url: Url,
    sdk_key: String,
    timeout: Duration,
    connect_timeout: Duration,
}

impl CurlEventPublisher {
    pub const DEFAULT_CURL: &'static str = "curl";

    pub fn new(events_url: &str, sdk_key: impl Into<String>) -> Result<CurlEventPublisher> {
        Ok(CurlEventPublisher {
            curl: CurlEventPublisher::DEFAULT_CURL.to_owned(),
            bulk_url: bulk_url(events_url)?,
            sdk_key: sdk_key.into(),
            timeout: crate::ClientConfig::DEFAULT_TIMEOUT,
            connect_timeout: crate::ClientConfig::DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Path to the `curl` executable. Defaults to looking up `curl` in `PATH`.
    pub fn curl(mut self, curl: impl Into<String>) -> Self {
        self.curl = curl.into();
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.curl);
        command
            .arg("--silent")
            .args(["-X", "POST"])
            .arg("--max-time")
            .arg(self.timeout.as_secs_f64().to_string())
            .arg("--connect-timeout")
            .arg(self.connect_timeout.as_secs_f64().to_string())
            .args(["-H", "Content-Type: application/json"])
            .args(["-H", "Accept: application/json"])
            .arg("-H")
            .arg(format!("Authorization: {}", self.sdk_key))
            .arg("-H")
            .arg(format!("User-Agent: {}", crate::USER_AGENT))
            .arg("-H")
            .arg(format!("{EVENT_SCHEMA_HEADER}: {EVENT_SCHEMA_VERSION}"))
            .args(["--data-binary", "@-"])
            .arg(self.bulk_url.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

impl EventPublisher for CurlEventPublisher {
    fn publish(&self, payload: &[u8]) -> Result<()> {
        let mut child = self.command().spawn()?;
        let stdin = child.stdin.take();
        let payload = payload.to_vec();

        // Feed the payload and reap the process off the caller's thread.
        std::thread::Builder::new()
            .name("flagship-curl".to_owned())
            .spawn(move || {
                if let Some(mut stdin) = stdin {
                    if let Err(err) = stdin.write_all(&payload) {
                        log::warn!(target: "flagship", "failed to write events to curl: {err}");
                    }
                }
                match child.wait() {
                    Ok(status) if !status.success() => {
                        log::warn!(target: "flagship", "curl exited with {status}");
                    }
                    Ok(_) => {}
                    Err(err) => log::warn!(target: "flagship", "failed to wait for curl: {err}"),
                }
            })?;

        Ok(())
    }
}
