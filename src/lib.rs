//! A server-side feature flag SDK.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that evaluates feature flags for a [`User`], where each
//! user has a unique key and a set of attributes. Evaluation walks a flag's prerequisites,
//! individual targets, rules, and percentage rollouts, and results in a JSON [`FlagValue`]. If a
//! flag cannot be evaluated, the caller-supplied default is returned instead.
//!
//! Flag definitions come from a [`FlagSource`]: over HTTP ([`HttpFlagSource`]), optionally through
//! a time-to-live cache ([`CachedFlagSource`]), or from memory ([`FlagStore`]).
//!
//! Every evaluation, custom event ([`Client::track`]), and identify call ([`Client::identify`])
//! records an analytics event. Events are held in a bounded queue and delivered in batches by an
//! [`EventPublisher`] when [`Client::flush`] is called or from a background
//! [`FlusherThread`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Evaluation methods never return them: failures
//! are logged and the default value is used. A rejected SDK key switches the client to offline
//! mode for the rest of its lifetime.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages under the `flagship` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! See `demos/simple` in the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]

mod bucketing;
mod client;
mod config;
mod error;
mod eval;
mod event;
mod event_processor;
mod event_publisher;
mod flag;
mod flag_source;
mod flag_store;
mod flusher;
mod rules;
mod user;

pub use bucketing::bucket_user;
pub use client::{Client, EvaluationDetail};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use eval::{Decision, ErrorKind, Reason};
pub use event::{CustomEvent, Event, EventSerializer, FeatureRequestEvent, IdentifyEvent};
pub use event_processor::EventProcessor;
pub use event_publisher::{
    CurlEventPublisher, EventPublisher, HttpEventPublisher, EVENT_SCHEMA_HEADER,
    EVENT_SCHEMA_VERSION,
};
pub use flag::{
    FeatureFlag, FlagValue, Prerequisite, Rollout, RolloutKind, Target, TryParse,
    VariationOrRollout, WeightedVariation,
};
pub use flag_source::{CachedFlagSource, FlagSource, HttpFlagSource};
pub use flag_store::FlagStore;
pub use flusher::{FlusherThread, FlusherThreadConfig};
pub use rules::{Clause, Operator, Rule};
pub use user::{AttributeValue, User, UserBuilder};

/// Sent as the `User-Agent` header of every request.
pub const USER_AGENT: &str = concat!("RustClient/", env!("CARGO_PKG_VERSION"));
