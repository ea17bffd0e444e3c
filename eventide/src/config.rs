//! Serializable configuration for the read path.
//!
//! Every struct implements `Default` and fills missing fields from it, so
//! hosts can load partial documents from any serde format.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::publisher::{MaxRetriesFailureAction, RetrySettings};

/// Options for the [`EventDispatcher`](crate::EventDispatcher).
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Deadline for all projections to handle one event.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub projection_handler_timeout: Duration,
    /// Keep dispatching after a projection misses the deadline.
    pub continue_after_timeout: bool,
    /// Keep dispatching after a projection or context hook fails.
    pub continue_after_projection_exception: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            projection_handler_timeout: Duration::from_millis(5000),
            continue_after_timeout: false,
            continue_after_projection_exception: false,
        }
    }
}

/// How the delay between retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Wait the same delay before every retry.
    #[default]
    Fixed,
    /// Double the delay after every retry.
    Exponential,
}

/// Retry options for the [`AcknowledgingPublisher`](crate::AcknowledgingPublisher).
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Number of retries after the first failed attempt.
    pub max_retry_count: u32,
    /// Delay before the first retry.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub delay: Duration,
    /// Growth of the delay between retries.
    pub backoff: Backoff,
    /// Upper bound for exponential delays.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub max_delay: Option<Duration>,
    /// What to do with an event once retries are exhausted.
    pub max_retries_failure_action: MaxRetriesFailureAction,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            delay: Duration::from_millis(250),
            backoff: Backoff::Fixed,
            max_delay: None,
            max_retries_failure_action: MaxRetriesFailureAction::Park,
        }
    }
}

impl From<&RetryConfig> for RetrySettings {
    fn from(config: &RetryConfig) -> Self {
        match config.backoff {
            Backoff::Fixed => RetrySettings::fixed(
                config.max_retry_count,
                config.delay,
                config.max_retries_failure_action,
            ),
            Backoff::Exponential => RetrySettings::exponential(
                config.max_retry_count,
                config.delay,
                config.max_delay.unwrap_or(Duration::MAX),
                config.max_retries_failure_action,
            ),
        }
    }
}

/// Describes the durable subscription a publisher consumes.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Stream the subscription group reads.
    pub stream: String,
    /// Subscription group name.
    pub group: String,
    /// Pause before reopening a dropped subscription.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub resubscribe_delay: Duration,
    /// Retry behaviour for failing events.
    pub retry: RetryConfig,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            stream: "$all".to_string(),
            group: "default".to_string(),
            resubscribe_delay: Duration::from_millis(1000),
            retry: RetryConfig::default(),
        }
    }
}
