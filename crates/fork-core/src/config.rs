//! Fork policy configuration
//!
//! A [`ForkContextConfig`] is the immutable policy bag applied to a fork context
//! when it is created. The router keeps one bag per fork kind, grouped in
//! [`ForkManagerConfig`]:
//!
//! ```text
//! ForkManagerConfig
//!        │
//!        ├── call     (INVITE)
//!        ├── message  (MESSAGE, store-and-forward)
//!        └── basic    (everything else)
//! ```
//!
//! Durations are expressed in whole seconds on the wire so that the JSON form
//! matches the router's key/value configuration.
//!
//! ```rust
//! use rvoip_fork_core::config::ForkContextConfig;
//! use std::time::Duration;
//!
//! let config = ForkContextConfig::default()
//!     .with_fork_late(true)
//!     .with_delivery_timeout(Duration::from_secs(3600))
//!     .with_urgent_timeout(Duration::from_secs(5));
//!
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ForkError, ForkResult};

/// Message forks only get an absolute deadline and an acceptance timer when the
/// delivery timeout is strictly larger than this.
pub const MESSAGE_DELIVERY_TIMEOUT_THRESHOLD: Duration = Duration::from_secs(30);

/// Upper bound for every fork timer: one hundred years
pub const MAX_FORK_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Policy bag for one fork context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkContextConfig {
    /// Keep the fork alive after branch failures, waiting for devices to register again
    pub fork_late: bool,

    /// Maximum lifetime of a fork-late context (and delivery deadline of a message)
    #[serde(with = "duration_secs")]
    pub delivery_timeout: Duration,

    /// Delay before an urgent error is forwarded (call) or a message is accepted with a 202
    #[serde(with = "duration_secs")]
    pub urgent_timeout: Duration,

    /// Time given to one priority tier before the next one is started. Zero disables tiers.
    #[serde(with = "duration_secs")]
    pub current_branches_timeout: Duration,

    /// Treat 603 Decline as an urgent code
    pub treat_decline_as_urgent: bool,

    /// Treat every error code as urgent
    pub treat_all_errors_as_urgent: bool,

    /// Allow the proxy to send 180/110 style responses on its own
    pub permit_self_generated_provisional_response: bool,

    /// How long to wait for a device answer after a push notification. Zero disables.
    #[serde(with = "duration_secs")]
    pub push_response_timeout: Duration,

    /// Do not treat a 6xx on one branch as a global failure
    pub fork_no_global_decline: bool,
}

impl Default for ForkContextConfig {
    fn default() -> Self {
        Self {
            fork_late: false,
            delivery_timeout: Duration::from_secs(30),
            urgent_timeout: Duration::from_secs(5),
            current_branches_timeout: Duration::ZERO,
            treat_decline_as_urgent: false,
            treat_all_errors_as_urgent: false,
            permit_self_generated_provisional_response: true,
            push_response_timeout: Duration::ZERO,
            fork_no_global_decline: false,
        }
    }
}

impl ForkContextConfig {
    pub fn with_fork_late(mut self, fork_late: bool) -> Self {
        self.fork_late = fork_late;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_urgent_timeout(mut self, timeout: Duration) -> Self {
        self.urgent_timeout = timeout;
        self
    }

    pub fn with_current_branches_timeout(mut self, timeout: Duration) -> Self {
        self.current_branches_timeout = timeout;
        self
    }

    pub fn with_decline_as_urgent(mut self, urgent: bool) -> Self {
        self.treat_decline_as_urgent = urgent;
        self
    }

    pub fn with_all_errors_as_urgent(mut self, urgent: bool) -> Self {
        self.treat_all_errors_as_urgent = urgent;
        self
    }

    pub fn with_self_generated_provisional_response(mut self, permit: bool) -> Self {
        self.permit_self_generated_provisional_response = permit;
        self
    }

    pub fn with_push_response_timeout(mut self, timeout: Duration) -> Self {
        self.push_response_timeout = timeout;
        self
    }

    pub fn with_no_global_decline(mut self, no_global_decline: bool) -> Self {
        self.fork_no_global_decline = no_global_decline;
        self
    }

    /// Whether a message fork created with this policy gets an acceptance timer
    /// and an absolute delivery deadline.
    pub fn message_deadline_enabled(&self) -> bool {
        self.fork_late && self.delivery_timeout > MESSAGE_DELIVERY_TIMEOUT_THRESHOLD
    }

    /// Validate the configuration
    pub fn validate(&self) -> ForkResult<()> {
        if self.fork_late && self.delivery_timeout.is_zero() {
            return Err(ForkError::config("fork-late requires a non-zero delivery timeout"));
        }
        if self.urgent_timeout.is_zero() {
            return Err(ForkError::config("urgent timeout must be greater than zero"));
        }
        let timeouts = [
            ("delivery", self.delivery_timeout),
            ("urgent", self.urgent_timeout),
            ("current branches", self.current_branches_timeout),
            ("push response", self.push_response_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, timeout)| *timeout > MAX_FORK_TIMEOUT) {
            return Err(ForkError::config(format!(
                "{} timeout exceeds {} seconds",
                name,
                MAX_FORK_TIMEOUT.as_secs()
            )));
        }
        Ok(())
    }

    /// Parse and validate a configuration from JSON
    pub fn from_json_str(json: &str) -> ForkResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Per-kind fork policies used by the [`ForkManager`](crate::manager::ForkManager).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkManagerConfig {
    pub call: ForkContextConfig,
    pub message: ForkContextConfig,
    pub basic: ForkContextConfig,
}

impl ForkManagerConfig {
    pub fn validate(&self) -> ForkResult<()> {
        self.call
            .validate()
            .and_then(|_| self.message.validate())
            .and_then(|_| self.basic.validate())
    }

    pub fn from_json_str(json: &str) -> ForkResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
