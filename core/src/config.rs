//! Events module configuration.
//!
//! Configuration is loaded from environment variables by [`EventsConfig::from_env`].
//! Every variable is optional; unset values fall back to the defaults below.
//!
//! | Variable | Default |
//! |---|---|
//! | `AUDIT_EVENTS_DISABLED` | `false` |
//! | `AUDIT_SOURCE_MODULE` | (empty, reported as `unknown`) |
//! | `AUDIT_HTTP_HEADER_NAME` | (none) |
//! | `AUDIT_TENANT_HEADER_NAME` | `X-Tenant-Id` |
//! | `AUDIT_EVENTS_KAFKA_BROKERS` | (none) |
//! | `AUDIT_EVENTS_KAFKA_CONNECTION_TIMEOUT_MS` | `5000` |
//! | `AUDIT_EVENTS_KAFKA_REQUEST_TIMEOUT_MS` | `5000` |
//! | `AUDIT_EVENTS_KAFKA_DELIVERY_TIMEOUT_MS` | `5000` |
//! | `AUDIT_EVENTS_KAFKA_RETRY_BACKOFF_MS` | `100` |
//! | `AUDIT_EVENTS_KAFKA_MAX_BLOCK_MS` | `60000` |
//! | `AUDIT_EVENTS_KAFKA_RETRIES` | `1` |
//! | `AUDIT_EVENTS_CHANNELS` | (none), e.g. `audit=audit-events,business=business-events` |
//!
//! Per-channel broker settings use the same suffixes under
//! `AUDIT_EVENTS_CHANNEL_<NAME>_` (for example `AUDIT_EVENTS_CHANNEL_AUDIT_BROKERS`)
//! and fall back field by field to the global `AUDIT_EVENTS_KAFKA_` values.
//! `AUDIT_EVENTS_CHANNEL_<NAME>_SERIALIZER` selects `json` (default) or `bincode`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default tenant header.
pub const DEFAULT_TENANT_HEADER: &str = "X-Tenant-Id";

/// Primary tracking-id header.
pub const TRACKING_ID_HEADER: &str = "X-Tracking-Id";

/// Last-resort tracking-id header sent by API tooling.
pub const POSTMAN_TOKEN_HEADER: &str = "postman-token";

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("Invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },

    /// A channel entry has no topic.
    #[error("Channel '{channel}' has no topic")]
    BlankTopic {
        /// Channel name.
        channel: String,
    },

    /// No broker list for a channel, locally or globally.
    #[error("Channel '{channel}' has no brokers configured")]
    MissingBrokers {
        /// Channel name.
        channel: String,
    },
}

/// Payload encoding used for a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    /// UTF-8 JSON.
    #[default]
    Json,
    /// Compact binary encoding.
    Bincode,
}

impl SerializerKind {
    /// `payload_format` recorded for this encoding.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Bincode => "application/x-bincode",
        }
    }
}

impl FromStr for SerializerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "bincode" => Ok(Self::Bincode),
            other => Err(other.to_string()),
        }
    }
}

/// Broker client settings. Every field is optional so that per-channel
/// settings can fall back to the global ones.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    /// Comma-separated bootstrap servers.
    pub brokers: Option<String>,
    /// Socket connection setup timeout.
    pub connection_timeout_ms: Option<u64>,
    /// Broker request timeout.
    pub request_timeout_ms: Option<u64>,
    /// Upper bound on delivery, including retries.
    pub delivery_timeout_ms: Option<u64>,
    /// Backoff between retries.
    pub retry_backoff_ms: Option<u64>,
    /// Maximum time a send may wait for queue space.
    pub max_block_ms: Option<u64>,
    /// Retry count.
    pub retries: Option<u32>,
    /// Required acknowledgements (`all`, `1`, `0`).
    pub acks: Option<String>,
    /// Compression codec.
    pub compression: Option<String>,
    /// `plaintext`, `ssl`, `sasl_plaintext` or `sasl_ssl`.
    pub security_protocol: Option<String>,
    /// SASL mechanism.
    pub sasl_mechanism: Option<String>,
    /// SASL username.
    pub sasl_username: Option<String>,
    /// SASL password.
    pub sasl_password: Option<String>,
}

impl fmt::Debug for KafkaSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSettings")
            .field("brokers", &self.brokers)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("delivery_timeout_ms", &self.delivery_timeout_ms)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_block_ms", &self.max_block_ms)
            .field("retries", &self.retries)
            .field("acks", &self.acks)
            .field("compression", &self.compression)
            .field("security_protocol", &self.security_protocol)
            .field("sasl_mechanism", &self.sasl_mechanism)
            .field("sasl_username", &self.sasl_username)
            .field("sasl_password", &self.sasl_password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl KafkaSettings {
    /// Global defaults: 5s timeouts, 100ms backoff, 60s max block, one retry.
    #[must_use]
    pub const fn defaults() -> Self {
        Self {
            brokers: None,
            connection_timeout_ms: Some(5_000),
            request_timeout_ms: Some(5_000),
            delivery_timeout_ms: Some(5_000),
            retry_backoff_ms: Some(100),
            max_block_ms: Some(60_000),
            retries: Some(1),
            acks: None,
            compression: None,
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }

    /// `self` with every unset field taken from `fallback`.
    #[must_use]
    pub fn merged_over(&self, fallback: &Self) -> Self {
        fn pick<T: Clone>(local: &Option<T>, global: &Option<T>) -> Option<T> {
            local.clone().or_else(|| global.clone())
        }

        Self {
            brokers: pick(&self.brokers, &fallback.brokers),
            connection_timeout_ms: self.connection_timeout_ms.or(fallback.connection_timeout_ms),
            request_timeout_ms: self.request_timeout_ms.or(fallback.request_timeout_ms),
            delivery_timeout_ms: self.delivery_timeout_ms.or(fallback.delivery_timeout_ms),
            retry_backoff_ms: self.retry_backoff_ms.or(fallback.retry_backoff_ms),
            max_block_ms: self.max_block_ms.or(fallback.max_block_ms),
            retries: self.retries.or(fallback.retries),
            acks: pick(&self.acks, &fallback.acks),
            compression: pick(&self.compression, &fallback.compression),
            security_protocol: pick(&self.security_protocol, &fallback.security_protocol),
            sasl_mechanism: pick(&self.sasl_mechanism, &fallback.sasl_mechanism),
            sasl_username: pick(&self.sasl_username, &fallback.sasl_username),
            sasl_password: pick(&self.sasl_password, &fallback.sasl_password),
        }
    }

    fn from_lookup<F>(prefix: &str, lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |suffix: &str| {
            lookup(&format!("{prefix}{suffix}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Ok(Self {
            brokers: text("BROKERS"),
            connection_timeout_ms: parse(lookup, &format!("{prefix}CONNECTION_TIMEOUT_MS"))?,
            request_timeout_ms: parse(lookup, &format!("{prefix}REQUEST_TIMEOUT_MS"))?,
            delivery_timeout_ms: parse(lookup, &format!("{prefix}DELIVERY_TIMEOUT_MS"))?,
            retry_backoff_ms: parse(lookup, &format!("{prefix}RETRY_BACKOFF_MS"))?,
            max_block_ms: parse(lookup, &format!("{prefix}MAX_BLOCK_MS"))?,
            retries: parse(lookup, &format!("{prefix}RETRIES"))?,
            acks: text("ACKS"),
            compression: text("COMPRESSION"),
            security_protocol: text("SECURITY_PROTOCOL"),
            sasl_mechanism: text("SASL_MECHANISM"),
            sasl_username: text("SASL_USERNAME"),
            sasl_password: text("SASL_PASSWORD"),
        })
    }
}

/// Destination of one event type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Topic the channel publishes to.
    pub topic: String,
    /// Payload encoding.
    pub serializer: SerializerKind,
    /// Local overrides of the global broker settings.
    pub kafka: KafkaSettings,
}

impl ChannelConfig {
    /// Channel publishing JSON to `topic` with global broker settings.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    /// Use the given encoding.
    #[must_use]
    pub const fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    /// Override broker settings for this channel.
    #[must_use]
    pub fn with_kafka(mut self, kafka: KafkaSettings) -> Self {
        self.kafka = kafka;
        self
    }
}

/// Header names consulted when a request starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSettings {
    /// Tracking-id headers, in priority order.
    pub tracking_id_headers: Vec<String>,
    /// Session-id header, if any.
    pub session_header: Option<String>,
    /// Tenant-id header.
    pub tenant_header: String,
}

impl HeaderSettings {
    /// Settings with an optional custom audit header.
    ///
    /// The custom header becomes the second tracking-id source (after
    /// `X-Tracking-Id`) and is also read as the session id.
    #[must_use]
    pub fn new(audit_header: Option<&str>, tenant_header: impl Into<String>) -> Self {
        let mut tracking_id_headers = vec![
            TRACKING_ID_HEADER.to_string(),
            POSTMAN_TOKEN_HEADER.to_string(),
        ];
        let audit_header = audit_header
            .map(str::trim)
            .filter(|header| !header.is_empty())
            .map(str::to_string);
        if let Some(header) = &audit_header {
            tracking_id_headers.insert(1, header.clone());
        }
        Self {
            tracking_id_headers,
            session_header: audit_header,
            tenant_header: tenant_header.into(),
        }
    }
}

impl Default for HeaderSettings {
    fn default() -> Self {
        Self::new(None, DEFAULT_TENANT_HEADER)
    }
}

/// Events module configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Skip dispatch entirely (a warning is logged per event).
    pub disabled: bool,
    /// Source module reported when a route declares none.
    pub default_source_module: String,
    /// Optional custom tracking/session header.
    pub audit_header_name: Option<String>,
    /// Tenant header.
    pub tenant_header_name: String,
    /// Global broker settings.
    pub kafka: KafkaSettings,
    /// Channels keyed by event-type name.
    pub channels: BTreeMap<String, ChannelConfig>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            default_source_module: String::new(),
            audit_header_name: None,
            tenant_header_name: DEFAULT_TENANT_HEADER.to_string(),
            kafka: KafkaSettings::defaults(),
            channels: BTreeMap::new(),
        }
    }
}

impl EventsConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let kafka = KafkaSettings::from_lookup("AUDIT_EVENTS_KAFKA_", &lookup)?
            .merged_over(&defaults.kafka);

        let mut channels = BTreeMap::new();
        if let Some(list) = lookup("AUDIT_EVENTS_CHANNELS") {
            for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let Some((name, topic)) = entry.split_once('=') else {
                    return Err(ConfigError::InvalidValue {
                        key: "AUDIT_EVENTS_CHANNELS".to_string(),
                        value: entry.to_string(),
                    });
                };
                let name = name.trim().to_ascii_lowercase();
                let prefix = format!("AUDIT_EVENTS_CHANNEL_{}_", name.to_ascii_uppercase());
                let serializer_key = format!("{prefix}SERIALIZER");
                let serializer = match lookup(&serializer_key) {
                    Some(raw) => raw
                        .parse::<SerializerKind>()
                        .map_err(|value| ConfigError::InvalidValue {
                            key: serializer_key.clone(),
                            value,
                        })?,
                    None => SerializerKind::default(),
                };
                channels.insert(
                    name,
                    ChannelConfig {
                        topic: topic.trim().to_string(),
                        serializer,
                        kafka: KafkaSettings::from_lookup(&prefix, &lookup)?,
                    },
                );
            }
        }

        Ok(Self {
            disabled: parse(&lookup, "AUDIT_EVENTS_DISABLED")?.unwrap_or(defaults.disabled),
            default_source_module: lookup("AUDIT_SOURCE_MODULE")
                .unwrap_or(defaults.default_source_module),
            audit_header_name: lookup("AUDIT_HTTP_HEADER_NAME").filter(|h| !h.trim().is_empty()),
            tenant_header_name: lookup("AUDIT_TENANT_HEADER_NAME")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.tenant_header_name),
            kafka,
            channels,
        })
    }

    /// Register a channel for an event-type name.
    #[must_use]
    pub fn with_channel(mut self, event_type: impl Into<String>, channel: ChannelConfig) -> Self {
        self.channels.insert(event_type.into(), channel);
        self
    }

    /// Channel configured for an event-type name.
    #[must_use]
    pub fn channel(&self, event_type: &str) -> Option<&ChannelConfig> {
        self.channels.get(event_type)
    }

    /// Effective broker settings for a channel: local overrides over global.
    #[must_use]
    pub fn channel_settings(&self, event_type: &str) -> Option<KafkaSettings> {
        self.channel(event_type)
            .map(|channel| channel.kafka.merged_over(&self.kafka))
    }

    /// Header names derived from this configuration.
    #[must_use]
    pub fn header_settings(&self) -> HeaderSettings {
        HeaderSettings::new(self.audit_header_name.as_deref(), self.tenant_header_name.clone())
    }

    /// Check the channel table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BlankTopic`] for a channel without a topic and,
    /// unless the module is disabled, [`ConfigError::MissingBrokers`] for a
    /// channel with no broker list locally or globally.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, channel) in &self.channels {
            if channel.topic.trim().is_empty() {
                return Err(ConfigError::BlankTopic {
                    channel: name.clone(),
                });
            }
            if !self.disabled
                && channel.kafka.merged_over(&self.kafka).brokers.is_none()
            {
                return Err(ConfigError::MissingBrokers {
                    channel: name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            })
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = EventsConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, EventsConfig::default());
        assert_eq!(config.kafka.delivery_timeout_ms, Some(5_000));
        assert_eq!(config.kafka.max_block_ms, Some(60_000));
        assert_eq!(config.kafka.retries, Some(1));
    }

    #[test]
    fn channels_fall_back_to_global_settings() {
        let config = EventsConfig::from_lookup(lookup(&[
            ("AUDIT_EVENTS_KAFKA_BROKERS", "global:9092"),
            ("AUDIT_EVENTS_KAFKA_RETRIES", "3"),
            ("AUDIT_EVENTS_CHANNELS", "audit=audit-events, business=business-events"),
            ("AUDIT_EVENTS_CHANNEL_BUSINESS_BROKERS", "local:9092"),
            ("AUDIT_EVENTS_CHANNEL_BUSINESS_SERIALIZER", "bincode"),
        ]))
        .unwrap();

        let audit = config.channel_settings("audit").unwrap();
        assert_eq!(audit.brokers.as_deref(), Some("global:9092"));
        assert_eq!(audit.retries, Some(3));

        let business = config.channel_settings("business").unwrap();
        assert_eq!(business.brokers.as_deref(), Some("local:9092"));
        assert_eq!(business.delivery_timeout_ms, Some(5_000));
        assert_eq!(
            config.channel("business").unwrap().serializer,
            SerializerKind::Bincode
        );
        assert_eq!(config.channel("audit").unwrap().topic, "audit-events");
        config.validate().unwrap();
    }

    #[test]
    fn invalid_number_is_reported() {
        let err = EventsConfig::from_lookup(lookup(&[(
            "AUDIT_EVENTS_KAFKA_RETRIES",
            "many",
        )]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "AUDIT_EVENTS_KAFKA_RETRIES".to_string(),
                value: "many".to_string()
            }
        );
    }

    #[test]
    fn malformed_channel_entry_is_reported() {
        let err =
            EventsConfig::from_lookup(lookup(&[("AUDIT_EVENTS_CHANNELS", "audit")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn validate_requires_topic_and_brokers() {
        let config = EventsConfig::default().with_channel("audit", ChannelConfig::new(" "));
        assert_eq!(
            config.validate(),
            Err(ConfigError::BlankTopic {
                channel: "audit".to_string()
            })
        );

        let config = EventsConfig::default().with_channel("audit", ChannelConfig::new("t"));
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingBrokers {
                channel: "audit".to_string()
            })
        );

        let disabled = EventsConfig {
            disabled: true,
            ..config
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn audit_header_is_second_tracking_source() {
        let settings = HeaderSettings::new(Some("X-Audit-Id"), "X-Org");
        assert_eq!(
            settings.tracking_id_headers,
            vec!["X-Tracking-Id", "X-Audit-Id", "postman-token"]
        );
        assert_eq!(settings.session_header.as_deref(), Some("X-Audit-Id"));
        assert_eq!(settings.tenant_header, "X-Org");

        let plain = HeaderSettings::default();
        assert_eq!(plain.tracking_id_headers, vec!["X-Tracking-Id", "postman-token"]);
        assert!(plain.session_header.is_none());
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let settings = KafkaSettings {
            sasl_password: Some("hunter2".to_string()),
            ..KafkaSettings::default()
        };
        assert!(!format!("{settings:?}").contains("hunter2"));
    }
}
