//! Per-session settings shared by the claimer, lease monitor and producer.
//!
//! Built by the caller (from code or any serde format) and frozen once a
//! claimer is constructed. Durations are expressed in milliseconds when
//! deserialized.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::SortKey;

/// Names of the document fields holding the three required roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldBindings {
    pub id: String,
    pub state: String,
    pub processing_time: String,
}

impl Default for FieldBindings {
    fn default() -> Self {
        Self {
            id: "_id".into(),
            state: "state".into(),
            processing_time: "processing_time".into(),
        }
    }
}

/// Literal values stored in the state field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateValues {
    pub pending: String,
    pub processing: String,
    pub processed: String,
    pub failed: String,
}

impl Default for StateValues {
    fn default() -> Self {
        Self {
            pending: "pending".into(),
            processing: "processing".into(),
            processed: "processed".into(),
            failed: "failed".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("fetch_limit must be greater than zero")]
    ZeroFetchLimit,
    #[error("buffer_size must be greater than zero")]
    ZeroBufferSize,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("state values must be distinct, `{0}` is used twice")]
    DuplicateState(String),
    #[error("field bindings must be distinct, `{0}` is used twice")]
    DuplicateField(String),
}

/// Claim session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub(crate) collection: String,
    pub(crate) fetch_query: serde_json::Map<String, Value>,
    pub(crate) fetch_order: Vec<SortKey>,
    pub(crate) fetch_limit: usize,
    pub(crate) fields: FieldBindings,
    pub(crate) states: StateValues,
    #[serde(with = "millis")]
    pub(crate) lease_timeout: Duration,
    #[serde(with = "millis")]
    pub(crate) sweep_interval: Duration,
    #[serde(with = "millis")]
    pub(crate) empty_backoff: Duration,
    #[serde(with = "millis")]
    pub(crate) error_backoff: Duration,
    pub(crate) buffer_size: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            collection: "batch".into(),
            fetch_query: Default::default(),
            fetch_order: Vec::new(),
            fetch_limit: Self::DEFAULT_FETCH_LIMIT,
            fields: FieldBindings::default(),
            states: StateValues::default(),
            lease_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            empty_backoff: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Configuration {
    const DEFAULT_FETCH_LIMIT: usize = 32;
    const DEFAULT_BUFFER_SIZE: usize = 64;

    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    /// Add an equality condition every candidate must satisfy.
    pub fn fetch_query(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fetch_query.insert(field.into(), value.into());
        self
    }

    pub fn fetch_order(self, fetch_order: Vec<SortKey>) -> Self {
        Self {
            fetch_order,
            ..self
        }
    }

    pub fn fetch_limit(self, fetch_limit: usize) -> Self {
        Self {
            fetch_limit,
            ..self
        }
    }

    pub fn fields(self, fields: FieldBindings) -> Self {
        Self { fields, ..self }
    }

    pub fn states(self, states: StateValues) -> Self {
        Self { states, ..self }
    }

    pub fn lease_timeout(self, lease_timeout: Duration) -> Self {
        Self {
            lease_timeout,
            ..self
        }
    }

    pub fn sweep_interval(self, sweep_interval: Duration) -> Self {
        Self {
            sweep_interval,
            ..self
        }
    }

    pub fn empty_backoff(self, empty_backoff: Duration) -> Self {
        Self {
            empty_backoff,
            ..self
        }
    }

    pub fn error_backoff(self, error_backoff: Duration) -> Self {
        Self {
            error_backoff,
            ..self
        }
    }

    pub fn buffer_size(self, buffer_size: usize) -> Self {
        Self {
            buffer_size,
            ..self
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    pub fn field_bindings(&self) -> &FieldBindings {
        &self.fields
    }

    pub fn state_values(&self) -> &StateValues {
        &self.states
    }

    /// Reject settings no session can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_limit == 0 {
            return Err(ConfigError::ZeroFetchLimit);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        for (name, value) in [
            ("lease_timeout", self.lease_timeout),
            ("sweep_interval", self.sweep_interval),
            ("empty_backoff", self.empty_backoff),
            ("error_backoff", self.error_backoff),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        let states = [
            &self.states.pending,
            &self.states.processing,
            &self.states.processed,
            &self.states.failed,
        ];
        if let Some(duplicate) = first_duplicate(&states) {
            return Err(ConfigError::DuplicateState(duplicate.clone()));
        }
        let fields = [
            &self.fields.id,
            &self.fields.state,
            &self.fields.processing_time,
        ];
        if let Some(duplicate) = first_duplicate(&fields) {
            return Err(ConfigError::DuplicateField(duplicate.clone()));
        }
        Ok(())
    }
}

fn first_duplicate<'a>(values: &[&'a String]) -> Option<&'a String> {
    values
        .iter()
        .enumerate()
        .find_map(|(i, value)| values[..i].contains(value).then_some(*value))
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
