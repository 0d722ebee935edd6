//! Consumption options and the merge of caller overrides onto defaults.
//!
//! Every registration resolves its effective [`ConsumeOptions`] exactly once,
//! by laying a partial [`ConsumeOverrides`] over a default set. Overrides that
//! arrive untyped (configuration files, CLI flags) go through
//! [`ConsumeOverrides::from_map`], which checks every value against the type
//! of the option it targets before anything is merged.

use crate::messaging::error::{MessagingError, MessagingResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default worker-pool size per subscription
pub const DEFAULT_THREADS: usize = 5;

/// Fully resolved options for one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
    /// Queue survives a broker restart
    pub durable: bool,

    /// Queue is removed once its last consumer goes away
    pub auto_delete: bool,

    /// Broker considers deliveries acknowledged as soon as they are sent
    pub auto_ack: bool,

    /// Queue is restricted to the declaring connection
    pub exclusive: bool,

    /// Skip server confirmation of declare, bind and consume
    pub no_wait: bool,

    /// Passed through to the transport; not every broker enforces it
    pub no_local: bool,

    /// Consumer tag, empty for a server-assigned tag
    pub consumer: String,

    /// Number of concurrent workers draining the delivery stream
    pub threads: usize,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            auto_ack: false,
            exclusive: false,
            no_wait: false,
            no_local: false,
            consumer: String::new(),
            threads: DEFAULT_THREADS,
        }
    }
}

impl ConsumeOptions {
    /// Validate the resolved options
    pub fn validate(&self) -> MessagingResult<()> {
        if self.threads == 0 {
            return Err(MessagingError::Config(
                "threads must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial set of options supplied by a caller at registration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOverrides {
    durable: Option<bool>,
    auto_delete: Option<bool>,
    auto_ack: Option<bool>,
    exclusive: Option<bool>,
    no_wait: Option<bool>,
    no_local: Option<bool>,
    consumer: Option<String>,
    threads: Option<usize>,
}

impl ConsumeOverrides {
    /// Empty override set; merging it yields the defaults unchanged
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the durable flag
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Set the auto-delete flag
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    /// Set the auto-acknowledge flag
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = Some(auto_ack);
        self
    }

    /// Set the exclusive flag
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = Some(exclusive);
        self
    }

    /// Set the no-wait flag
    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = Some(no_wait);
        self
    }

    /// Set the no-local flag
    pub fn no_local(mut self, no_local: bool) -> Self {
        self.no_local = Some(no_local);
        self
    }

    /// Set the consumer tag
    pub fn consumer(mut self, tag: impl Into<String>) -> Self {
        self.consumer = Some(tag.into());
        self
    }

    /// Set the worker-pool size
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Whether no option is overridden
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Build overrides from an untyped map.
    ///
    /// Keys use the wire names (`durable`, `autoDelete`, `autoAck`,
    /// `exclusive`, `noWait`, `noLocal`, `consumer`, `threads`); snake_case
    /// spellings are accepted too. The whole map is checked before a value is
    /// returned, so a single bad entry rejects the set.
    pub fn from_map(map: &Map<String, Value>) -> MessagingResult<Self> {
        let mut overrides = Self::default();

        for (key, value) in map {
            match key.as_str() {
                "durable" => overrides.durable = Some(expect_bool(key, value)?),
                "autoDelete" | "auto_delete" => {
                    overrides.auto_delete = Some(expect_bool(key, value)?)
                }
                "autoAck" | "auto_ack" => overrides.auto_ack = Some(expect_bool(key, value)?),
                "exclusive" => overrides.exclusive = Some(expect_bool(key, value)?),
                "noWait" | "no_wait" => overrides.no_wait = Some(expect_bool(key, value)?),
                "noLocal" | "no_local" => overrides.no_local = Some(expect_bool(key, value)?),
                "consumer" => overrides.consumer = Some(expect_string(key, value)?),
                "threads" => overrides.threads = Some(expect_count(key, value)?),
                other => {
                    return Err(MessagingError::Config(format!(
                        "unknown option '{}'",
                        other
                    )))
                }
            }
        }

        Ok(overrides)
    }
}

/// Lay `overrides` over `defaults`.
///
/// Keys present in the overrides replace the default; absent keys keep it.
/// The result is validated before it is returned.
pub fn merge(
    defaults: &ConsumeOptions,
    overrides: &ConsumeOverrides,
) -> MessagingResult<ConsumeOptions> {
    let resolved = ConsumeOptions {
        durable: overrides.durable.unwrap_or(defaults.durable),
        auto_delete: overrides.auto_delete.unwrap_or(defaults.auto_delete),
        auto_ack: overrides.auto_ack.unwrap_or(defaults.auto_ack),
        exclusive: overrides.exclusive.unwrap_or(defaults.exclusive),
        no_wait: overrides.no_wait.unwrap_or(defaults.no_wait),
        no_local: overrides.no_local.unwrap_or(defaults.no_local),
        consumer: overrides
            .consumer
            .clone()
            .unwrap_or_else(|| defaults.consumer.clone()),
        threads: overrides.threads.unwrap_or(defaults.threads),
    };

    resolved.validate()?;
    Ok(resolved)
}

/// Type-check an untyped override map and merge it onto `defaults`
pub fn merge_map(
    defaults: &ConsumeOptions,
    overrides: &Map<String, Value>,
) -> MessagingResult<ConsumeOptions> {
    let typed = ConsumeOverrides::from_map(overrides)?;
    merge(defaults, &typed)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(key: &str, expected: &str, value: &Value) -> MessagingError {
    MessagingError::Config(format!(
        "option '{}' expects {}, got {}",
        key,
        expected,
        type_name(value)
    ))
}

fn expect_bool(key: &str, value: &Value) -> MessagingResult<bool> {
    value.as_bool().ok_or_else(|| mismatch(key, "a boolean", value))
}

fn expect_string(key: &str, value: &Value) -> MessagingResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| mismatch(key, "a string", value))
}

fn expect_count(key: &str, value: &Value) -> MessagingResult<usize> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| mismatch(key, "a non-negative integer", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_defaults() {
        let options = ConsumeOptions::default();
        assert!(options.durable);
        assert!(!options.auto_delete);
        assert!(!options.auto_ack);
        assert!(!options.exclusive);
        assert!(!options.no_wait);
        assert!(!options.no_local);
        assert_eq!(options.consumer, "");
        assert_eq!(options.threads, 5);
    }

    #[test]
    fn test_empty_overrides_keep_defaults() {
        let defaults = ConsumeOptions::default();
        let merged = merge(&defaults, &ConsumeOverrides::new()).unwrap();
        assert_eq!(merged, defaults);
        assert!(ConsumeOverrides::new().is_empty());
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let defaults = ConsumeOptions::default();
        let overrides = ConsumeOverrides::new()
            .durable(false)
            .auto_ack(true)
            .consumer("worker-1")
            .threads(1);

        let merged = merge(&defaults, &overrides).unwrap();
        assert!(!merged.durable);
        assert!(merged.auto_ack);
        assert_eq!(merged.consumer, "worker-1");
        assert_eq!(merged.threads, 1);
        // untouched keys keep the default
        assert!(!merged.exclusive);
        assert!(!merged.auto_delete);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let result = merge(&ConsumeOptions::default(), &ConsumeOverrides::new().threads(0));
        assert!(matches!(result, Err(MessagingError::Config(_))));
    }

    #[test]
    fn test_map_with_wire_names() {
        let map = as_map(json!({
            "durable": false,
            "autoDelete": true,
            "autoAck": true,
            "noWait": true,
            "noLocal": true,
            "consumer": "tag",
            "threads": 3
        }));

        let merged = merge_map(&ConsumeOptions::default(), &map).unwrap();
        assert!(!merged.durable);
        assert!(merged.auto_delete);
        assert!(merged.auto_ack);
        assert!(merged.no_wait);
        assert!(merged.no_local);
        assert_eq!(merged.consumer, "tag");
        assert_eq!(merged.threads, 3);
    }

    #[test]
    fn test_map_snake_case_aliases() {
        let map = as_map(json!({ "auto_ack": true, "auto_delete": true }));
        let merged = merge_map(&ConsumeOptions::default(), &map).unwrap();
        assert!(merged.auto_ack);
        assert!(merged.auto_delete);
    }

    #[test]
    fn test_type_mismatch_is_config_error() {
        let cases = vec![
            json!({ "durable": "yes" }),
            json!({ "autoAck": 1 }),
            json!({ "consumer": false }),
            json!({ "threads": "5" }),
            json!({ "threads": -1 }),
            json!({ "threads": 2.5 }),
            json!({ "exclusive": null }),
        ];

        for case in cases {
            let result = merge_map(&ConsumeOptions::default(), &as_map(case.clone()));
            assert!(
                matches!(result, Err(MessagingError::Config(_))),
                "expected config error for {}",
                case
            );
        }
    }

    #[test]
    fn test_mismatch_produces_no_partial_overrides() {
        // valid keys alongside the bad one must not leak into a result
        let map = as_map(json!({ "durable": false, "threads": 2, "autoAck": "true" }));
        assert!(ConsumeOverrides::from_map(&map).is_err());
        assert!(merge_map(&ConsumeOptions::default(), &map).is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let map = as_map(json!({ "prefetch": 10 }));
        let err = merge_map(&ConsumeOptions::default(), &map).unwrap_err();
        assert_eq!(err, MessagingError::Config("unknown option 'prefetch'".to_string()));
    }

    #[test]
    fn test_mismatch_message_names_key_and_types() {
        let map = as_map(json!({ "durable": "no" }));
        let err = merge_map(&ConsumeOptions::default(), &map).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: option 'durable' expects a boolean, got string"
        );
    }

    #[test]
    fn test_merge_onto_custom_defaults() {
        let defaults = ConsumeOptions {
            threads: 2,
            auto_ack: true,
            ..Default::default()
        };
        let merged = merge(&defaults, &ConsumeOverrides::new().auto_ack(false)).unwrap();
        assert_eq!(merged.threads, 2);
        assert!(!merged.auto_ack);
    }
}
