//! Per-domain realtime configuration.
//!
//! A [`RealtimeDomainConfig`] says which tables of which schema a business
//! domain listens to, which query keys to invalidate when they change, and how
//! long to wait for quiet before doing so. Configs are immutable once built.

use std::collections::BTreeSet;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use stockroom_core::DomainError;

use crate::feed::ChangeEvent;

/// Subscription identifier. One live feed channel exists per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hierarchical query cache key, e.g. `["inventory", "items", "<id>"]`.
///
/// Keys in a domain config are prefixes: `["inventory"]` matches every query
/// whose key starts with `"inventory"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether `prefix` is a (non-strict) prefix of this key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

impl core::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Kind of row change carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];
}

pub const DEFAULT_SCHEMA: &str = "public";

/// Realtime settings for one business domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDomainConfig", into = "RawDomainConfig")]
pub struct RealtimeDomainConfig {
    channel_key: ChannelKey,
    schema: String,
    tables: BTreeSet<String>,
    query_keys: Vec<QueryKey>,
    debounce: Duration,
    events: BTreeSet<ChangeKind>,
}

impl RealtimeDomainConfig {
    pub fn builder(channel_key: impl Into<String>) -> RealtimeDomainConfigBuilder {
        RealtimeDomainConfigBuilder {
            channel_key: ChannelKey::new(channel_key),
            schema: DEFAULT_SCHEMA.to_string(),
            tables: BTreeSet::new(),
            query_keys: Vec::new(),
            debounce: Duration::zero(),
            events: BTreeSet::new(),
        }
    }

    pub fn channel_key(&self) -> &ChannelKey {
        &self.channel_key
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    pub fn query_keys(&self) -> &[QueryKey] {
        &self.query_keys
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn events(&self) -> &BTreeSet<ChangeKind> {
        &self.events
    }

    /// Whether `event` should count as a notification for this domain.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.schema == self.schema
            && self.tables.contains(&event.table)
            && self.events.contains(&event.kind)
    }
}

/// Builder for [`RealtimeDomainConfig`].
#[derive(Debug, Clone)]
pub struct RealtimeDomainConfigBuilder {
    channel_key: ChannelKey,
    schema: String,
    tables: BTreeSet<String>,
    query_keys: Vec<QueryKey>,
    debounce: Duration,
    events: BTreeSet<ChangeKind>,
}

impl RealtimeDomainConfigBuilder {
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.tables.insert(table.into());
        self
    }

    pub fn query_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.query_keys.push(key.into());
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn debounce_ms(self, ms: i64) -> Self {
        self.debounce(Duration::milliseconds(ms))
    }

    /// Restrict to the given change kind. Without any call, all kinds count.
    pub fn event(mut self, kind: ChangeKind) -> Self {
        self.events.insert(kind);
        self
    }

    pub fn build(self) -> Result<RealtimeDomainConfig, DomainError> {
        if self.channel_key.as_str().trim().is_empty() {
            return Err(DomainError::validation("channel key must not be empty"));
        }
        if self.schema.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "channel '{}': schema must not be empty",
                self.channel_key
            )));
        }
        if self.tables.is_empty() {
            return Err(DomainError::validation(format!(
                "channel '{}': at least one table is required",
                self.channel_key
            )));
        }
        if self.query_keys.is_empty() {
            return Err(DomainError::validation(format!(
                "channel '{}': at least one query key is required",
                self.channel_key
            )));
        }
        if self.query_keys.iter().any(|k| k.segments().is_empty()) {
            return Err(DomainError::validation(format!(
                "channel '{}': query keys must not be empty",
                self.channel_key
            )));
        }
        if self.debounce < Duration::zero() {
            return Err(DomainError::validation(format!(
                "channel '{}': debounce must not be negative",
                self.channel_key
            )));
        }

        let events = if self.events.is_empty() {
            ChangeKind::ALL.into_iter().collect()
        } else {
            self.events
        };

        Ok(RealtimeDomainConfig {
            channel_key: self.channel_key,
            schema: self.schema,
            tables: self.tables,
            query_keys: self.query_keys,
            debounce: self.debounce,
            events,
        })
    }
}

/// Serialized form (`debounce_ms` instead of a duration).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDomainConfig {
    channel_key: String,
    #[serde(default = "default_schema")]
    schema: String,
    tables: Vec<String>,
    query_keys: Vec<QueryKey>,
    #[serde(default)]
    debounce_ms: u64,
    #[serde(default)]
    events: Vec<ChangeKind>,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl TryFrom<RawDomainConfig> for RealtimeDomainConfig {
    type Error = DomainError;

    fn try_from(raw: RawDomainConfig) -> Result<Self, Self::Error> {
        let debounce_ms = i64::try_from(raw.debounce_ms)
            .map_err(|_| DomainError::validation("debounce_ms out of range"))?;
        let mut builder = RealtimeDomainConfig::builder(raw.channel_key)
            .schema(raw.schema)
            .debounce(
                Duration::try_milliseconds(debounce_ms)
                    .ok_or_else(|| DomainError::validation("debounce_ms out of range"))?,
            );
        for table in raw.tables {
            builder = builder.table(table);
        }
        for key in raw.query_keys {
            builder = builder.query_key(key);
        }
        for kind in raw.events {
            builder = builder.event(kind);
        }
        builder.build()
    }
}

impl From<RealtimeDomainConfig> for RawDomainConfig {
    fn from(config: RealtimeDomainConfig) -> Self {
        Self {
            channel_key: config.channel_key.0,
            schema: config.schema,
            tables: config.tables.into_iter().collect(),
            query_keys: config.query_keys,
            debounce_ms: config.debounce.num_milliseconds().max(0) as u64,
            events: config.events.into_iter().collect(),
        }
    }
}

/// Parse a JSON array of domain configs.
pub fn parse_domains(json: &str) -> Result<Vec<RealtimeDomainConfig>, DomainError> {
    let domains: Vec<RealtimeDomainConfig> = serde_json::from_str(json)
        .map_err(|e| DomainError::validation(format!("invalid realtime domain config: {e}")))?;

    let mut seen = BTreeSet::new();
    for domain in &domains {
        if !seen.insert(domain.channel_key.clone()) {
            return Err(DomainError::validation(format!(
                "duplicate channel key '{}'",
                domain.channel_key
            )));
        }
    }
    Ok(domains)
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in domains
// ─────────────────────────────────────────────────────────────────────────────

fn preset_config(
    domain: &str,
    tables: &[&str],
    query_keys: &[&[&str]],
    debounce_ms: i64,
) -> RealtimeDomainConfig {
    RealtimeDomainConfig {
        channel_key: ChannelKey::new(format!("realtime:{domain}")),
        schema: DEFAULT_SCHEMA.to_string(),
        tables: tables.iter().map(|t| t.to_string()).collect(),
        query_keys: query_keys.iter().map(|k| QueryKey::new(k.iter().copied())).collect(),
        debounce: Duration::milliseconds(debounce_ms),
        events: ChangeKind::ALL.into_iter().collect(),
    }
}

/// Names of the built-in domains, in [`presets`] order.
pub const PRESET_DOMAINS: [&str; 7] = [
    "inventory",
    "orders",
    "purchasing",
    "pos",
    "delivery_notes",
    "commissions",
    "notifications",
];

/// Built-in config for a named business domain.
pub fn preset(domain: &str) -> Option<RealtimeDomainConfig> {
    let config = match domain {
        "inventory" => preset_config(
            "inventory",
            &["stock_items", "stock_movements", "stock_requests", "warehouses"],
            &[&["inventory"], &["stock-requests"]],
            500,
        ),
        "orders" => preset_config(
            "orders",
            &["sales_orders", "sales_order_items"],
            &[&["orders"]],
            300,
        ),
        "purchasing" => preset_config(
            "purchasing",
            &["purchase_orders", "purchase_order_items", "suppliers"],
            &[&["purchase-orders"], &["suppliers"]],
            500,
        ),
        "pos" => preset_config(
            "pos",
            &["pos_transactions", "pos_sessions"],
            &[&["pos"]],
            250,
        ),
        "delivery_notes" => preset_config(
            "delivery_notes",
            &["delivery_notes", "delivery_note_items"],
            &[&["delivery-notes"]],
            500,
        ),
        "commissions" => preset_config(
            "commissions",
            &["commission_records", "commission_rules"],
            &[&["commissions"]],
            1000,
        ),
        "notifications" => preset_config(
            "notifications",
            &["notifications"],
            &[&["notifications"]],
            100,
        ),
        _ => return None,
    };
    Some(config)
}

/// All built-in domain configs.
pub fn presets() -> Vec<RealtimeDomainConfig> {
    PRESET_DOMAINS.iter().filter_map(|d| preset(d)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(table: &str, kind: ChangeKind) -> ChangeEvent {
        ChangeEvent::new(DEFAULT_SCHEMA, table, kind)
    }

    #[test]
    fn builder_defaults_to_public_schema_and_all_kinds() {
        let config = RealtimeDomainConfig::builder("realtime:stock")
            .table("stock_items")
            .query_key(["inventory"])
            .debounce_ms(200)
            .build()
            .unwrap();

        assert_eq!(config.schema(), "public");
        assert_eq!(config.events().len(), 3);
        assert_eq!(config.debounce(), Duration::milliseconds(200));
        assert!(config.matches(&event("stock_items", ChangeKind::Delete)));
        assert!(!config.matches(&event("sales_orders", ChangeKind::Insert)));
    }

    #[test]
    fn event_filter_restricts_kinds() {
        let config = RealtimeDomainConfig::builder("realtime:new-orders")
            .table("sales_orders")
            .query_key(["orders"])
            .event(ChangeKind::Insert)
            .build()
            .unwrap();

        assert!(config.matches(&event("sales_orders", ChangeKind::Insert)));
        assert!(!config.matches(&event("sales_orders", ChangeKind::Update)));
    }

    #[test]
    fn schema_must_match() {
        let config = RealtimeDomainConfig::builder("realtime:audit")
            .schema("audit")
            .table("entries")
            .query_key(["audit"])
            .build()
            .unwrap();

        assert!(!config.matches(&event("entries", ChangeKind::Insert)));
        assert!(config.matches(&ChangeEvent::new("audit", "entries", ChangeKind::Insert)));
    }

    #[test]
    fn build_rejects_incomplete_configs() {
        assert!(RealtimeDomainConfig::builder("k").query_key(["a"]).build().is_err());
        assert!(RealtimeDomainConfig::builder("k").table("t").build().is_err());
        assert!(RealtimeDomainConfig::builder(" ").table("t").query_key(["a"]).build().is_err());
        assert!(
            RealtimeDomainConfig::builder("k")
                .table("t")
                .query_key(["a"])
                .debounce_ms(-1)
                .build()
                .is_err()
        );
    }

    #[test]
    fn query_key_prefix_matching() {
        let key = QueryKey::from(["inventory", "items", "42"]);
        assert!(key.starts_with(&QueryKey::from(["inventory"])));
        assert!(key.starts_with(&key.clone()));
        assert!(!key.starts_with(&QueryKey::from(["inventory", "warehouses"])));
        assert!(!QueryKey::from(["inventory"]).starts_with(&key));
    }

    #[test]
    fn parses_json_domains() {
        let json = r#"[
            {
                "channel_key": "realtime:stock",
                "tables": ["stock_items"],
                "query_keys": [["inventory"], ["stock-requests", "open"]],
                "debounce_ms": 750
            },
            {
                "channel_key": "realtime:pos",
                "schema": "pos",
                "tables": ["transactions"],
                "query_keys": [["pos"]],
                "events": ["INSERT"]
            }
        ]"#;

        let domains = parse_domains(json).unwrap();
        assert_eq!(domains.len(), 2);
        assert_eq!(domains[0].debounce(), Duration::milliseconds(750));
        assert_eq!(domains[0].query_keys()[1], QueryKey::from(["stock-requests", "open"]));
        assert_eq!(domains[1].schema(), "pos");
        assert_eq!(domains[1].debounce(), Duration::zero());
        assert_eq!(domains[1].events().iter().copied().collect::<Vec<_>>(), vec![ChangeKind::Insert]);
    }

    #[test]
    fn parse_rejects_duplicate_channel_keys_and_invalid_entries() {
        let dup = r#"[
            {"channel_key": "a", "tables": ["t"], "query_keys": [["q"]]},
            {"channel_key": "a", "tables": ["u"], "query_keys": [["r"]]}
        ]"#;
        assert!(parse_domains(dup).is_err());

        let no_tables = r#"[{"channel_key": "a", "tables": [], "query_keys": [["q"]]}]"#;
        assert!(parse_domains(no_tables).is_err());
    }

    #[test]
    fn serialize_round_trips_through_raw_form() {
        let config = preset("inventory").unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["debounce_ms"], 500);
        let back: RealtimeDomainConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn every_preset_is_valid_and_unique() {
        let all = presets();
        assert_eq!(all.len(), PRESET_DOMAINS.len());

        let keys: BTreeSet<_> = all.iter().map(|c| c.channel_key().clone()).collect();
        assert_eq!(keys.len(), all.len());

        for config in &all {
            assert!(!config.tables().is_empty());
            assert!(!config.query_keys().is_empty());
            assert!(config.debounce() > Duration::zero());
        }
        assert!(preset("payroll").is_none());
    }
}
