//! Hierarchical snapshot-settings resolution.
//!
//! Settings are stored as `(scope, scope_key, setting, value)` rows and
//! resolved by walking scopes from most to least specific:
//! table → bucket → project → system. The first value found wins per setting.
//! Resolution is a pure function over the row list so it can be tested
//! without a registry.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Scope level of one settings row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingScope {
    System,
    Project,
    Bucket,
    Table,
}

impl SettingScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingScope::System => "system",
            SettingScope::Project => "project",
            SettingScope::Bucket => "bucket",
            SettingScope::Table => "table",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(SettingScope::System),
            "project" => Some(SettingScope::Project),
            "bucket" => Some(SettingScope::Bucket),
            "table" => Some(SettingScope::Table),
            _ => None,
        }
    }
}

/// One raw settings row as read from the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingRow {
    pub scope: SettingScope,
    /// Identifies the scoped entity: `""` for system, `<project>` for project,
    /// `<project>/<bucket>` for bucket, `<project>/<bucket>/<table>` for table.
    pub scope_key: String,
    pub setting: String,
    pub value: serde_json::Value,
}

/// The ordered scope keys for one concrete table, most specific first.
#[derive(Debug, Clone)]
pub struct ScopeChain {
    chain: Vec<(SettingScope, String)>,
}

impl ScopeChain {
    pub fn for_table(project: &str, bucket: &str, table: &str) -> Self {
        Self {
            chain: vec![
                (SettingScope::Table, format!("{project}/{bucket}/{table}")),
                (SettingScope::Bucket, format!("{project}/{bucket}")),
                (SettingScope::Project, project.to_string()),
                (SettingScope::System, String::new()),
            ],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(SettingScope, String)> {
        self.chain.iter()
    }
}

/// Resolve one setting along a scope chain. First match wins.
pub fn resolve_setting<'a>(
    rows: &'a [SettingRow],
    chain: &ScopeChain,
    setting: &str,
) -> Option<&'a serde_json::Value> {
    for (scope, key) in chain.iter() {
        if let Some(row) = rows
            .iter()
            .find(|r| r.scope == *scope && r.scope_key == *key && r.setting == setting)
        {
            return Some(&row.value);
        }
    }
    None
}

/// Effective snapshot configuration for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotConfig {
    pub auto_triggers: HashSet<String>,
    pub manual_retention_days: i64,
    pub auto_retention_days: i64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            auto_triggers: defaults::DEFAULT_AUTO_TRIGGERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            manual_retention_days: defaults::MANUAL_RETENTION_DAYS,
            auto_retention_days: defaults::AUTO_RETENTION_DAYS,
        }
    }
}

impl SnapshotConfig {
    /// Resolve the three recognised settings along the chain, falling back to
    /// the system defaults for any setting with no row at any scope.
    pub fn resolve(rows: &[SettingRow], chain: &ScopeChain) -> Self {
        let mut config = Self::default();

        if let Some(v) = resolve_setting(rows, chain, "auto_snapshot_triggers") {
            if let Some(arr) = v.as_array() {
                config.auto_triggers = arr
                    .iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect();
            }
        }
        if let Some(days) = resolve_setting(rows, chain, "manual_retention_days")
            .and_then(serde_json::Value::as_i64)
        {
            config.manual_retention_days = days;
        }
        if let Some(days) =
            resolve_setting(rows, chain, "auto_retention_days").and_then(serde_json::Value::as_i64)
        {
            config.auto_retention_days = days;
        }
        config
    }

    /// Whether a named trigger should fire an auto snapshot.
    pub fn trigger_enabled(&self, trigger: &str) -> bool {
        self.auto_triggers.contains(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(scope: SettingScope, key: &str, setting: &str, value: serde_json::Value) -> SettingRow {
        SettingRow {
            scope,
            scope_key: key.to_string(),
            setting: setting.to_string(),
            value,
        }
    }

    #[test]
    fn test_most_specific_scope_wins() {
        let rows = vec![
            row(SettingScope::System, "", "auto_retention_days", json!(7)),
            row(SettingScope::Project, "p1", "auto_retention_days", json!(14)),
            row(
                SettingScope::Table,
                "p1/in_c_s/orders",
                "auto_retention_days",
                json!(3),
            ),
        ];
        let chain = ScopeChain::for_table("p1", "in_c_s", "orders");
        let config = SnapshotConfig::resolve(&rows, &chain);
        assert_eq!(config.auto_retention_days, 3);
    }

    #[test]
    fn test_falls_through_to_project_scope() {
        let rows = vec![row(
            SettingScope::Project,
            "p1",
            "auto_snapshot_triggers",
            json!(["truncate", "drop_table"]),
        )];
        let chain = ScopeChain::for_table("p1", "in_c_s", "orders");
        let config = SnapshotConfig::resolve(&rows, &chain);
        assert!(config.trigger_enabled("truncate"));
        assert!(config.trigger_enabled("drop_table"));
        assert!(!config.trigger_enabled("drop_column"));
    }

    #[test]
    fn test_defaults_when_no_rows() {
        let chain = ScopeChain::for_table("p1", "in_c_s", "orders");
        let config = SnapshotConfig::resolve(&[], &chain);
        assert_eq!(config.manual_retention_days, 90);
        assert_eq!(config.auto_retention_days, 7);
        assert!(config.trigger_enabled("drop_table"));
        assert!(!config.trigger_enabled("truncate"));
    }

    #[test]
    fn test_other_table_scope_does_not_leak() {
        let rows = vec![row(
            SettingScope::Table,
            "p1/in_c_s/other",
            "auto_retention_days",
            json!(1),
        )];
        let chain = ScopeChain::for_table("p1", "in_c_s", "orders");
        let config = SnapshotConfig::resolve(&rows, &chain);
        assert_eq!(config.auto_retention_days, 7);
    }
}
