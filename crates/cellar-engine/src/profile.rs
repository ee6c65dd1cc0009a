//! Column profiler: per-column statistics, pattern detection, pairwise
//! correlations, and a table quality score.
//!
//! Statistics come out of the engine in one aggregate sweep per column.
//! Pattern detection samples values and matches them in-process; correlation
//! pairs iterate numeric column pairs and keep |r| above the reporting floor.

use std::sync::OnceLock;

use duckdb::params;
use regex::Regex;
use serde::{Deserialize, Serialize};

use cellar_core::{defaults, quote_ident, Error, Result};

use crate::table_db;
use crate::Engine;

/// Profile depth. `Quality` adds exact distinct counts, correlations, and
/// the quality score; `Basic` stays cheap on wide tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileMode {
    Basic,
    Quality,
}

impl ProfileMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(ProfileMode::Basic),
            "quality" => Ok(ProfileMode::Quality),
            other => Err(Error::InvalidArgument(format!("unknown profile mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericStats {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub stddev: Option<f64>,
    pub skewness: Option<f64>,
    pub kurtosis: Option<f64>,
    pub q01: Option<f64>,
    pub q25: Option<f64>,
    pub q50: Option<f64>,
    pub q75: Option<f64>,
    pub q99: Option<f64>,
    /// IQR outlier fences: q25 − 1.5·IQR and q75 + 1.5·IQR.
    pub outlier_low: Option<f64>,
    pub outlier_high: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringStats {
    pub min_length: Option<i64>,
    pub max_length: Option<i64>,
    pub avg_length: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub count: i64,
    pub null_count: i64,
    pub null_fraction: f64,
    pub distinct: i64,
    pub distinct_is_exact: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric: Option<NumericStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strings: Option<StringStats>,
    /// Detected value patterns: email, uuid, url, phone, ipv4, date-iso.
    pub patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outlier_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationPair {
    pub column_a: String,
    pub column_b: String,
    pub r: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProfile {
    pub table: String,
    pub row_count: i64,
    pub columns: Vec<ColumnProfile>,
    pub correlations: Vec<CorrelationPair>,
    pub quality_score: i64,
    pub quality_label: String,
}

/// Quality label buckets.
pub fn quality_label(score: i64) -> &'static str {
    if score >= 90 {
        "Excellent"
    } else if score >= 75 {
        "Good"
    } else if score >= 50 {
        "Fair"
    } else {
        "Poor"
    }
}

struct PatternDef {
    name: &'static str,
    regex: &'static str,
}

const PATTERNS: &[PatternDef] = &[
    PatternDef { name: "email", regex: r"^[^@\s]+@[^@\s]+\.[^@\s]+$" },
    PatternDef {
        name: "uuid",
        regex: r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
    },
    PatternDef { name: "url", regex: r"^https?://[^\s]+$" },
    PatternDef { name: "phone", regex: r"^\+?[0-9][0-9 ().-]{6,}$" },
    PatternDef {
        name: "ipv4",
        regex: r"^(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)(\.(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)){3}$",
    },
    PatternDef { name: "date-iso", regex: r"^\d{4}-\d{2}-\d{2}([T ].*)?$" },
];

fn compiled_patterns() -> &'static Vec<(&'static str, Regex)> {
    static COMPILED: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PATTERNS
            .iter()
            .map(|p| (p.name, Regex::new(p.regex).expect("static regex")))
            .collect()
    })
}

/// Patterns matched by ≥ 90% of sampled values.
pub fn detect_patterns(samples: &[String]) -> Vec<String> {
    if samples.is_empty() {
        return Vec::new();
    }
    let threshold = (samples.len() as f64 * 0.9).ceil() as usize;
    compiled_patterns()
        .iter()
        .filter(|(_, regex)| samples.iter().filter(|s| regex.is_match(s)).count() >= threshold)
        .map(|(name, _)| name.to_string())
        .collect()
}

impl Engine {
    pub async fn profile_table(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        columns: Option<Vec<String>>,
        mode: ProfileMode,
    ) -> Result<TableProfile> {
        let resolved = self.resolve_read(project, branch, bucket, table).await?;
        let conn = table_db::open_ro(&resolved.path)?;
        let (schema, _) = table_db::read_schema(&conn, table)?;

        let selected: Vec<_> = match &columns {
            Some(wanted) => {
                for name in wanted {
                    if !schema.iter().any(|c| &c.name == name) {
                        return Err(Error::NotFound(format!("column {name}")));
                    }
                }
                schema.iter().filter(|c| wanted.contains(&c.name)).collect()
            }
            None => schema.iter().collect(),
        };

        let row_count = table_db::row_count(&conn, table)?;
        let quoted_table = quote_ident(table);

        let mut profiles = Vec::with_capacity(selected.len());
        for col in &selected {
            let q = quote_ident(&col.name);
            let numeric = table_db::is_numeric_type(&col.type_name);

            let non_null: i64 = conn.query_row(
                &format!("SELECT count({q}) FROM {quoted_table}"),
                params![],
                |row| row.get(0),
            )?;
            let distinct_expr = if mode == ProfileMode::Quality {
                format!("count(DISTINCT {q})")
            } else {
                format!("approx_count_distinct({q})")
            };
            let distinct: i64 = conn.query_row(
                &format!("SELECT CAST({distinct_expr} AS BIGINT) FROM {quoted_table}"),
                params![],
                |row| row.get(0),
            )?;

            let null_count = row_count - non_null;
            let null_fraction = if row_count > 0 {
                null_count as f64 / row_count as f64
            } else {
                0.0
            };

            let (numeric_stats, outlier_count) = if numeric {
                let stats = self.numeric_sweep(&conn, &quoted_table, &q)?;
                let outliers = match (stats.outlier_low, stats.outlier_high) {
                    (Some(low), Some(high)) => Some(conn.query_row(
                        &format!(
                            "SELECT count(*) FROM {quoted_table} \
                             WHERE {q} < {low} OR {q} > {high}"
                        ),
                        params![],
                        |row| row.get::<_, i64>(0),
                    )?),
                    _ => None,
                };
                (Some(stats), outliers)
            } else {
                (None, None)
            };

            let strings = if !numeric && col.type_name.eq_ignore_ascii_case("VARCHAR") {
                Some(conn.query_row(
                    &format!(
                        "SELECT CAST(min(length({q})) AS BIGINT), \
                         CAST(max(length({q})) AS BIGINT), \
                         CAST(avg(length({q})) AS DOUBLE) FROM {quoted_table}"
                    ),
                    params![],
                    |row| {
                        Ok(StringStats {
                            min_length: row.get(0)?,
                            max_length: row.get(1)?,
                            avg_length: row.get(2)?,
                        })
                    },
                )?)
            } else {
                None
            };

            let patterns = if !numeric {
                let mut stmt = conn.prepare(&format!(
                    "SELECT CAST({q} AS VARCHAR) FROM {quoted_table} \
                     WHERE {q} IS NOT NULL LIMIT {}",
                    defaults::PROFILE_PATTERN_SAMPLE
                ))?;
                let rows = stmt.query_map(params![], |row| row.get::<_, String>(0))?;
                let mut samples = Vec::new();
                for row in rows {
                    samples.push(row?);
                }
                detect_patterns(&samples)
            } else {
                Vec::new()
            };

            profiles.push(ColumnProfile {
                name: col.name.clone(),
                type_name: col.type_name.clone(),
                count: non_null,
                null_count,
                null_fraction,
                distinct,
                distinct_is_exact: mode == ProfileMode::Quality,
                numeric: numeric_stats,
                strings,
                patterns,
                outlier_count,
            });
        }

        let correlations = if mode == ProfileMode::Quality {
            self.correlation_pairs(&conn, &quoted_table, &selected)?
        } else {
            Vec::new()
        };

        // Quality scoring: −5 per mostly-null column, −2 per outlier-heavy one.
        let mut score: i64 = 100;
        for profile in &profiles {
            if profile.null_fraction > 0.5 {
                score -= 5;
            }
            if let Some(outliers) = profile.outlier_count {
                if row_count > 0 && outliers as f64 / row_count as f64 > 0.05 {
                    score -= 2;
                }
            }
        }
        let score = score.max(0);

        Ok(TableProfile {
            table: table.to_string(),
            row_count,
            columns: profiles,
            correlations,
            quality_score: score,
            quality_label: quality_label(score).to_string(),
        })
    }

    fn numeric_sweep(
        &self,
        conn: &duckdb::Connection,
        quoted_table: &str,
        q: &str,
    ) -> Result<NumericStats> {
        let mut stats = conn.query_row(
            &format!(
                "SELECT CAST(min({q}) AS DOUBLE), CAST(max({q}) AS DOUBLE), \
                 CAST(avg({q}) AS DOUBLE), CAST(stddev_samp({q}) AS DOUBLE), \
                 CAST(skewness({q}) AS DOUBLE), CAST(kurtosis({q}) AS DOUBLE), \
                 CAST(quantile_cont({q}, 0.01) AS DOUBLE), \
                 CAST(quantile_cont({q}, 0.25) AS DOUBLE), \
                 CAST(quantile_cont({q}, 0.50) AS DOUBLE), \
                 CAST(quantile_cont({q}, 0.75) AS DOUBLE), \
                 CAST(quantile_cont({q}, 0.99) AS DOUBLE) \
                 FROM {quoted_table}"
            ),
            params![],
            |row| {
                Ok(NumericStats {
                    min: row.get(0)?,
                    max: row.get(1)?,
                    avg: row.get(2)?,
                    stddev: row.get(3)?,
                    skewness: row.get(4)?,
                    kurtosis: row.get(5)?,
                    q01: row.get(6)?,
                    q25: row.get(7)?,
                    q50: row.get(8)?,
                    q75: row.get(9)?,
                    q99: row.get(10)?,
                    outlier_low: None,
                    outlier_high: None,
                })
            },
        )?;
        if let (Some(q25), Some(q75)) = (stats.q25, stats.q75) {
            let iqr = q75 - q25;
            stats.outlier_low = Some(q25 - 1.5 * iqr);
            stats.outlier_high = Some(q75 + 1.5 * iqr);
        }
        Ok(stats)
    }

    /// Pearson correlations among numeric columns, |r| > 0.3, top 20 by |r|.
    fn correlation_pairs(
        &self,
        conn: &duckdb::Connection,
        quoted_table: &str,
        columns: &[&cellar_core::ColumnDef],
    ) -> Result<Vec<CorrelationPair>> {
        let numeric: Vec<_> = columns
            .iter()
            .filter(|c| table_db::is_numeric_type(&c.type_name))
            .collect();
        let mut pairs = Vec::new();
        for (i, a) in numeric.iter().enumerate() {
            for b in numeric.iter().skip(i + 1) {
                let r: Option<f64> = conn.query_row(
                    &format!(
                        "SELECT CAST(corr({}, {}) AS DOUBLE) FROM {quoted_table}",
                        quote_ident(&a.name),
                        quote_ident(&b.name)
                    ),
                    params![],
                    |row| row.get(0),
                )?;
                if let Some(r) = r {
                    if r.abs() > defaults::CORRELATION_MIN_ABS {
                        pairs.push(CorrelationPair {
                            column_a: a.name.clone(),
                            column_b: b.name.clone(),
                            r,
                        });
                    }
                }
            }
        }
        pairs.sort_by(|x, y| y.r.abs().partial_cmp(&x.r.abs()).unwrap_or(std::cmp::Ordering::Equal));
        pairs.truncate(defaults::CORRELATION_TOP_N);
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_labels() {
        assert_eq!(quality_label(100), "Excellent");
        assert_eq!(quality_label(90), "Excellent");
        assert_eq!(quality_label(80), "Good");
        assert_eq!(quality_label(60), "Fair");
        assert_eq!(quality_label(10), "Poor");
    }

    #[test]
    fn test_pattern_detection_thresholds() {
        let emails: Vec<String> = (0..10).map(|i| format!("user{i}@example.com")).collect();
        assert_eq!(detect_patterns(&emails), vec!["email"]);

        // One outlier in ten still clears the 90% bar.
        let mut mostly = emails.clone();
        mostly[9] = "not-an-email".to_string();
        assert_eq!(detect_patterns(&mostly), vec!["email"]);

        let mut diluted = emails;
        diluted[8] = "also-not".to_string();
        diluted[9] = "nope".to_string();
        assert!(detect_patterns(&diluted).is_empty());
    }

    #[test]
    fn test_pattern_kinds() {
        let uuids = vec!["0194f7e8-8b2a-7c3d-9e4f-5a6b7c8d9e0f".to_string()];
        assert_eq!(detect_patterns(&uuids), vec!["uuid"]);

        let ips = vec!["10.0.0.1".to_string(), "192.168.1.254".to_string()];
        assert_eq!(detect_patterns(&ips), vec!["ipv4"]);

        let dates = vec!["2026-01-31".to_string(), "2026-02-01T10:00:00".to_string()];
        assert_eq!(detect_patterns(&dates), vec!["date-iso"]);

        assert!(detect_patterns(&["hello".to_string()]).is_empty());
    }
}
