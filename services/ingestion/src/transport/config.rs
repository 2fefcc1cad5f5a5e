use std::{path::PathBuf, str::FromStr, time::Duration};

use schema::DEFAULT_PROMOTION_MAX_ROWS;
use store::CheckpointPolicy;

const DEFAULT_PORT: u16 = 8020;
const MAX_HTTP_WORKERS: usize = 32;

/// Service settings read from `PUNCHHUB_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub http_workers: usize,
    pub wal_path: Option<PathBuf>,
    pub wal_sync_every_records: usize,
    pub checkpoint_policy: CheckpointPolicy,
    pub api_keys: Option<String>,
    pub promotion_interval: Option<Duration>,
    pub promotion_max_rows: usize,
    pub log_json: bool,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = env_first(&lookup, &["PUNCHHUB_BIND"])
            .or_else(|| {
                parse_env_first::<u16>(&lookup, &["PORT"]).map(|port| format!("0.0.0.0:{port}"))
            })
            .unwrap_or_else(|| format!("0.0.0.0:{DEFAULT_PORT}"));
        let http_workers = parse_env_first::<usize>(&lookup, &["PUNCHHUB_HTTP_WORKERS"])
            .filter(|value| *value > 0)
            .unwrap_or_else(default_http_workers)
            .clamp(1, MAX_HTTP_WORKERS);
        Self {
            bind_addr,
            http_workers,
            wal_path: env_first(&lookup, &["PUNCHHUB_WAL_PATH"]).map(PathBuf::from),
            wal_sync_every_records: parse_env_first::<usize>(
                &lookup,
                &["PUNCHHUB_WAL_SYNC_EVERY_RECORDS"],
            )
            .filter(|value| *value > 0)
            .unwrap_or(1),
            checkpoint_policy: CheckpointPolicy {
                max_wal_records: parse_env_first(&lookup, &["PUNCHHUB_CHECKPOINT_MAX_WAL_RECORDS"]),
                max_wal_bytes: parse_env_first(&lookup, &["PUNCHHUB_CHECKPOINT_MAX_WAL_BYTES"]),
            },
            api_keys: env_first(&lookup, &["PUNCHHUB_API_KEYS"]),
            promotion_interval: parse_env_first::<u64>(&lookup, &["PUNCHHUB_PROMOTION_INTERVAL_MS"])
                .filter(|value| *value > 0)
                .map(Duration::from_millis),
            promotion_max_rows: parse_env_first::<usize>(&lookup, &["PUNCHHUB_PROMOTION_MAX_ROWS"])
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_PROMOTION_MAX_ROWS),
            log_json: env_first(&lookup, &["PUNCHHUB_LOG_JSON"])
                .is_some_and(|value| parse_bool(&value)),
        }
    }
}

fn env_first(lookup: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| lookup(*key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn parse_env_first<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    keys: &[&str],
) -> Option<T> {
    for key in keys {
        if let Some(value) = lookup(*key)
            && let Ok(parsed) = value.trim().parse::<T>()
        {
            return Some(parsed);
        }
    }
    None
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_http_workers() -> usize {
    std::thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> ServiceConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config_from(&[]);
        assert_eq!(config.bind_addr, "0.0.0.0:8020");
        assert!((1..=MAX_HTTP_WORKERS).contains(&config.http_workers));
        assert_eq!(config.wal_path, None);
        assert_eq!(config.wal_sync_every_records, 1);
        assert_eq!(config.checkpoint_policy, CheckpointPolicy::default());
        assert_eq!(config.promotion_interval, None);
        assert_eq!(config.promotion_max_rows, 200);
        assert!(!config.log_json);
    }

    #[test]
    fn bind_prefers_explicit_address_over_port() {
        assert_eq!(config_from(&[("PORT", "9100")]).bind_addr, "0.0.0.0:9100");
        assert_eq!(
            config_from(&[("PORT", "9100"), ("PUNCHHUB_BIND", "127.0.0.1:7000")]).bind_addr,
            "127.0.0.1:7000"
        );
        assert_eq!(config_from(&[("PORT", "not-a-port")]).bind_addr, "0.0.0.0:8020");
    }

    #[test]
    fn numeric_settings_ignore_zero_and_garbage() {
        let config = config_from(&[
            ("PUNCHHUB_HTTP_WORKERS", "500"),
            ("PUNCHHUB_WAL_SYNC_EVERY_RECORDS", "0"),
            ("PUNCHHUB_PROMOTION_INTERVAL_MS", "0"),
            ("PUNCHHUB_PROMOTION_MAX_ROWS", "abc"),
            ("PUNCHHUB_CHECKPOINT_MAX_WAL_RECORDS", "1000"),
            ("PUNCHHUB_LOG_JSON", "TRUE"),
        ]);
        assert_eq!(config.http_workers, MAX_HTTP_WORKERS);
        assert_eq!(config.wal_sync_every_records, 1);
        assert_eq!(config.promotion_interval, None);
        assert_eq!(config.promotion_max_rows, 200);
        assert_eq!(config.checkpoint_policy.max_wal_records, Some(1000));
        assert!(config.log_json);
    }

    #[test]
    fn promotion_worker_interval_is_parsed_in_millis() {
        let config = config_from(&[
            ("PUNCHHUB_PROMOTION_INTERVAL_MS", "1500"),
            ("PUNCHHUB_PROMOTION_MAX_ROWS", "50"),
        ]);
        assert_eq!(config.promotion_interval, Some(Duration::from_millis(1500)));
        assert_eq!(config.promotion_max_rows, 50);
    }
}
