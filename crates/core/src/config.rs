use std::time::Duration;

use tracing::warn;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

pub const DEFAULT_BATCH_SIZE: u32 = 100;
pub const DEFAULT_MAX_RECORDS: usize = 20_000;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_PAGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MapperConfig {
    pub batch_size: u32,
    /// Safety ceiling on the records accumulated by a single run.
    pub max_records: usize,
    /// Snapshots older than this are refetched on session start.
    pub max_age: Duration,
    pub page_timeout: Duration,
    pub api_base: String,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_records: DEFAULT_MAX_RECORDS,
            max_age: DEFAULT_MAX_AGE,
            page_timeout: DEFAULT_PAGE_TIMEOUT,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl MapperConfig {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = parse_var(&lookup, "SHARESCOPE_BATCH_SIZE") {
            cfg.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "SHARESCOPE_MAX_RECORDS") {
            cfg.max_records = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "SHARESCOPE_MAX_AGE_SECS") {
            cfg.max_age = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "SHARESCOPE_PAGE_TIMEOUT_SECS") {
            cfg.page_timeout = Duration::from_secs(v);
        }
        if let Some(v) = lookup("SHARESCOPE_API_BASE").filter(|v| !v.trim().is_empty()) {
            cfg.api_base = v.trim().trim_end_matches('/').to_string();
        }
        cfg
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => Some(v),
        _ => {
            warn!(key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}

/// Which pieces of the external session are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigStatus {
    pub has_token: bool,
    pub has_account: bool,
}

impl ConfigStatus {
    pub fn configured(&self) -> bool {
        self.has_token && self.has_account
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_source_limits() {
        let cfg = MapperConfig::default();
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.max_records, 20_000);
        assert_eq!(cfg.max_age, Duration::from_secs(86_400));
    }

    #[test]
    fn env_overrides_are_applied() {
        let cfg = MapperConfig::from_lookup(lookup(&[
            ("SHARESCOPE_BATCH_SIZE", "50"),
            ("SHARESCOPE_MAX_RECORDS", "500"),
            ("SHARESCOPE_PAGE_TIMEOUT_SECS", "5"),
            ("SHARESCOPE_API_BASE", "http://localhost:9000/drive/"),
        ]));
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.max_records, 500);
        assert_eq!(cfg.page_timeout, Duration::from_secs(5));
        assert_eq!(cfg.api_base, "http://localhost:9000/drive");
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let cfg = MapperConfig::from_lookup(lookup(&[
            ("SHARESCOPE_BATCH_SIZE", "lots"),
            ("SHARESCOPE_MAX_RECORDS", "0"),
        ]));
        assert_eq!(cfg.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.max_records, DEFAULT_MAX_RECORDS);
    }
}
