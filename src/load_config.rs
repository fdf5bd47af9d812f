use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mochi_sync_core::config::{normalize_dir, DeckConfig, SynchroniseConfig};
use mochi_sync_core::convert::ParserKind;
use mochi_sync_core::executor::MAX_WORKERS;
use mochi_sync_core::ratelimit::RateLimit;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::client::MochiConfig;

pub const DEFAULT_LOCK_FILE: &str = "mochi-lock.json";

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StaticConfig {
    root: PathBuf,
    #[serde(default)]
    lock_file: Option<PathBuf>,
    #[serde(default)]
    extensions: Option<Vec<String>>,
    #[serde(default)]
    concurrency: Option<usize>,
    #[serde(default)]
    rate_limit: Option<RateLimitSection>,
    #[serde(default)]
    archive_removed: bool,
    #[serde(default)]
    delete_stale_decks: bool,
    #[serde(default)]
    decks: BTreeMap<String, DeckSection>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RateLimitSection {
    per_second: f64,
    #[serde(default)]
    burst: Option<u32>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DeckSection {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    parser: Option<String>,
    #[serde(default)]
    template: Option<String>,
}

/// Everything a sync run needs: engine settings, where the lock lives, and
/// API credentials.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub sync: SynchroniseConfig,
    pub lock_file: PathBuf,
    pub mochi: MochiConfig,
}

fn parse_parser(kind: &str) -> Result<ParserKind> {
    kind.parse::<ParserKind>().map_err(|e| {
        error!(kind = %kind, "Unsupported parser in config");
        anyhow::Error::new(e)
    })
}

/// Relative paths in the config are taken relative to the config file.
fn anchor(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Loads a static YAML config file (no secrets) and injects the API
/// credentials from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<LoadedConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e)
    })?;

    let static_conf: StaticConfig = serde_yaml::from_str(&config_content).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
        anyhow::anyhow!("Failed to parse config YAML: {e}")
    })?;

    let mochi = MochiConfig::from_env().map_err(|e| {
        error!(error = %e, "Mochi credentials missing from environment");
        anyhow::anyhow!("Mochi credentials missing from environment: {e}")
    })?;

    let base = path_ref.parent().unwrap_or_else(|| Path::new("."));
    let root = anchor(base, static_conf.root);
    let lock_file = match static_conf.lock_file {
        Some(lock_file) => anchor(base, lock_file),
        None => root.join(DEFAULT_LOCK_FILE),
    };

    let mut sync = SynchroniseConfig::new(&root);
    if let Some(extensions) = static_conf.extensions {
        sync.extensions = extensions
            .into_iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        if sync.extensions.is_empty() {
            anyhow::bail!("extensions must name at least one file extension");
        }
    }
    if let Some(concurrency) = static_conf.concurrency {
        if concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if concurrency > MAX_WORKERS {
            warn!(concurrency, max = MAX_WORKERS, "Concurrency capped");
        }
        sync.workers = concurrency.min(MAX_WORKERS);
    }
    if let Some(limit) = static_conf.rate_limit {
        if !(limit.per_second > 0.0) {
            anyhow::bail!("rate_limit.per_second must be positive");
        }
        sync.rate_limit = RateLimit {
            per_second: limit.per_second,
            burst: limit.burst.unwrap_or(RateLimit::default().burst).max(1),
        };
    }
    sync.archive_removed = static_conf.archive_removed;
    sync.delete_stale_decks = static_conf.delete_stale_decks;

    for (dir, deck) in static_conf.decks {
        let parser = deck
            .parser
            .as_deref()
            .map(parse_parser)
            .transpose()
            .with_context(|| format!("Invalid settings for deck {dir}"))?;
        let key = normalize_dir(&dir);
        if key == "/" {
            warn!("Settings for the root directory only set the default parser");
        }
        sync.decks.insert(
            key,
            DeckConfig {
                name: deck.name,
                parser,
                template: deck.template,
            },
        );
    }

    sync.trace_loaded();
    info!(
        root = %sync.root.display(),
        lock_file = %lock_file.display(),
        base_url = %mochi.base_url,
        "Config loaded and merged successfully"
    );

    Ok(LoadedConfig {
        sync,
        lock_file,
        mochi,
    })
}
