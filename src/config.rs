//! Runtime configuration: TOML file + environment overrides, validated once
//! at startup before any allocator or socket operation runs.

use std::path::PathBuf;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use buddy_core::SizeClass;

const DEFAULT_CONTROLLER_IDLE_NS: u64 = 1_000_000; // 1 ms, per spec.md §6
const DEFAULT_WORKER_POLL_NS: u64 = 1_000; // 1 µs
const DEFAULT_PORT: u16 = 10001;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_MAILBOX_CAPACITY: usize = 4096;
const DEFAULT_EXTEND_CHUNK_MACRO_BLOCKS: u64 = 16;
const DEFAULT_POOL_TARGET_FREE: usize = 4;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {path}: {source}"))]
    Read { path: String, source: std::io::Error },
    #[snafu(display("failed to parse config file {path}: {source}"))]
    Parse { path: String, source: toml::de::Error },
    #[snafu(display("mailbox_capacity must be a power of two, got {value}"))]
    MailboxCapacityNotPowerOfTwo { value: usize },
    #[snafu(display("workers must be at least 1"))]
    ZeroWorkers,
    #[snafu(display("extend_chunk_macro_blocks must be at least 1"))]
    ZeroExtendChunk,
}

/// Top-level configuration, deserialized from TOML with every field
/// optional so a partial file only overrides what it names.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RawConfig {
    pub data_file: Option<PathBuf>,
    pub meta_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub mailbox_capacity: Option<usize>,
    pub controller_idle_ns: Option<u64>,
    pub worker_poll_ns: Option<u64>,
    pub extend_chunk_macro_blocks: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub allocator: AllocatorConfig,
    pub pool: PoolConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Resolves spec.md §9 Open Question 1: the mandated behavior is
    /// rejection of duplicate hashes. This opt-in flag switches
    /// `occupy_from_temp` to the idempotent alternative.
    pub idempotent_duplicate_hash: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PoolConfig {
    pub target_free: Option<[usize; SizeClass::POOLABLE.len()]>,
}

/// Fully resolved, validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_file: PathBuf,
    pub meta_dir: PathBuf,
    pub port: u16,
    pub workers: usize,
    pub mailbox_capacity: usize,
    pub controller_idle_ns: u64,
    pub worker_poll_ns: u64,
    pub extend_chunk_macro_blocks: u64,
    pub shutdown_grace_ms: u64,
    pub idempotent_duplicate_hash: bool,
    pub pool_target_free: [usize; SizeClass::POOLABLE.len()],
}

impl RawConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).context(ReadSnafu {
            path: path.display().to_string(),
        })?;
        toml::from_str(&text).context(ParseSnafu {
            path: path.display().to_string(),
        })
    }

    /// Overlays environment variables of the form `BUDDY_BLOCKS_<FIELD>`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BUDDY_BLOCKS_DATA_FILE") {
            self.data_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("BUDDY_BLOCKS_META_DIR") {
            self.meta_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("BUDDY_BLOCKS_PORT") {
            if let Ok(port) = v.parse() {
                self.port = Some(port);
            }
        }
        if let Ok(v) = std::env::var("BUDDY_BLOCKS_WORKERS") {
            if let Ok(workers) = v.parse() {
                self.workers = Some(workers);
            }
        }
    }

    pub fn resolve(self) -> Result<Config, ConfigError> {
        let mailbox_capacity = self.mailbox_capacity.unwrap_or(DEFAULT_MAILBOX_CAPACITY);
        if !mailbox_capacity.is_power_of_two() {
            return MailboxCapacityNotPowerOfTwoSnafu {
                value: mailbox_capacity,
            }
            .fail();
        }
        let workers = self.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return ZeroWorkersSnafu.fail();
        }
        let extend_chunk_macro_blocks = self
            .extend_chunk_macro_blocks
            .unwrap_or(DEFAULT_EXTEND_CHUNK_MACRO_BLOCKS);
        if extend_chunk_macro_blocks == 0 {
            return ZeroExtendChunkSnafu.fail();
        }

        Ok(Config {
            data_file: self.data_file.unwrap_or_else(|| PathBuf::from("buddy-blocks.data")),
            meta_dir: self.meta_dir.unwrap_or_else(|| PathBuf::from("buddy-blocks.meta")),
            port: self.port.unwrap_or(DEFAULT_PORT),
            workers,
            mailbox_capacity,
            controller_idle_ns: self.controller_idle_ns.unwrap_or(DEFAULT_CONTROLLER_IDLE_NS),
            worker_poll_ns: self.worker_poll_ns.unwrap_or(DEFAULT_WORKER_POLL_NS),
            extend_chunk_macro_blocks,
            shutdown_grace_ms: self.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            idempotent_duplicate_hash: self.allocator.idempotent_duplicate_hash.unwrap_or(false),
            pool_target_free: self
                .pool
                .target_free
                .unwrap_or([DEFAULT_POOL_TARGET_FREE; SizeClass::POOLABLE.len()]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_without_a_file() {
        let cfg = RawConfig::default().resolve().unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.workers, DEFAULT_WORKERS);
        assert!(!cfg.idempotent_duplicate_hash);
    }

    #[test]
    fn rejects_non_power_of_two_mailbox_capacity() {
        let raw = RawConfig {
            mailbox_capacity: Some(100),
            ..Default::default()
        };
        assert!(matches!(
            raw.resolve().unwrap_err(),
            ConfigError::MailboxCapacityNotPowerOfTwo { value: 100 }
        ));
    }

    #[test]
    fn parses_toml_fragment() {
        let raw: RawConfig = toml::from_str(
            r#"
            port = 9000
            workers = 8

            [allocator]
            idempotent_duplicate_hash = true
            "#,
        )
        .unwrap();
        let cfg = raw.resolve().unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.workers, 8);
        assert!(cfg.idempotent_duplicate_hash);
    }
}
