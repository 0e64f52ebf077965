//! Command-line surface. Flags override whatever the config file set; the
//! config file overrides the built-in defaults.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "buddy-blocks", about = "Content-addressed block storage server")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the single data file.
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Directory for the metadata store.
    #[arg(long)]
    pub meta_dir: Option<PathBuf>,

    /// Number of worker threads.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Listen port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Applies CLI overrides on top of a file-or-default [`RawConfig`].
    pub fn apply(&self, raw: &mut crate::config::RawConfig) {
        if let Some(path) = &self.data_file {
            raw.data_file = Some(path.clone());
        }
        if let Some(path) = &self.meta_dir {
            raw.meta_dir = Some(path.clone());
        }
        if let Some(workers) = self.workers {
            raw.workers = Some(workers);
        }
        if let Some(port) = self.port {
            raw.port = Some(port);
        }
    }
}
