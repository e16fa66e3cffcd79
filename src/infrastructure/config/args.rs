use super::app_config::LogLevel;
use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments. Flags override values from the config file.
#[derive(Debug, Parser)]
#[command(
    name = "lazytile",
    version,
    about = "Loads remote images into display slots through a memory and disk cache",
    long_about = None
)]
pub struct CliArgs {
    /// Image URLs to load.
    #[arg(value_name = "URL")]
    pub urls: Vec<String>,

    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Disable the in-memory cache.
    #[arg(long)]
    pub no_memory_cache: bool,

    /// Disable the on-disk cache.
    #[arg(long)]
    pub no_disk_cache: bool,

    /// Maximum concurrent downloads.
    #[arg(short, long, value_name = "N")]
    pub workers: Option<usize>,

    /// Network timeout in seconds.
    #[arg(short, long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Disk cache directory.
    #[arg(long, value_name = "PATH", env = "LAZYTILE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Number of display slots URLs are assigned to, round-robin.
    /// Defaults to one slot per URL.
    #[arg(short, long, value_name = "N")]
    pub slots: Option<u64>,

    /// Clear both caches before loading.
    #[arg(long)]
    pub clear_cache: bool,

    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_urls_and_flags() {
        let args = CliArgs::parse_from([
            "lazytile",
            "--slots",
            "2",
            "--json",
            "--clear-cache",
            "http://a/1.png",
            "http://a/2.png",
        ]);

        assert_eq!(args.urls, vec!["http://a/1.png", "http://a/2.png"]);
        assert_eq!(args.slots, Some(2));
        assert!(args.json);
        assert!(args.clear_cache);
        assert!(!args.no_memory_cache);
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        assert!(CliArgs::try_parse_from(["lazytile", "--log-level", "loud"]).is_err());
    }
}
