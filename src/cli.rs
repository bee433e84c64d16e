use clap::Parser;

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "channel-mirror",
    version,
    about = "Mirror media attachments from a channel feed into a storage tree"
)]
pub struct Cli {
    /// Base URL of the feed gateway
    #[arg(long, env = "MIRROR_FEED_URL")]
    pub feed_url: String,

    /// Bearer token for the feed gateway.
    /// WARNING: passing via --api-token is visible in process listings.
    /// Prefer the MIRROR_API_TOKEN environment variable instead.
    #[arg(long, env = "MIRROR_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Channel to mirror: @name, name, https://t.me/name or a numeric id
    #[arg(short = 'c', long, env = "MIRROR_CHANNEL", allow_negative_numbers = true)]
    pub channel: Option<String>,

    /// Base directory of the storage tree (must exist)
    #[arg(short = 'd', long, env = "MIRROR_DESTINATION")]
    pub destination: Option<String>,

    /// Folder created under the destination for mirrored files
    #[arg(long, env = "MIRROR_FOLDER", default_value = "Channel_Mirror")]
    pub folder: String,

    /// Local scratch directory for in-flight downloads
    #[arg(long, env = "MIRROR_STAGING_DIR", default_value = "~/.channel-mirror/staging")]
    pub staging_dir: String,

    /// Enumerate oldest messages first
    #[arg(long, env = "MIRROR_REVERSE")]
    pub reverse: bool,

    /// Download attempts per item (rate-limit waits don't count)
    #[arg(long, env = "MIRROR_MAX_ATTEMPTS", default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,

    /// Items above this size (MiB) get stall monitoring
    #[arg(long, env = "MIRROR_LARGE_FILE_THRESHOLD_MB", default_value_t = 50)]
    pub large_file_threshold_mb: u64,

    /// Items at or below this size (MiB) are checksum-verified after relocation
    #[arg(long, env = "MIRROR_DIGEST_THRESHOLD_MB", default_value_t = 100)]
    pub digest_threshold_mb: u64,

    /// Leave files in the staging directory after the run
    #[arg(long)]
    pub keep_staging: bool,

    /// List channels the token can read and exit
    #[arg(long)]
    pub list_channels: bool,

    /// Log level
    #[arg(long, value_enum, env = "MIRROR_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}
