use std::path::PathBuf;

use anyhow::Context;

use crate::download::TransferConfig;
use crate::feed::ChannelIdentity;
use crate::mirror::MirrorConfig;
use crate::retry::RetryPolicy;
use crate::types::EnumerationOrder;

const MIB: u64 = 1024 * 1024;

/// Application configuration, resolved from the CLI once at startup.
pub struct Config {
    pub feed_url: String,
    pub api_token: Option<String>,
    pub channel: Option<ChannelIdentity>,
    /// Base of the storage tree; files land in `destination/folder`.
    pub destination: Option<PathBuf>,
    pub folder: String,
    pub staging_dir: PathBuf,

    pub large_file_threshold: u64,
    pub digest_threshold: u64,
    pub max_attempts: u32,

    pub order: EnumerationOrder,

    pub keep_staging: bool,
    pub list_channels: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("feed_url", &self.feed_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("channel", &self.channel)
            .field("destination", &self.destination)
            .field("folder", &self.folder)
            .field("staging_dir", &self.staging_dir)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(cli: crate::cli::Cli) -> anyhow::Result<Self> {
        let channel = cli
            .channel
            .as_deref()
            .map(|raw| {
                ChannelIdentity::parse(raw)
                    .with_context(|| format!("'{}' is not a valid channel identity", raw))
            })
            .transpose()?;
        let destination = cli.destination.as_deref().map(expand_tilde);

        if !cli.list_channels {
            if channel.is_none() {
                anyhow::bail!("--channel is required unless --list-channels is given");
            }
            let Some(base) = &destination else {
                anyhow::bail!("--destination is required unless --list-channels is given");
            };
            if !base.is_dir() {
                anyhow::bail!(
                    "Destination {} does not exist or is not a directory",
                    base.display()
                );
            }
        }

        Ok(Self {
            feed_url: cli.feed_url,
            api_token: cli.api_token.filter(|t| !t.is_empty()),
            channel,
            destination,
            folder: cli.folder,
            staging_dir: expand_tilde(&cli.staging_dir),
            large_file_threshold: cli.large_file_threshold_mb.saturating_mul(MIB),
            digest_threshold: cli.digest_threshold_mb.saturating_mul(MIB),
            max_attempts: cli.max_attempts,
            order: if cli.reverse {
                EnumerationOrder::OldestFirst
            } else {
                EnumerationOrder::NewestFirst
            },
            keep_staging: cli.keep_staging,
            list_channels: cli.list_channels,
            no_progress_bar: cli.no_progress_bar,
        })
    }

    /// Where mirrored files land: `<destination>/<folder>`.
    pub fn destination_dir(&self) -> Option<PathBuf> {
        self.destination.as_ref().map(|base| base.join(&self.folder))
    }

    /// Target channel and pipeline parameters for a mirror run.
    pub fn mirror_target(&self) -> anyhow::Result<(ChannelIdentity, MirrorConfig)> {
        let channel = self.channel.clone().context("no channel configured")?;
        let destination = self.destination_dir().context("no destination configured")?;

        let mut config = MirrorConfig::new(self.staging_dir.clone(), destination);
        config.order = self.order;
        config.digest_threshold = self.digest_threshold;
        config.transfer = TransferConfig {
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            large_file_threshold: self.large_file_threshold,
            ..TransferConfig::default()
        };
        Ok((channel, config))
    }
}
