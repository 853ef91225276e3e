//! The channel-descriptor collaborator. This module is deliberately outside the
//! relay/supervisor dependency graph: `ProxySupervisor::start` takes only a `Vec<ChannelDescriptor>`,
//! never a config file path or CLI struct, so malformed input stays this module's problem.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => bail!("unknown protocol '{other}' (expected tcp or udp)"),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// An immutable, parsed channel. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
    pub protocol: Protocol,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl ChannelDescriptor {
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// Raw deserialize target for the TOML table form, kept separate so `Protocol` gets its own
/// validating `FromStr` rather than deriving a permissive string enum.
#[derive(Debug, Deserialize)]
struct RawChannel {
    protocol: String,
    listen_port: u16,
    target_host: String,
    target_port: u16,
}

impl TryFrom<RawChannel> for ChannelDescriptor {
    type Error = anyhow::Error;

    fn try_from(raw: RawChannel) -> Result<Self> {
        Ok(ChannelDescriptor {
            protocol: raw.protocol.parse()?,
            listen_port: raw.listen_port,
            target_host: raw.target_host,
            target_port: raw.target_port,
        })
    }
}

/// Parses one line of the literal grammar: `protocol listen_port -> target_host target_port`.
impl FromStr for ChannelDescriptor {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [protocol, listen_port, arrow, target_host, target_port] = tokens.as_slice() else {
            bail!("expected 'protocol listen_port -> target_host target_port', got '{line}'");
        };
        if *arrow != "->" {
            bail!("expected literal '->' as the third token, got '{arrow}'");
        }
        Ok(ChannelDescriptor {
            protocol: protocol.parse()?,
            listen_port: listen_port
                .parse()
                .with_context(|| format!("invalid listen port '{listen_port}'"))?,
            target_host: (*target_host).to_string(),
            target_port: target_port
                .parse()
                .with_context(|| format!("invalid target port '{target_port}'"))?,
        })
    }
}

/// One non-blank, non-comment line per channel.
pub fn parse_channel_lines(text: &str) -> Result<Vec<ChannelDescriptor>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ChannelDescriptor::from_str)
        .collect()
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    channel: Vec<RawChannel>,
}

/// Parses the TOML-table equivalent, following this repository's existing `[[forward]]`-table
/// convention (here `[[channel]]`).
pub fn parse_channel_toml(text: &str) -> Result<Vec<ChannelDescriptor>> {
    let FileConfig { channel } = toml::from_str(text).context("invalid TOML channel config")?;
    channel.into_iter().map(ChannelDescriptor::try_from).collect()
}

/// Reads a channel config file, dispatching on extension: `.toml` uses the table form, anything
/// else uses the line grammar.
pub fn load_channel_file(path: &Path) -> Result<Vec<ChannelDescriptor>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read channel config {}", path.display()))?;
    if path.extension().and_then(|ext| ext.to_str()) == Some("toml") {
        parse_channel_toml(&text)
    } else {
        parse_channel_lines(&text)
    }
    .with_context(|| format!("invalid channel config in {}", path.display()))
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Dual-protocol TCP/UDP port-forwarding relay")]
pub struct Cli {
    /// Path to a channel config file (line grammar, or `.toml` for the table form).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Inline channel in `protocol listen_port -> target_host target_port` form. May repeat.
    #[arg(long = "channel", value_name = "CHANNEL")]
    pub inline_channels: Vec<ChannelArg>,

    /// Override log level (e.g. info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Route this process's listens/dials through the named network namespace instead of the
    /// default OS network stack.
    #[arg(long)]
    pub netns: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChannelArg(pub ChannelDescriptor);

impl FromStr for ChannelArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(ChannelArg(s.parse()?))
    }
}

/// Resolves the full channel set: config file (if any) followed by inline `--channel` entries.
pub fn load_config(cli: &Cli) -> Result<Vec<ChannelDescriptor>> {
    let mut channels = match cli.config.as_ref() {
        Some(path) => load_channel_file(path)?,
        None => Vec::new(),
    };
    channels.extend(cli.inline_channels.iter().map(|c| c.0.clone()));
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_line() {
        let d: ChannelDescriptor = "tcp 5001 -> 127.0.0.1 6001".parse().unwrap();
        assert_eq!(d.protocol, Protocol::Tcp);
        assert_eq!(d.listen_port, 5001);
        assert_eq!(d.target_host, "127.0.0.1");
        assert_eq!(d.target_port, 6001);
        assert_eq!(d.target(), "127.0.0.1:6001");
    }

    #[test]
    fn rejects_bad_arrow() {
        assert!("tcp 5001 => 127.0.0.1 6001".parse::<ChannelDescriptor>().is_err());
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!("sctp 5001 -> 127.0.0.1 6001".parse::<ChannelDescriptor>().is_err());
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        let text = "\n# a comment\ntcp 5001 -> a 1\n\nudp 5002 -> b 2\n";
        let parsed = parse_channel_lines(text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].protocol, Protocol::Udp);
    }

    #[test]
    fn parses_toml_table_form() {
        let text = r#"
            [[channel]]
            protocol = "tcp"
            listen_port = 5001
            target_host = "127.0.0.1"
            target_port = 6001
        "#;
        let parsed = parse_channel_toml(text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].listen_port, 5001);
    }
}
