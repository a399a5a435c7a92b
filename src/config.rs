use crate::options::{Limits, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::retransmit::DEFAULT_MAX_RETRIES;
use anstyle::AnsiColor;
use anyhow::{bail, Context};
use clap::builder::styling::Styles;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "tftp-rs")]
#[command(about = "A TFTP server (RFC 1350, 2347, 2348, 2349)", long_about = None)]
#[command(styles = STYLES)]
pub struct Cli {
    /// Listen ip
    #[arg(short, long, default_value = "0.0.0.0")]
    pub ip: IpAddr,

    /// Listen port
    #[arg(short, long, default_value_t = 69)]
    pub port: u16,

    /// Directory to serve files from and store uploads in
    #[arg(short, long, default_value = ".")]
    pub directory: PathBuf,

    /// Retransmission timeout (s), unless the client negotiates one
    #[arg(short, long, default_value_t = 3)]
    pub timeout: u64,

    /// Retransmissions of a packet before a transfer is abandoned
    #[arg(short, long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub retries: u8,

    /// Largest block size a client may negotiate
    #[arg(long, default_value_t = 8192)]
    pub max_blksize: u16,

    /// Refuse write requests
    #[arg(long)]
    pub read_only: bool,

    /// Transfers allowed to run at once
    #[arg(long, default_value_t = 64)]
    pub max_connections: usize,

    /// Local ports transfers may use, as LOW-HIGH (default: any free port)
    #[arg(long, value_parser = parse_port_range)]
    pub port_range: Option<RangeInclusive<u16>>,
}

fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>, String> {
    let (low, high) = raw
        .split_once('-')
        .ok_or_else(|| format!("'{raw}' is not of the form LOW-HIGH"))?;
    let low: u16 = low.trim().parse().map_err(|e| format!("bad low port: {e}"))?;
    let high: u16 = high.trim().parse().map_err(|e| format!("bad high port: {e}"))?;
    if low == 0 || low > high {
        return Err(format!("'{raw}' is not a valid port range"));
    }
    Ok(low..=high)
}

/// Server settings, fixed for the lifetime of the process and shared read-only by all sessions.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub root: PathBuf,
    pub limits: Limits,
    pub max_retries: u8,
    pub allow_writes: bool,
    pub max_connections: usize,
    pub port_range: Option<RangeInclusive<u16>>,
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(args: Cli) -> anyhow::Result<Config> {
        if args.timeout == 0 {
            bail!("timeout must be at least one second");
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&args.max_blksize) {
            bail!("max-blksize must be between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}");
        }
        if args.max_connections == 0 {
            bail!("max-connections must be at least 1");
        }
        let root = args
            .directory
            .canonicalize()
            .with_context(|| format!("Couldn't open directory {}", args.directory.display()))?;
        if !root.is_dir() {
            bail!("{} is not a directory", root.display());
        }

        Ok(Config {
            listen: SocketAddr::new(args.ip, args.port),
            root,
            limits: Limits {
                max_block_size: args.max_blksize,
                default_timeout: Duration::from_secs(args.timeout),
            },
            max_retries: args.retries,
            allow_writes: !args.read_only,
            max_connections: args.max_connections,
            port_range: args.port_range,
        })
    }
}
