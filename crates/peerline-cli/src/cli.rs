//! Clap CLI definitions for Peerline.

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

pub const NOTE: &str = "\
Usage: Run 'peerline -sp <SOURCE_PORT>' where <SOURCE_PORT> can be any port number.
Now run 'peerline -d <MULTIADDR>' where <MULTIADDR> is multiaddress of previous listener host.";

/// Long flags that are also accepted with a single dash.
const LEGACY_FLAGS: &[&str] = &["sp", "note", "debug"];

/// Peerline — line chat between two peers over libp2p.
#[derive(Parser, Debug)]
#[command(name = "peerline", version, about)]
pub struct Cli {
    /// Source port to listen on. 0 lets the OS pick one.
    #[arg(long = "sp", value_name = "PORT")]
    pub source_port: Option<u16>,

    /// Destination multiaddr, e.g. /ip4/127.0.0.1/tcp/4001/p2p/<peer-id>.
    /// Without it, wait for an incoming connection.
    #[arg(short = 'd', long = "dest", value_name = "MULTIADDR")]
    pub dest: Option<String>,

    /// Display usage note and exit.
    #[arg(long)]
    pub note: bool,

    /// Generate the same node ID on every run (seeded from the source port).
    #[arg(long)]
    pub debug: bool,

    /// Path to config file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Parse the process arguments, accepting `-sp`/`-note`/`-debug`.
    pub fn parse_args() -> Self {
        Self::parse_from(normalize_legacy_flags(std::env::args_os()))
    }
}

/// Rewrite single-dash long flags (`-sp`, `-sp=4001`) to their double-dash
/// form. Everything after a literal `--` is left alone.
pub fn normalize_legacy_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for arg in args {
        if passthrough {
            out.push(arg);
            continue;
        }
        let rewritten = arg.to_str().and_then(|s| {
            if s == "--" {
                return None;
            }
            let rest = s.strip_prefix('-').filter(|r| !r.starts_with('-'))?;
            let name = rest.split_once('=').map_or(rest, |(name, _)| name);
            LEGACY_FLAGS.contains(&name).then(|| OsString::from(format!("-{s}")))
        });
        if arg == "--" {
            passthrough = true;
        }
        out.push(rewritten.unwrap_or(arg));
    }
    out
}
