//! Command line parsing.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use pixelflash_engine::{Destination, EndpointPaths, PayloadLayout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: Option<u16>,
    pub ota: bool,
    pub query_port: Option<u16>,
    pub chunked: bool,
}

impl Target {
    pub fn destination(&self) -> Destination {
        let mut destination = if self.ota {
            Destination::raw_ota(&self.host)
        } else {
            Destination::http(&self.host)
        };
        if let Some(port) = self.port {
            destination = destination.with_port(port);
        }
        if let Some(port) = self.query_port {
            destination = destination.with_query_port(port);
        }
        if !self.chunked {
            destination = destination.with_paths(EndpointPaths {
                chunked_upload: None,
                metadata: None,
                ..EndpointPaths::default()
            });
        }
        destination
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendArgs {
    pub file: PathBuf,
    pub target: Target,
    pub verify: bool,
    pub layout: PayloadLayout,
    pub config: Option<PathBuf>,
    pub report: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(SendArgs),
    Digest { file: PathBuf },
    Verify {
        file: PathBuf,
        target: Target,
        config: Option<PathBuf>,
    },
    Probe { target: Target, config: Option<PathBuf> },
    Help,
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .with_context(|| format!("{flag} requires a value"))
}

fn number<T: std::str::FromStr>(args: &[String], i: &mut usize, flag: &str) -> Result<T> {
    value(args, i, flag)?
        .parse()
        .ok()
        .with_context(|| format!("{flag} must be a number"))
}

pub fn parse(args: &[String]) -> Result<Command> {
    let mut host = None;
    let mut port = None;
    let mut ota = false;
    let mut query_port = None;
    let mut verify = true;
    let mut chunked = true;
    let mut layout = PayloadLayout::default();
    let mut config = None;
    let mut report = None;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => host = Some(value(args, &mut i, "--host")?.to_string()),
            "--port" => port = Some(number(args, &mut i, "--port")?),
            "--ota" => ota = true,
            "--query-port" => query_port = Some(number(args, &mut i, "--query-port")?),
            "--no-verify" => verify = false,
            "--no-chunked" => chunked = false,
            "--records" => layout.record_count = number(args, &mut i, "--records")?,
            "--record-size" => layout.record_size = Some(number(args, &mut i, "--record-size")?),
            "--delay" => layout.unit_delay_ms = number(args, &mut i, "--delay")?,
            "--config" => config = Some(PathBuf::from(value(args, &mut i, "--config")?)),
            "--report" => report = Some(PathBuf::from(value(args, &mut i, "--report")?)),
            "-h" | "--help" => return Ok(Command::Help),
            flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
            other => positional.push(other),
        }
        i += 1;
    }

    let target = |host: Option<String>| -> Result<Target> {
        Ok(Target {
            host: host.context("--host is required")?,
            port,
            ota,
            query_port,
            chunked,
        })
    };

    match positional.as_slice() {
        ["send", file] => Ok(Command::Send(SendArgs {
            file: PathBuf::from(file),
            target: target(host)?,
            verify,
            layout,
            config,
            report,
        })),
        ["digest", file] => Ok(Command::Digest {
            file: PathBuf::from(file),
        }),
        ["verify", file] => Ok(Command::Verify {
            file: PathBuf::from(file),
            target: target(host)?,
            config,
        }),
        ["probe"] => Ok(Command::Probe {
            target: target(host)?,
            config,
        }),
        ["help"] | [] => Ok(Command::Help),
        ["send"] | ["digest"] | ["verify"] => bail!("missing <file> argument"),
        other => bail!("unknown command: {}", other.join(" ")),
    }
}

pub fn print_usage() {
    println!("Usage: pixelflash <command> [options]");
    println!();
    println!("Commands:");
    println!("  send <file>     Upload a payload and verify it");
    println!("  digest <file>   Print the SHA-256 of a payload");
    println!("  verify <file>   Compare a payload with what the device stores");
    println!("  probe           Check that a device answers");
    println!();
    println!("Options:");
    println!("  --host <host>          Device address (required for send/verify/probe)");
    println!("  --port <port>          Transfer port (default: 80, or 8266 with --ota)");
    println!("  --ota                  Use the raw OTA block protocol");
    println!("  --query-port <port>    HTTP port for hash queries in OTA mode");
    println!("  --no-verify            Skip the device digest check");
    println!("  --no-chunked           Device has no chunked upload endpoints");
    println!("  --records <n>          Records (frames) in the payload (default: 1)");
    println!("  --record-size <bytes>  Fixed record size, when known");
    println!("  --delay <ms>           Playback delay per record (default: 100)");
    println!("  --config <path>        Engine config (default: ~/.config/pixelflash/engine.toml)");
    println!("  --report <path>        Write a JSON upload report");
}
