//! pixelflash: upload firmware and LED patterns to ESP-01 class devices.

mod args;
mod config;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use pixelflash_engine::{
    DeviceConnector, DeviceLink, Engine, EngineConfig, ErrorKind, HttpConnector, Payload,
    TransferResult, VerificationTier,
};
use pixelflash_transfer::{DIGEST_BLOCK_SIZE, StatusSnapshot, digest_payload};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use args::{Command, SendArgs, Target};

/// Process exit code for a finished session.
fn exit_code(result: &TransferResult) -> u8 {
    match result.failure.as_ref().map(|f| f.kind) {
        None => 0,
        Some(kind) => kind_exit_code(kind),
    }
}

fn kind_exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Validation => 2,
        ErrorKind::Concurrency => 3,
        ErrorKind::Unreachable => 4,
        ErrorKind::Transport => 5,
        ErrorKind::VerificationMismatch => 6,
        ErrorKind::Cancelled => 130,
    }
}

/// Exit code for a stored-payload check: a mismatch fails, a missing
/// device digest does not.
fn verification_exit_code(tier: VerificationTier) -> u8 {
    match tier {
        VerificationTier::Verified | VerificationTier::LocalOnly => 0,
        VerificationTier::Failed => kind_exit_code(ErrorKind::VerificationMismatch),
    }
}

fn progress_line(s: &StatusSnapshot) -> String {
    let mut line = format!(
        "{:<22} {:>6.1}%  {}/{} bytes",
        s.phase.as_str(),
        s.percent(),
        s.bytes_sent,
        s.total_bytes
    );
    if s.bytes_per_second > 0.0 {
        line.push_str(&format!("  {:.1} KiB/s", s.bytes_per_second / 1024.0));
    }
    if let Some(eta) = s.eta() {
        line.push_str(&format!("  eta {}s", eta.as_secs()));
    }
    line
}

fn print_result(result: &TransferResult) {
    eprintln!();
    println!("session   : {}", result.session_id);
    println!("state     : {}", result.state);
    if let Some(strategy) = result.strategy {
        println!("strategy  : {strategy}");
    }
    println!("sent      : {}/{} bytes", result.bytes_sent, result.total_bytes);
    if let Some(digest) = &result.local_digest {
        println!("sha256    : {digest}");
    }
    if let Some(verification) = &result.verification {
        println!("tier      : {}", verification.tier);
        if let Some(remote) = &verification.remote_digest {
            println!("device    : {remote}");
        }
        if verification.tier == VerificationTier::LocalOnly {
            println!(
                "warning   : delivered but NOT verified ({})",
                verification.reason.as_deref().unwrap_or("no device digest")
            );
        }
    }
    if let Some(failure) = &result.failure {
        println!("error     : [{}] {}", failure.kind, failure.message);
    }
}

async fn cmd_send(send: SendArgs) -> Result<u8> {
    let config = config::load(send.config.as_deref())?;
    let engine = Engine::new(config)?;

    let payload = match Payload::from_file(&send.file) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("error: cannot read {}: {e}", send.file.display());
            return Ok(kind_exit_code(ErrorKind::Validation));
        }
    };

    let handle = match engine.begin(
        payload,
        send.target.destination(),
        send.verify,
        send.layout.clone(),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(kind_exit_code(e.kind()));
        }
    };

    let mut rx = engine.subscribe();
    let progress = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let line = progress_line(&rx.borrow_and_update());
            eprint!("\r{line}");
        }
    });

    let id = handle.id().to_string();
    let canceller = engine.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(session = %id, "interrupted, cancelling after the current unit");
            canceller.cancel_session(&id);
        }
    });

    let result = handle.wait().await;
    ctrl_c.abort();
    progress.abort();

    print_result(&result);

    if let Some(path) = &send.report {
        write_report(&engine, path)?;
    }

    Ok(exit_code(&result))
}

fn write_report(engine: &Engine, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&engine.report())?;
    std::fs::write(path, json).with_context(|| format!("cannot write {}", path.display()))?;
    info!(path = %path.display(), "upload report written");
    Ok(())
}

async fn cmd_digest(file: &Path) -> Result<u8> {
    let payload = match Payload::from_file(file) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("error: cannot read {}: {e}", file.display());
            return Ok(kind_exit_code(ErrorKind::Validation));
        }
    };
    let digest = tokio::task::spawn_blocking(move || digest_payload(&payload, DIGEST_BLOCK_SIZE))
        .await?
        .with_context(|| format!("cannot hash {}", file.display()))?;
    println!("{digest}  {}", file.display());
    Ok(0)
}

async fn cmd_verify(file: &Path, target: &Target, config: EngineConfig) -> Result<u8> {
    let engine = Engine::new(config)?;
    let payload = match Payload::from_file(file) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("error: cannot read {}: {e}", file.display());
            return Ok(kind_exit_code(ErrorKind::Validation));
        }
    };

    let verification = match engine.verify_existing(payload, target.destination()).await {
        Ok(verification) => verification,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(kind_exit_code(e.kind()));
        }
    };

    println!("sha256    : {}", verification.local_digest);
    println!("tier      : {}", verification.tier);
    if let Some(remote) = &verification.remote_digest {
        println!("device    : {remote}");
    }
    if let Some(stored) = &verification.remote_file {
        println!("file      : {stored}");
    }
    match verification.tier {
        VerificationTier::Verified => {}
        VerificationTier::LocalOnly => println!(
            "warning   : device digest unavailable ({})",
            verification.reason.as_deref().unwrap_or("no device digest")
        ),
        VerificationTier::Failed => println!("error     : device holds different contents"),
    }
    Ok(verification_exit_code(verification.tier))
}

async fn cmd_probe(target: &Target, config: EngineConfig) -> Result<u8> {
    let destination = target.destination();
    let device = HttpConnector::new()?.connect(&destination, &config)?;

    match tokio::time::timeout(config.probe_timeout(), device.probe()).await {
        Ok(Ok(())) => {
            println!("{destination} is reachable");
            Ok(0)
        }
        Ok(Err(e)) => {
            eprintln!("{destination} unreachable: {e}");
            Ok(kind_exit_code(ErrorKind::Unreachable))
        }
        Err(_) => {
            eprintln!(
                "{destination} unreachable: no answer within {:?}",
                config.probe_timeout()
            );
            Ok(kind_exit_code(ErrorKind::Unreachable))
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let command = match args::parse(&argv) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            args::print_usage();
            return Ok(ExitCode::from(1));
        }
    };

    let code = match command {
        Command::Send(send) => cmd_send(send).await?,
        Command::Digest { file } => cmd_digest(&file).await?,
        Command::Verify {
            file,
            target,
            config: path,
        } => {
            let config = config::load(path.as_deref())?;
            cmd_verify(&file, &target, config).await?
        }
        Command::Probe {
            target,
            config: path,
        } => {
            let config = config::load(path.as_deref())?;
            cmd_probe(&target, config).await?
        }
        Command::Help => {
            args::print_usage();
            0
        }
    };

    Ok(ExitCode::from(code))
}
