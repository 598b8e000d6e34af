use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde::Serialize;
use stagesnap_core::{
    CollectConfig, CollectOptions, ItemProgress, ProgressSink, RestoreOptions, SourceMode, Tuning,
    build_backup_with, is_encrypted_text, load_backup, parse_backup_text, restore_backup_with,
    write_artifact,
};

#[derive(Parser)]
#[command(name = "stagesnap")]
#[command(about = "Snapshot a git index or a directory tree into a portable artifact", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Emit NDJSON progress events on stdout.
    #[arg(long)]
    events: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture staged changes (index mode) or a full tree (fs mode).
    Backup {
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(long, default_value = "index")]
        mode: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        /// Environment variable holding the artifact password.
        #[arg(long)]
        password_env: Option<String>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        big_file_mb: Option<u64>,
        #[arg(long)]
        total_mb: Option<u64>,
        #[arg(long)]
        file_threshold: Option<u64>,
    },
    /// Replay an artifact onto a target directory.
    Restore {
        #[arg(long)]
        artifact: PathBuf,
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        password_env: Option<String>,
    },
    /// Print artifact metadata without touching item payloads.
    Info {
        #[arg(long)]
        artifact: PathBuf,
        #[arg(long)]
        password_env: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }
}

struct NdjsonProgressSink;

impl ProgressSink for NdjsonProgressSink {
    fn on_item(&self, progress: ItemProgress) {
        let line = serde_json::json!({
            "type": "item.progress",
            "phase": progress.phase,
            "path": progress.path,
            "rawBytes": progress.raw_bytes,
            "storedBytes": progress.stored_bytes,
            "durationMs": progress.duration_ms,
        });
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = std::env::var("STAGESNAP_LOG")
        .ok()
        .and_then(|v| tracing_subscriber::EnvFilter::try_new(v).ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.cmd {
        Command::Backup {
            root,
            mode,
            out,
            excludes,
            password_env,
            threads,
            big_file_mb,
            total_mb,
            file_threshold,
        } => {
            let mode = SourceMode::from_str(&mode).map_err(map_core_err)?;
            let password = resolve_password(password_env.as_deref())?;

            let mut tuning = Tuning::default();
            if let Some(threads) = threads {
                tuning.threads = threads;
            }
            if let Some(mb) = big_file_mb {
                tuning.big_file_bytes = mb * 1024 * 1024;
            }
            if let Some(mb) = total_mb {
                tuning.total_bytes_threshold = mb * 1024 * 1024;
            }
            if let Some(count) = file_threshold {
                tuning.item_count_threshold = count;
            }

            let config = CollectConfig {
                mode,
                root,
                excludes,
                tuning,
                output_path: Some(out.clone()),
            };

            let sink = NdjsonProgressSink;
            let options = CollectOptions {
                progress: if cli.events { Some(&sink) } else { None },
            };
            let backup = build_backup_with(config, options)
                .await
                .map_err(map_core_err)?;
            let report =
                write_artifact(&backup, &out, password.as_deref()).map_err(map_core_err)?;

            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "artifact": out.display().to_string(),
                        "items": backup.items.len(),
                        "sizeBytes": report.size_bytes,
                        "encrypted": password.is_some(),
                    })
                );
            } else {
                println!("artifact={}", out.display());
                println!(
                    "items={} sizeBytes={} encrypted={}",
                    backup.items.len(),
                    report.size_bytes,
                    password.is_some()
                );
            }
            Ok(())
        }
        Command::Restore {
            artifact,
            target,
            password_env,
        } => {
            let password = resolve_password(password_env.as_deref())?;
            let backup = load_backup(&artifact, password.as_deref()).map_err(map_core_err)?;

            let sink = NdjsonProgressSink;
            let options = RestoreOptions {
                progress: if cli.events { Some(&sink) } else { None },
            };
            let started = Instant::now();
            let result = restore_backup_with(&backup, &target, options).map_err(map_core_err)?;
            let duration_ms = started.elapsed().as_millis() as u64;

            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "target": target.display().to_string(),
                        "restored": result.restored,
                        "removed": result.removed,
                        "skipped": result.skipped,
                        "durationMs": duration_ms,
                    })
                );
            } else {
                println!("target={}", target.display());
                println!(
                    "restored={} removed={} skipped={} durationMs={duration_ms}",
                    result.restored, result.removed, result.skipped
                );
            }
            Ok(())
        }
        Command::Info {
            artifact,
            password_env,
        } => {
            let password = resolve_password(password_env.as_deref())?;
            let text = std::fs::read_to_string(&artifact)
                .map_err(|e| CliError::new("artifact.unreadable", e.to_string()))?;

            if is_encrypted_text(&text) && password.is_none() {
                if cli.json {
                    println!("{}", serde_json::json!({ "encrypted": true }));
                } else {
                    println!("encrypted=true (supply --password-env for details)");
                }
                return Ok(());
            }

            let backup =
                parse_backup_text(&text, password.as_deref()).map_err(map_core_err)?;
            let info = backup.info();
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string(&info)
                        .map_err(|e| CliError::new("info.encode_failed", e.to_string()))?
                );
            } else {
                println!("formatVersion={}", info.format_version);
                println!("createdAt={}", info.created_at);
                println!("sourceRoot={}", info.source_root);
                println!("head={}", info.head.as_deref().unwrap_or("-"));
                println!("payloadEncoding={}", info.payload_encoding);
                println!("sourceMode={}", info.source_mode);
                println!("excludes={}", info.excludes.join(","));
                println!("items={}", info.item_count);
                println!("encrypted={}", info.encrypted);
            }
            Ok(())
        }
    }
}

fn resolve_password(password_env: Option<&str>) -> Result<Option<String>, CliError> {
    match password_env {
        None => Ok(None),
        Some(name) => match std::env::var(name) {
            Ok(value) if !value.is_empty() => Ok(Some(value)),
            Ok(_) => Err(CliError::new(
                "config.invalid",
                format!("password environment variable {name} is empty"),
            )),
            Err(_) => Err(CliError::new(
                "config.invalid",
                format!("password environment variable {name} is not set"),
            )),
        },
    }
}

fn map_core_err(e: stagesnap_core::Error) -> CliError {
    match e {
        stagesnap_core::Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        stagesnap_core::Error::Format { message } => CliError::new("artifact.malformed", message),
        stagesnap_core::Error::Crypto { message } => CliError::new("artifact.crypto", message),
        stagesnap_core::Error::PathSafety { message } => CliError::new("restore.unsafe_path", message),
        stagesnap_core::Error::SourceAccess { message } => CliError::new("source.failed", message),
        other => CliError::new("io.failed", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"retryable\":false}".to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
