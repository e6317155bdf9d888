//! 🚀 dmx-cli — the front door, the bouncer, the maitre d' of dmx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that parses flags, loads config, sets up
//! logging, wires Ctrl-C to the shutdown token, and then lets the library do the heavy lifting.
//! Like a manager. 🦆

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use dmx::app_config::{ConfigOverrides, load_config};
use dmx::convergence::Shutdown;
use dmx::errors::PipelineError;
use dmx::progress::summary_table;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

// 🔧 default: the ol' reliable, used only if it exists next to you
const DEFAULT_CONFIG_FILE: &str = "dmx.toml";

/// 📥 Load a dated, pipe-delimited file into a search index, merging by date.
#[derive(Debug, Parser)]
#[command(name = "dmx", version, about)]
struct Args {
    /// TOML configuration file. Defaults to ./dmx.toml when it exists.
    #[arg(short, long, env = "DMX_CONFIG")]
    config: Option<PathBuf>,

    /// Document type to load (overrides pipeline.doc_type).
    #[arg(long = "type-doc", alias = "type_doc")]
    type_doc: Option<String>,

    /// Source file to load (overrides source.file_name).
    #[arg(long = "source-file", alias = "source_file")]
    source_file: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    debug: bool,
}

/// 🚀 main() — where it all begins. The "I pressed enter and held my breath" moment.
///
/// 🔧 Steps:
/// 1. Parse args
/// 2. Init tracing (so we can see what goes wrong, and when)
/// 3. Load config (the moment of truth)
/// 4. Run the thing (send it and pray 🙏)
/// 5. Print the scoreboard, exit 0 / 1 / 2
#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // 📡 RUST_LOG wins; otherwise --debug picks the default level
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion of sadness, one layer at a time
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
            }
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let config_file = resolve_config_file(args.config.as_deref())?;
    let overrides = ConfigOverrides {
        doc_type: args.type_doc,
        source_file: args.source_file,
    };
    let app_config = load_config(config_file.as_deref(), &overrides).context(
        "💀 In dmx-cli, we couldn't load the configuration. Take a look at the file and the DMX_* \
         variables, and make sure you didn't forget something obvious.",
    )?;

    let shutdown = Shutdown::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl-C received, draining the current batch and stopping");
            on_ctrl_c.trigger();
        }
    });

    let summary = dmx::run(app_config, shutdown).await;
    println!("{}", summary_table(&summary));

    match &summary.fatal {
        Some(PipelineError::Connection(_)) => {
            // -- 📡 if it smells like a connection problem, it's probably a connection problem
            error!(
                "🔧 hint: looks like the store isn't reachable. Double-check that Elasticsearch is \
                 actually running and that store.url (or host/port) points at it. If you're using \
                 Docker, `docker ps` is a good first step. ☕"
            );
        }
        Some(PipelineError::Store(_)) => {
            error!(
                "🔧 hint: the store is there but turned us away. A 401/403 means store.username / \
                 store.password (or store.api_key) need another look."
            );
        }
        _ => {}
    }
    Ok(summary.exit_code().clamp(0, 255) as u8)
}

/// 🔒 An explicit `--config` must exist. Without one, `./dmx.toml` is used if it is there.
fn resolve_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) => {
            let exists = path.try_exists().with_context(|| {
                format!("💀 Couldn't check whether '{}' exists.", path.display())
            })?;
            if !exists {
                anyhow::bail!(
                    "💀 Configuration file '{}' does not exist. If it's a relative path, it's \
                     relative to the current directory; an absolute path removes all doubt.",
                    path.display()
                );
            }
            Ok(Some(path.to_path_buf()))
        }
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            Ok(fallback
                .try_exists()
                .unwrap_or(false)
                .then(|| fallback.to_path_buf()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_the_old_flag_spellings_still_work() {
        let args = Args::try_parse_from([
            "dmx",
            "--type_doc=crypto",
            "--source_file",
            "upload/crypto.txt",
            "--debug",
        ])
        .expect("💀 legacy flag names should parse");
        assert_eq!(args.type_doc.as_deref(), Some("crypto"));
        assert_eq!(args.source_file.as_deref(), Some("upload/crypto.txt"));
        assert!(args.debug);
    }

    #[test]
    fn the_one_where_a_missing_config_file_is_called_out() {
        let err = resolve_config_file(Some(Path::new("/definitely/not/dmx.toml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
