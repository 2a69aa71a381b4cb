//! 🚀 fcx-cli: the front door, the bouncer, the maitre d' of fcx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Loads config, sets up logging, feeds triggers to the service, prints the stats.
//! Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// 🎛️ Push entity records from the metadata graph into the search index.
#[derive(Debug, Parser)]
#[command(name = "fcx", version)]
struct Cli {
    /// TOML config file. Env vars (FCX_*) are layered underneath.
    #[arg(short, long, default_value = "fcx.toml")]
    config: PathBuf,

    /// File with one trigger per line: `*` or an entity id.
    #[arg(long)]
    ids_file: Option<PathBuf>,

    /// Triggers: `*` rebuilds everything, anything else is an entity id.
    triggers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 because println! debugging is a lifestyle choice we're trying to move past
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // 🔒 Validate the config file exists before we get too emotionally attached
    let config_file = cli.config.as_path();
    let config_file_if_it_exists = match config_file.try_exists().with_context(|| {
        format!(
            "💀 Couldn't check whether the configuration file exists. Maybe it's a pwd/cwd thing \
             with relative paths; use an absolute path to be absolutely certain. Was checking here: '{}'",
            config_file.display()
        )
    })? {
        true => Some(config_file),
        false => {
            warn!(
                "⚠️ '{}' not found, configuring from FCX_* environment variables only",
                config_file.display()
            );
            None
        }
    };

    let app_config = fcx::app_config::load_config(config_file_if_it_exists).context(
        "💀 In fcx-cli, main, we couldn't load the config. Take a look at the file and the FCX_* \
         variables, make sure you didn't forget something obvious",
    )?;

    let mut triggers = Vec::new();
    if let Some(path) = &cli.ids_file {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("💀 Failed to read ids file '{}'", path.display()))?;
        triggers.extend(contents.lines().map(str::to_string));
    }
    triggers.extend(cli.triggers);
    if triggers.is_empty() {
        warn!("🤷 no triggers given, nothing to do. Pass `*` or an entity id.");
    }

    let shutdown = async {
        // -- if the signal handler can't be installed, just never fire
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let result = fcx::run(app_config, triggers, shutdown).await;

    match result {
        Ok(report) => {
            let artifact = report.stats.to_json();
            println!(
                "{}",
                serde_json::to_string_pretty(&artifact).unwrap_or_else(|_| artifact.to_string())
            );
            println!("{}", fcx::progress::render_stats_table(&report.stats));

            for (trigger, reason) in &report.failures {
                error!("💀 trigger '{trigger}' failed: {reason}");
            }
            if !report.unclean_workers.is_empty() {
                warn!(
                    workers = ?report.unclean_workers,
                    "🔪 some workers had to be aborted on shutdown"
                );
            }
            if !report.failures.is_empty() || report.interrupted {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion of sadness, one tear-jerking layer at a time
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                let cause_str = cause.to_string();
                if cause_str.contains("error sending request")
                    || cause_str.contains("connection refused")
                    || cause_str.contains("Connection refused")
                    || cause_str.contains("tcp connect error")
                    || cause_str.contains("dns error")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }

            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: looks like a service isn't reachable. \
                    Double-check that Elasticsearch and the metadata graph are actually running. \
                    If you're using Docker, `docker ps` shows what's up. ☕"
                );
            }

            std::process::exit(1);
        }
    }
}
