//! Binary entrypoint for the meshcore-gateway CLI.
//!
//! Commands:
//! - `start [--host <h>] [--port <p>]` - run the gateway until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `status` - print the persisted status values
//! - `call <method> [json-args]` - invoke a device method through a running gateway
//! - `methods` - list the methods the connected device exposes
//!
//! See the library crate docs for module-level details: `meshcore_gateway::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Duration;

use meshcore_gateway::config::Config;
use meshcore_gateway::control;
use meshcore_gateway::lifecycle::start_service;
use meshcore_gateway::meshcore::MeshCoreFactory;
use meshcore_gateway::status::{declared_fields, StatusStore};

#[derive(Parser)]
#[command(name = "meshcore-gateway")]
#[command(about = "Connection manager and RPC gateway for MeshCore companion radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Device host, overrides [meshcore] host
        #[arg(long)]
        host: Option<String>,

        /// Device TCP port, overrides [meshcore] port
        #[arg(short, long)]
        port: Option<i64>,
    },
    /// Write a default configuration file
    Init,
    /// Show the persisted status values
    Status,
    /// Invoke a device method on a running gateway
    Call {
        /// Method name, e.g. getContacts
        method: String,
        /// Positional arguments as a JSON array, e.g. '["node-1"]'
        args: Option<String>,
        /// Seconds to wait for the reply
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },
    /// List the methods exposed by the connected device
    Methods,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { host, port } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            if let Some(host) = host {
                config.meshcore.host = host;
            }
            if let Some(port) = port {
                config.meshcore.port = port;
            }
            info!("Starting meshcore-gateway v{}", env!("CARGO_PKG_VERSION"));
            run_gateway(config).await?;
        }
        Commands::Init => {
            info!("Writing default configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            let path = config.status.path();
            let entries = StatusStore::read_file(&path)?;
            println!("Status ({})", path.display());
            let labels: std::collections::HashMap<_, _> = declared_fields()
                .into_iter()
                .map(|f| (f.key, f.name))
                .collect();
            for (key, entry) in entries {
                println!(
                    "  {:<22} {}  ({})",
                    labels.get(key.as_str()).copied().unwrap_or(key.as_str()),
                    entry.value,
                    entry.ts.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        Commands::Call {
            method,
            args,
            timeout,
        } => {
            let config = pre_config.unwrap_or_default();
            let args: Value = match args {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| anyhow!("Arguments must be a JSON array: {}", e))?,
                None => json!([]),
            };
            if !args.is_array() {
                return Err(anyhow!("Arguments must be a JSON array"));
            }
            let response = control::request(
                &config.control.listen,
                control::CMD_RPC,
                json!({ "method": method, "args": args }),
                Duration::from_secs(timeout),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.get("ok") != Some(&Value::Bool(true)) {
                std::process::exit(1);
            }
        }
        Commands::Methods => {
            let config = pre_config.unwrap_or_default();
            let response = control::request(
                &config.control.listen,
                control::CMD_GET_METHODS,
                json!({}),
                Duration::from_secs(10),
            )
            .await?;
            match response.get("methods").and_then(Value::as_array) {
                Some(methods) => {
                    for m in methods.iter().filter_map(Value::as_str) {
                        println!("{}", m);
                    }
                }
                None => println!("{}", response),
            }
        }
    }

    Ok(())
}

async fn run_gateway(config: Config) -> Result<()> {
    let store = StatusStore::open(config.status.path()).await?;
    let factory = MeshCoreFactory::new(config.meshcore.client_options());
    let service = start_service(
        config.meshcore.connection_config(),
        Arc::new(factory),
        Arc::new(store.clone()),
    );

    let control_task = if config.control.enabled {
        let listener = control::bind(&config.control.listen).await?;
        Some(tokio::spawn(control::serve(listener, service.clone())))
    } else {
        info!("Control server disabled");
        None
    };

    let serve_result = async {
        match control_task {
            Some(task) => match task.await {
                Ok(res) => res,
                Err(e) => Err(anyhow!("Control server task failed: {}", e)),
            },
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        }
        res = serve_result => {
            if let Err(e) = res {
                error!("Control server stopped: {}", e);
            }
        }
    }

    service.shutdown().await;
    store.flush().await;
    info!("Gateway stopped");
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // Base level from CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .map(|cfg| cfg.logging.level_filter())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    match log_file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // When attached to a terminal, mirror file output to the console.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
