use clap::{Parser, Subcommand};
use lib::client::GatewayClient;
use lib::events::{EventListener, ListenerStatus};
use lib::protocol::{GatewayEvent, ResponseStatus};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "gatewire")]
#[command(about = "Gatewire CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Print the gateway's server info.
    Info {
        /// Config file path (default: GATEWIRE_CONFIG_PATH or ~/.gatewire/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Query the admin interface instead of the public one
        #[arg(long)]
        admin: bool,
    },

    /// Create a session and print its id.
    Create {
        /// Config file path (default: GATEWIRE_CONFIG_PATH or ~/.gatewire/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Destroy a session.
    Destroy {
        /// Config file path (default: GATEWIRE_CONFIG_PATH or ~/.gatewire/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Session id as printed by `create`
        session: u64,
    },

    /// Send an arbitrary command and print the reply.
    Send {
        /// Config file path (default: GATEWIRE_CONFIG_PATH or ~/.gatewire/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Method name (e.g. create, info, keepalive)
        method: String,

        /// JSON object merged into the request payload
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,

        /// Send on the admin interface instead of the public one
        #[arg(long)]
        admin: bool,

        /// Override the configured round-trip timeout
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Stream gateway events until Ctrl+C.
    Listen {
        /// Config file path (default: GATEWIRE_CONFIG_PATH or ~/.gatewire/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Event-kind prefix filter (empty = all events)
        #[arg(long, default_value = "")]
        filter: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("gatewire {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Info { config, admin }) => {
            if let Err(e) = run_info(config, admin).await {
                log::error!("info failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Create { config }) => {
            if let Err(e) = run_create(config).await {
                log::error!("create failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Destroy { config, session }) => {
            if let Err(e) = run_destroy(config, session).await {
                log::error!("destroy failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Send {
            config,
            method,
            payload,
            admin,
            timeout_ms,
        }) => {
            if let Err(e) = run_send(config, method, payload, admin, timeout_ms).await {
                log::error!("send failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Listen { config, filter }) => {
            if let Err(e) = run_listen(config, filter).await {
                log::error!("listen failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn client_for(config_path: Option<PathBuf>, admin: bool) -> anyhow::Result<GatewayClient> {
    let (config, _) = lib::config::load_config(config_path)?;
    let client = if admin {
        GatewayClient::connect_admin(&config).await?
    } else {
        GatewayClient::connect(&config).await?
    };
    Ok(client)
}

async fn run_info(config_path: Option<PathBuf>, admin: bool) -> anyhow::Result<()> {
    let client = client_for(config_path, admin).await?;
    let info = client.server_info().await?;
    println!("{}", serde_json::to_string_pretty(&Value::Object(info))?);
    Ok(())
}

async fn run_create(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let client = client_for(config_path, false).await?;
    let id = client.create_session().await?;
    println!("{}", id);
    Ok(())
}

async fn run_destroy(config_path: Option<PathBuf>, session: u64) -> anyhow::Result<()> {
    let client = client_for(config_path, false).await?;
    client.destroy_session(session).await?;
    println!("session {} destroyed", session);
    Ok(())
}

async fn run_send(
    config_path: Option<PathBuf>,
    method: String,
    payload: Option<String>,
    admin: bool,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let payload = match payload {
        Some(text) => match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => map,
            _ => anyhow::bail!("--payload must be a JSON object"),
        },
        None => serde_json::Map::new(),
    };

    let client = client_for(config_path, admin).await?;
    let response = match timeout_ms {
        Some(ms) => {
            client
                .send_with_timeout(&method, payload, Duration::from_millis(ms))
                .await?
        }
        None => client.send(&method, payload).await?,
    };

    match response.status {
        ResponseStatus::Success => {
            println!(
                "{}",
                serde_json::to_string_pretty(&Value::Object(response.payload))?
            );
        }
        ResponseStatus::Ack => {
            println!("ack");
        }
        ResponseStatus::Error => {
            let descriptor = response.error.map(|e| format!("{} (code {})", e.reason, e.code));
            anyhow::bail!(
                "gateway error: {}",
                descriptor.unwrap_or_else(|| "unspecified".to_string())
            );
        }
    }
    Ok(())
}

fn print_event(event: &GatewayEvent) {
    let session = event
        .session_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let handle = event
        .handle_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let payload = serde_json::to_string(&Value::Object(event.payload.clone()))
        .unwrap_or_else(|_| "{}".to_string());
    println!(
        "{} [{}] session={} handle={} {}",
        event.received_at.to_rfc3339(),
        event.kind,
        session,
        handle,
        payload
    );
}

async fn run_listen(config_path: Option<PathBuf>, filter: String) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let listener = EventListener::from_config(&config);
    let handle = listener.start(&filter).await?;
    let mut events = handle.subscribe();
    let mut status = handle.status();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("stopping listener");
                handle.stop();
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("lagged behind, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = status.changed() => {
                if let ListenerStatus::Stopped { error } = status.borrow().clone() {
                    if let Some(reason) = error {
                        log::error!("listener stopped: {}", reason);
                    }
                    break;
                }
            }
        }
    }

    handle.join().await;
    println!("stopped");
    Ok(())
}
