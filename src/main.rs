//! BeamNet - RPC and publish/subscribe over a single socket
//!
//! Command line front end: run a demo server or act as a one-shot client.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use beamnet::config::{self, Config};
use beamnet::network::{Client, ClientEvent, Server, ServerEvent};
use beamnet::Payload;

/// BeamNet - lightweight RPC and pub/sub transport
#[derive(Parser)]
#[command(name = "beamnet")]
#[command(author = "BeamNet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Request/response, messages and topic pushes over one socket", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server with an `echo` request handler
    Serve {
        /// Endpoint to listen on (host:port or unix:/path)
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Topic to push a counter on
        #[arg(long, requires = "tick_ms")]
        tick_topic: Option<String>,

        /// Push interval in milliseconds
        #[arg(long, requires = "tick_topic")]
        tick_ms: Option<u64>,

        /// Log one-way messages on this topic (repeatable)
        #[arg(long = "log-topic")]
        log_topics: Vec<String>,
    },

    /// Send a one-way message
    Send {
        topic: String,
        payload: String,

        #[command(flatten)]
        target: Target,
    },

    /// Send a request and print the result
    Request {
        topic: String,
        payload: String,

        #[command(flatten)]
        target: Target,
    },

    /// Print pushes on a topic until Ctrl+C
    Subscribe {
        topic: String,

        #[command(flatten)]
        target: Target,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct Target {
    /// Endpoint to connect to (host:port or unix:/path)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Send the payload as text instead of trying JSON first
    #[arg(long)]
    text: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if let Ok(filter) = EnvFilter::try_from_default_env() {
        filter
    } else if let Some(directive) = &config.general.log_filter {
        EnvFilter::try_new(directive).with_context(|| format!("invalid log filter {:?}", directive))?
    } else if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve {
            endpoint,
            tick_topic,
            tick_ms,
            log_topics,
        } => {
            let tick = tick_topic.zip(tick_ms.map(Duration::from_millis));
            run_server(config, endpoint, tick, log_topics).await?;
        }
        Commands::Send { topic, payload, target } => {
            let client = connect(&config, &target).await?;
            client.send(&topic, parse_payload(&payload, target.text)).await?;
            client.close().await;
        }
        Commands::Request { topic, payload, target } => {
            let client = connect(&config, &target).await?;
            let result = client.request(&topic, parse_payload(&payload, target.text)).await;
            client.close().await;
            match result? {
                Some(payload) => println!("{}", display_payload(&payload)),
                None => println!("(no result)"),
            }
        }
        Commands::Subscribe { topic, target } => {
            run_subscriber(config, topic, target).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the demo server
async fn run_server(
    config: Config,
    endpoint: Option<String>,
    tick: Option<(String, Duration)>,
    log_topics: Vec<String>,
) -> anyhow::Result<()> {
    let options = config.server_options(endpoint.as_deref())?;
    let mut server = Server::new();
    let mut event_rx = server
        .take_event_receiver()
        .context("server event receiver already taken")?;

    server.on_request("echo", |payload| async move { Ok(payload) }).await;
    for topic in &log_topics {
        let name = topic.clone();
        server
            .on_message(topic.as_str(), move |payload| match payload {
                Some(payload) => println!("[{}] {}", name, display_payload(&payload)),
                None => println!("[{}] (empty)", name),
            })
            .await;
    }

    let local_addr = server.listen(&options).await?;

    println!("\n========================================");
    println!("  BeamNet Server Running");
    println!("========================================");
    println!("  Endpoint: {}", local_addr);
    if let Some((topic, interval)) = &tick {
        println!("  Pushing '{}' every {:?}", topic, interval);
    }
    println!("========================================");
    println!("Press Ctrl+C to stop.\n");

    let mut ticker = tick.as_ref().map(|(_, interval)| tokio::time::interval(*interval));
    let mut n: u64 = 0;

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ClientConnected { id, peer } => {
                        println!("+ Client connected: {} ({})", peer, id);
                    }
                    ServerEvent::ClientDisconnected { id, peer, reason } => {
                        println!("- Client disconnected: {} ({}) - {}", peer, id, reason);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    _ => {}
                }
            }
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some((topic, _)) = &tick {
                    n += 1;
                    let delivered = server.push(topic, json!({ "n": n })).await;
                    tracing::debug!("Pushed {} #{} to {} clients", topic, n, delivered);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Print pushes for one topic until interrupted
async fn run_subscriber(config: Config, topic: String, target: Target) -> anyhow::Result<()> {
    let mut client = connect(&config, &target).await?;
    let mut event_rx = client
        .take_event_receiver()
        .context("client event receiver already taken")?;

    let name = topic.clone();
    let subscription = client
        .subscribe(&topic, move |payload| match payload {
            Some(payload) => println!("[{}] {}", name, display_payload(&payload)),
            None => println!("[{}] (empty)", name),
        })
        .await?;
    println!("Subscribed to '{}'. Press Ctrl+C to stop.", topic);

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::Connected { peer } => tracing::info!("Connected to {}", peer),
                    ClientEvent::Disconnected { reason } => println!("Disconnected: {}", reason),
                    ClientEvent::ReconnectScheduled { attempt, delay } => {
                        tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt + 1);
                    }
                    ClientEvent::Error { message } => tracing::error!("Client error: {}", message),
                    ClientEvent::Closed => break,
                    ClientEvent::Connecting => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    if client.is_connected() {
        subscription.unsubscribe().await?;
    }
    client.close().await;
    Ok(())
}

async fn connect(config: &Config, target: &Target) -> anyhow::Result<Client> {
    let options = config.client_options(target.endpoint.as_deref())?;
    tracing::debug!("Connecting to {}", options.endpoint);
    let client = Client::new(options)?;
    client.connect().await?;
    Ok(client)
}

/// JSON when it parses, text otherwise
fn parse_payload(raw: &str, force_text: bool) -> Payload {
    if force_text {
        return Payload::from(raw);
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => Payload::from(value),
        Err(_) => Payload::from(raw),
    }
}

fn display_payload(payload: &Payload) -> String {
    match payload {
        Payload::Text(text) => text.clone(),
        Payload::Json(value) => value.to_string(),
        Payload::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["beamnet", "request", "sum", r#"{"a":2,"b":3}"#, "-e", "unix:/tmp/b.sock"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from(["beamnet", "serve", "--tick-topic", "tick"]);
        assert!(cli.is_err());

        let cli = Cli::try_parse_from(["beamnet", "serve", "--log-topic", "a", "--log-topic", "b"]).unwrap();
        match cli.command {
            Commands::Serve { log_topics, .. } => assert_eq!(log_topics, vec!["a", "b"]),
            _ => panic!("Wrong command"),
        }
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload("42", false), Payload::from(json!(42)));
        assert_eq!(parse_payload("hello", false), Payload::from("hello"));
        assert_eq!(parse_payload("42", true), Payload::from("42"));
    }
}
