//! dockshell CLI - Command-line client for the dockshell orchestrator
//!
//! Opens interactive container shells and inspects live sessions

use std::io::{BufRead, BufReader, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::{SinkExt, StreamExt};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// dockshell CLI - interactive shells in throwaway containers
#[derive(Parser)]
#[command(name = "dockshell")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for dockshell - on-demand container shells", long_about = None)]
struct Cli {
    /// dockshell API URL
    #[arg(short, long, default_value = "http://127.0.0.1:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an interactive shell in a fresh container (type `exit` or send EOF to leave)
    Shell,

    /// List live connections and their sessions
    Sessions,

    /// Show the status of one connection's session
    Status {
        /// Connection ID as reported by `sessions`
        connection_id: String,
    },

    /// Get server health status
    Health,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_connections: u64,
    runtime_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionSummary {
    connection_id: String,
    container_name: String,
    state: String,
    status: String,
    container_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionListResponse {
    sessions: Vec<SessionSummary>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    connection_id: String,
    session_id: String,
    status: String,
    state: String,
    container_id: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::Shell => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            let lines = spawn_line_reader(BufReader::new(std::io::stdin()));
            let result = runtime.block_on(run_shell(&websocket_url(&cli.api_url), lines));
            // The stdin thread may still be blocked in read; do not wait for it
            runtime.shutdown_background();
            result?;
        }

        Commands::Sessions => {
            let response = client
                .get(format!("{}/api/v1/sessions", cli.api_url))
                .send()
                .context("Failed to list sessions")?;

            if !response.status().is_success() {
                anyhow::bail!("Session list failed: {}", response.status());
            }

            let list: SessionListResponse = response.json().context("Failed to parse response")?;

            println!("{} {}", "Live connections:".bright_cyan().bold(), list.total);
            for session in list.sessions {
                println!(
                    "  {} {} [{}] {}",
                    session.connection_id,
                    session.container_name.dimmed(),
                    colorize_state(&session.state),
                    session.container_id.as_deref().unwrap_or("-")
                );
                println!("    {}", session.status);
            }
        }

        Commands::Status { connection_id } => {
            let response = client
                .get(format!(
                    "{}/api/v1/sessions/{}/status",
                    cli.api_url, connection_id
                ))
                .send()
                .context("Failed to get status")?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                anyhow::bail!("No such connection: {}", connection_id);
            }
            if !response.status().is_success() {
                let error_text = response.text().unwrap_or_else(|_| "Unknown error".to_string());
                anyhow::bail!("Status request failed: {}", error_text);
            }

            let status: StatusResponse = response.json().context("Failed to parse response")?;

            println!("{} {}", "Connection:".cyan(), status.connection_id);
            println!("{} {}", "Session:".cyan(), status.session_id);
            println!("{} {}", "State:".cyan(), colorize_state(&status.state));
            println!("{} {}", "Status:".cyan(), status.status);
            println!(
                "{} {}",
                "Container:".cyan(),
                status.container_id.as_deref().unwrap_or("-")
            );
        }

        Commands::Health => {
            let response = client
                .get(format!("{}/health", cli.api_url))
                .send()
                .context("Failed to get health")?;

            if !response.status().is_success() {
                anyhow::bail!("Health check failed: {}", response.status());
            }

            let health: HealthResponse = response.json().context("Failed to parse response")?;

            println!("{}", "dockshell Orchestrator Status".bright_cyan().bold());
            println!("{}", "=".repeat(40).bright_blue());
            println!("{} {}", "Status:".cyan(),
                if health.status == "healthy" {
                    health.status.green()
                } else {
                    health.status.yellow()
                }
            );
            println!("{} {}", "Version:".cyan(), health.version);
            println!("{} {}s", "Uptime:".cyan(), health.uptime_seconds);
            println!("{} {}", "Active Connections:".cyan(), health.active_connections);
            println!(
                "{} {}",
                "Runtime:".cyan(),
                health.runtime_version.as_deref().unwrap_or("unreachable")
            );
        }
    }

    Ok(())
}

/// Map the HTTP API URL onto the WebSocket endpoint
fn websocket_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws", base)
}

fn colorize_state(state: &str) -> colored::ColoredString {
    match state {
        "streaming" => state.green(),
        "failed" => state.red(),
        "stopped" | "stopping" => state.yellow(),
        _ => state.normal(),
    }
}

/// Read lines on a dedicated thread; the channel closes at EOF or on a read error
fn spawn_line_reader<R: BufRead + Send + 'static>(reader: R) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Interactive session: input lines go to the shell, output is printed as it arrives
async fn run_shell(url: &str, mut lines: mpsc::Receiver<String>) -> Result<()> {
    let (socket, _) = connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    let (mut sink, mut stream) = socket.split();

    sink.send(Message::Text(json!({"event": "start-session"}).to_string()))
        .await
        .context("Failed to start session")?;

    let mut printer = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let Ok(event) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            print_event(&event);
        }
    });

    loop {
        tokio::select! {
            line = lines.recv() => {
                let line = match line {
                    Some(line) if line.trim() != "exit" => line,
                    _ => break,
                };

                let frame = json!({"event": "client-input", "data": line}).to_string();
                if sink.send(Message::Text(frame)).await.is_err() {
                    eprintln!("{}", "Connection lost".red());
                    break;
                }
            }
            _ = &mut printer => {
                eprintln!("{}", "Server closed the connection".yellow());
                return Ok(());
            }
        }
    }

    // Closing the socket stops and removes the container
    let _ = sink.send(Message::Close(None)).await;
    printer.abort();
    eprintln!("{}", "Session closed".bright_blue());

    Ok(())
}

fn print_event(event: &Value) {
    match event["event"].as_str() {
        Some("terminal-output") => {
            let data = event["data"].as_str().unwrap_or_default();
            if event["stream"] == "stderr" {
                eprint!("{}", data.red());
                let _ = std::io::stderr().flush();
            } else {
                print!("{}", data);
                let _ = std::io::stdout().flush();
            }
        }
        Some("status") => {
            let status = event["status"].as_str().unwrap_or_default();
            eprintln!("{} {}", "*".bright_blue(), status.bright_cyan());
        }
        Some("connected") => {
            let id = event["connection_id"].as_str().unwrap_or("?");
            eprintln!("{} {}", "Connected:".bright_cyan(), id);
        }
        Some("error") => {
            let message = event["message"].as_str().unwrap_or("unknown error");
            eprintln!("{} {}", "Error:".red().bold(), message);
        }
        _ => {}
    }
}
