//! Console front end: wires the transports, state containers, and
//! coordinator together. Presentation only — reads the containers, never
//! writes them.

use anyhow::Result;
use session::coordinator::ProtocolCoordinator;
use session::log::ChatLog;
use session::status::SystemStatus;
use shared::settings::Settings;
use shared::types::Role;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use transport::channel::{ChannelConfig, CommandChannel, PersistentChannel};
use transport::chat::ChatExchange;

fn settings_from_env() -> Settings {
    let mut settings = Settings::default();
    if let Ok(base) = env::var("ASSISTANT_HTTP_URL") {
        settings.http_base = base;
    }
    if let Ok(url) = env::var("ASSISTANT_WS_URL") {
        settings.ws_url = url;
    }
    settings
}

fn print_new_messages(log: &ChatLog, printed: &mut usize) {
    for message in log.messages().iter().skip(*printed) {
        match message.role {
            // the user already sees their own input line
            Role::User => {}
            Role::Assistant => {
                let origin = message.origin.as_deref().unwrap_or("assistant");
                println!("[{}] {}", origin, message.content);
                for action in &message.actions {
                    let mark = if action.success { "ok" } else { "failed" };
                    println!(
                        "  - {} ({}){}",
                        action.tool,
                        mark,
                        action
                            .description
                            .as_deref()
                            .map(|d| format!(": {}", d))
                            .unwrap_or_default()
                    );
                }
            }
            Role::System => println!("[system] {}", message.content),
        }
        *printed += 1;
    }
}

fn print_status(status: &SystemStatus) {
    let connected = if status.connected() { "up" } else { "down" };
    println!("push channel: {}", connected);
    match status.stats() {
        Some(stats) => {
            println!(
                "cpu {:.0}% ({} cores) | mem {:.1}/{:.1} GB | disk {:.0}%",
                stats.cpu.percent,
                stats.cpu.cores,
                stats.memory.used_gb,
                stats.memory.total_gb,
                stats.disk.percent
            );
            if let Some(battery) = stats.battery {
                let plugged = if battery.plugged { "plugged" } else { "on battery" };
                println!("battery {:.0}% ({})", battery.percent, plugged);
            }
        }
        None => println!("no telemetry received yet"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = settings_from_env();

    let log = Arc::new(ChatLog::new());
    let status = Arc::new(SystemStatus::new());

    let exchange = Arc::new(ChatExchange::new(
        settings.http_base.clone(),
        settings.request_timeout(),
    )?);
    let (channel, events_rx) = PersistentChannel::new(
        &settings.ws_url,
        ChannelConfig {
            reconnect_attempts: settings.reconnect_attempts,
            ..ChannelConfig::default()
        },
    )?;
    let channel = Arc::new(channel);

    if let Err(e) = channel.connect().await {
        tracing::warn!("push channel unavailable: {}", e);
    }

    let coordinator = Arc::new(ProtocolCoordinator::new(
        Arc::clone(&log),
        Arc::clone(&status),
        exchange,
        Arc::clone(&channel) as Arc<dyn CommandChannel>,
        settings.history_window,
    ));

    let pump = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run_events(events_rx).await })
    };

    let printer = {
        let log = Arc::clone(&log);
        let mut changes = log.subscribe();
        tokio::spawn(async move {
            let mut printed = 0usize;
            while changes.changed().await.is_ok() {
                print_new_messages(&log, &mut printed);
            }
        })
    };

    println!("deskmate console — /status, /plugins, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        match text {
            "" => {}
            "/quit" => break,
            "/status" => print_status(&status),
            "/plugins" => match transport::plugins::fetch_plugins(&settings.http_base).await {
                Ok(plugins) => {
                    for plugin in plugins {
                        let state = if plugin.enabled { "enabled" } else { "disabled" };
                        println!("{} {} ({}) — {}", plugin.name, plugin.version, state, plugin.description);
                    }
                }
                Err(e) => println!("[system] plugin listing failed: {}", e),
            },
            _ => coordinator.submit(text).await,
        }
    }

    channel.disconnect().await;
    pump.abort();
    printer.abort();
    Ok(())
}
