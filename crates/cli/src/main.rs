//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: obsidion-bridge — End-to-end encrypted peer bridge over an untrusted relay.
//

//! Command-line peer: create or join a bridge and chat over stdin/stdout.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use obsidion_bridge::{create, join, Bridge, ConnectionConfig, CreateOptions, JoinOptions};

#[derive(Parser)]
#[command(name = "obsidion-bridge", version, about = "End-to-end encrypted peer bridge")]
struct Cli {
    /// Relay endpoint to rendezvous on
    #[arg(long, global = true, default_value = obsidion_bridge::DEFAULT_BRIDGE_URL)]
    bridge_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a bridge and print its connection string
    Create {
        /// Origin to declare to the relay (what the joiner will verify)
        #[arg(long, default_value = "nodejs")]
        origin: String,
    },
    /// Join a bridge from a connection string
    Join {
        /// The `obsidion:...` string printed by `create`
        connection_string: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let connection = ConnectionConfig {
        bridge_url: cli.bridge_url.clone(),
        ..Default::default()
    };

    let bridge = match cli.command {
        Command::Create { origin } => {
            let bridge = create(CreateOptions {
                origin: Some(origin),
                connection,
                ..Default::default()
            })?;
            println!("● Connection string: {}", bridge.connection_string());
            println!("  Share it with the joiner, then type messages below.");
            bridge
        }
        Command::Join { connection_string } => {
            let bridge = join(&connection_string, JoinOptions {
                connection,
                ..Default::default()
            })?;
            println!(
                "● Joining bridge {}…",
                &hex::encode(bridge.get_public_key())[..16]
            );
            bridge
        }
    };

    chat(bridge).await
}

/// Pump stdin lines out as secure messages and print whatever arrives.
async fn chat(bridge: Bridge) -> Result<()> {
    let _on_established = bridge.on_secure_channel_established(|| {
        println!("✔ Secure channel established");
    });
    let _on_message = bridge.on_secure_message(|method, params| {
        if method == "chat" {
            let text = params["text"].as_str().unwrap_or_default();
            println!("← {}", text);
        } else {
            println!("← [{}] {}", method, params);
        }
    });
    let _on_error = bridge.on_error(|message| {
        eprintln!("✖ {}", message);
    });
    let _on_disconnect = bridge.on_disconnect(|details| {
        if details.will_reconnect {
            eprintln!("… disconnected ({}), reconnecting", details.reason);
        } else {
            eprintln!("✖ disconnected: {}", details.reason);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if !bridge.send_message("chat", json!({ "text": line })).await {
            eprintln!("✖ not delivered (secure channel not ready?)");
        }
    }

    bridge.close().await;
    println!("● Bridge closed");
    Ok(())
}
