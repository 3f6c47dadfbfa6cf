// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bluelink terminal
//!
//! Scans for devices, optionally connects to the configured address and
//! bridges stdin lines to the link.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluelink::bluetooth::{create_backend, LinkEvent, LinkManager, LinkSettings};
use bluelink::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bluelink=info".parse()?),
        )
        .init();

    info!("Starting Bluelink v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    let backend = create_backend(&config).await?;
    let manager = Arc::new(LinkManager::new(backend, LinkSettings::from(&config.link)));
    info!("Using {} backend", manager.backend_name());

    // Log link events
    if let Some(mut events) = manager.take_event_receiver() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LinkEvent::DiscoveryFinished { devices } => {
                        info!("Scan complete, {} devices", devices.len());
                    }
                    LinkEvent::ConnectFailed { address, reason } => {
                        warn!("Could not connect to {}: {}", address, reason);
                    }
                    other => info!("Link event: {:?}", other),
                }
            }
        });
    }

    manager.init().await?;

    manager.start_discovery()?;
    while manager.is_discovering() {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                manager.shutdown();
                return Ok(());
            }
        }
    }

    for device in manager.available_devices()? {
        info!("Found {}", device);
    }

    let target = config.link.auto_connect.trim();
    if target.is_empty() {
        info!("No auto_connect address configured, exiting");
        manager.shutdown();
        return Ok(());
    }

    if !manager
        .connect(target, Some(config.link.auto_connect_pin.as_str()))
        .await?
    {
        error!("Failed to connect to {}", target);
        manager.shutdown();
        return Ok(());
    }
    info!("Connected to {}", manager.connected_device()?);

    let mut reader = {
        let manager = manager.clone();
        tokio::spawn(async move {
            loop {
                match manager.read_line().await {
                    Ok(line) => info!("< {}", line),
                    Err(e) => {
                        info!("Reader stopped: {}", e);
                        break;
                    }
                }
            }
        })
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    let mut data = line.into_bytes();
                    data.extend_from_slice(&manager.settings().line_delimiter);
                    match manager.send(&data).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            error!("Send failed: {}", e);
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin error: {}", e);
                    break;
                }
            },
            _ = &mut reader => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    manager.stop()?;
    manager.shutdown();
    info!("Bluelink stopped");
    Ok(())
}
