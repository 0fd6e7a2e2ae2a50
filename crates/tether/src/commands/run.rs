use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tether_link::{probe_tunnel, AdbForwarder, ConnectionOrchestrator, DEFAULT_PROBE_TIMEOUT};
use tether_relay::{
    Protocol, RelayConfig, RelayEvent, RelayManager, Subscription, UpstreamHandshake,
};
use tether_settings::{ConfigLoader, HandshakeSetting, ProtocolSetting, RelaySettings, TetherConfig};

use crate::cli::{ProtocolArg, RunArgs};
use crate::error::CliError;

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // --no-config skips global/project files but --config <extra> still applies.
    let mut config = if args.no_config {
        TetherConfig::default()
    } else {
        ConfigLoader::load(&cwd)?
    };
    if let Some(ref extra) = args.extra_config {
        config = config.merge(TetherConfig::load(extra)?);
    }

    let relay_config = build_relay_config(&config.relay, &args);
    let device = args.device.clone().or_else(|| config.link.device.clone());
    let manager = Arc::new(RelayManager::new());
    let events = manager.subscribe();

    match device {
        Some(device) => {
            let adb_path = config.link.adb_path.as_deref().unwrap_or("adb");
            let mut link = ConnectionOrchestrator::new(
                Arc::clone(&manager),
                AdbForwarder::new(adb_path),
                relay_config,
            );
            let effective = link.connect(&device).await?;
            announce(&effective, Some(&device));

            let result = wait_for_interrupt(events).await;
            link.disconnect().await?;
            result
        }
        None => {
            let effective = manager.start(relay_config).await?;
            let probe_timeout = config
                .link
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT);
            if !probe_tunnel(effective.tunnel_port, probe_timeout).await {
                eprintln!(
                    "tether: nothing is listening on {}; forward it with `adb forward tcp:{} tcp:{}` or pass --device",
                    effective.tunnel_addr(),
                    effective.tunnel_port,
                    effective.remote_port
                );
            }
            announce(&effective, None);

            let result = wait_for_interrupt(events).await;
            manager.stop().await?;
            result
        }
    }
}

/// Settings first, then flags on top.
fn build_relay_config(settings: &RelaySettings, args: &RunArgs) -> RelayConfig {
    let mut config = RelayConfig::default();

    if let Some(port) = settings.listen_port {
        config.listen_port = port;
    }
    if let Some(port) = settings.tunnel_port {
        config.tunnel_port = port;
    }
    if let Some(port) = settings.remote_port {
        config.remote_port = port;
    }
    if let Some(protocol) = settings.protocol {
        config.protocol = match protocol {
            ProtocolSetting::Socks5 => Protocol::Socks5,
            ProtocolSetting::Http => Protocol::Http,
        };
    }
    if let Some(secs) = settings.handshake_timeout_secs {
        config.handshake_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = settings.header_timeout_secs {
        config.header_timeout = Duration::from_secs(secs);
    }
    if let Some(mode) = settings.upstream_handshake {
        config.upstream_handshake = match mode {
            HandshakeSetting::Direct => UpstreamHandshake::Direct,
            HandshakeSetting::Negotiate => UpstreamHandshake::Negotiate,
        };
    }

    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if let Some(port) = args.tunnel_port {
        config.tunnel_port = port;
    }
    if let Some(port) = args.remote_port {
        config.remote_port = port;
    }
    if let Some(protocol) = args.protocol {
        config.protocol = match protocol {
            ProtocolArg::Socks5 => Protocol::Socks5,
            ProtocolArg::Http => Protocol::Http,
        };
    }
    if args.negotiate {
        config.upstream_handshake = UpstreamHandshake::Negotiate;
    }

    config
}

fn announce(config: &RelayConfig, device: Option<&str>) {
    if let Some(device) = device {
        println!("Linked device {device} (tunnel {} -> remote {})", config.tunnel_port, config.remote_port);
    }
    println!("Proxy: {}", config.proxy_url());
    println!("Press Ctrl-C to stop.");
}

async fn wait_for_interrupt(mut events: Subscription) -> Result<(), CliError> {
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                return Ok(());
            }
            Some(event) = events.recv() => match event {
                RelayEvent::Connection { host, port } => {
                    tracing::info!(%host, port, "Proxied connection");
                }
                RelayEvent::Error { message } => eprintln!("tether: {message}"),
                RelayEvent::Started { .. } | RelayEvent::Stopped => {}
            },
        }
    }
}
