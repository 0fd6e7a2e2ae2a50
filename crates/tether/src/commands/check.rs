use std::path::PathBuf;
use std::time::Duration;

use tether_link::{probe_tunnel, DEFAULT_PROBE_TIMEOUT};
use tether_relay::{Protocol, RelayConfig, RelayManager, DEFAULT_TUNNEL_PORT};
use tether_settings::{ConfigLoader, TetherConfig};

use crate::error::CliError;

pub async fn check(cwd: PathBuf) -> Result<(), CliError> {
    let mut all_ok = true;

    // 1. Platform info
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);

    // 2. Relay smoke-test, both protocols on an OS-assigned port
    for protocol in [Protocol::Socks5, Protocol::Http] {
        print!("Relay ({protocol}): ");
        let manager = RelayManager::new();
        let config = RelayConfig {
            listen_port: 0,
            ..RelayConfig::with_protocol(protocol)
        };
        match manager.start(config).await {
            Ok(_) => match manager.stop().await {
                Ok(()) => println!("OK"),
                Err(e) => {
                    println!("FAIL (stop): {e}");
                    all_ok = false;
                }
            },
            Err(e) => {
                println!("FAIL (start): {e}");
                all_ok = false;
            }
        }
    }

    // 3. Config
    let global_path = ConfigLoader::global_config_path();
    let project_path = ConfigLoader::project_config_path(&cwd);

    println!("\nConfig files:");
    if let Some(ref path) = global_path {
        let status = if path.exists() { "found" } else { "not found" };
        println!("  {} ({})", path.display(), status);
    } else {
        println!("  global: n/a (home directory not available)");
    }
    let status = if project_path.exists() { "found" } else { "not found" };
    println!("  {} ({})", project_path.display(), status);

    let config = match ConfigLoader::load(&cwd) {
        Ok(config) => {
            println!("Config loaded: OK");
            config
        }
        Err(e) => {
            println!("Config loaded: FAIL: {e}");
            all_ok = false;
            TetherConfig::default()
        }
    };

    // 4. Tunnel and adb. Informational: no device is a valid state.
    let tunnel_port = config.relay.tunnel_port.unwrap_or(DEFAULT_TUNNEL_PORT);
    let probe_timeout = config
        .link
        .probe_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT);
    let reachable = probe_tunnel(tunnel_port, probe_timeout).await;
    println!(
        "\nTunnel 127.0.0.1:{tunnel_port}: {}",
        if reachable { "reachable" } else { "not reachable" }
    );

    let adb = config.link.adb_path.as_deref().unwrap_or("adb");
    let adb_found = tokio::process::Command::new(adb)
        .arg("version")
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false);
    println!(
        "adb ({adb}): {}",
        if adb_found { "found" } else { "not found (needed for --device)" }
    );

    if !all_ok {
        return Err(CliError::Other("One or more checks failed".to_string()));
    }

    Ok(())
}
