//! Relay lifecycle owner.
//!
//! At most one listener exists per manager. `start` on a running manager
//! restarts it with the new configuration; `stop` is idempotent. Calls are
//! serialized, so overlapping starts resolve in call order and never leave
//! two listeners bound.

use crate::{EventBus, Protocol, RelayConfig, RelayEvent, RelayHandle, RelayServer, Result, Subscription};
use std::sync::Mutex;
use tracing::{error, info};

/// Lifecycle phase of a [`RelayManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Snapshot reported by [`RelayManager::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub running: bool,
    pub state: RelayState,
    pub listen_port: u16,
    pub tunnel_port: u16,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub proxy_url: String,
}

struct Snapshot {
    state: RelayState,
    config: RelayConfig,
}

pub struct RelayManager {
    /// Running listener. The async lock serializes start/stop.
    active: tokio::sync::Mutex<Option<RelayHandle>>,

    /// Readable without awaiting.
    snapshot: Mutex<Snapshot>,

    events: EventBus,
}

impl RelayManager {
    /// Stopped manager reporting the default configuration.
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    /// Stopped manager reporting `config` until the first start.
    pub fn with_config(config: RelayConfig) -> Self {
        Self {
            active: tokio::sync::Mutex::new(None),
            snapshot: Mutex::new(Snapshot {
                state: RelayState::Stopped,
                config,
            }),
            events: EventBus::new(),
        }
    }

    /// Start the relay, stopping any running instance first.
    ///
    /// Returns the effective configuration; `listen_port` is the bound port
    /// even when `0` was requested.
    ///
    /// # Errors
    /// * `RelayError::Bind` - The listen port is unavailable. The manager is
    ///   left stopped.
    pub async fn start(&self, config: RelayConfig) -> Result<RelayConfig> {
        let mut active = self.active.lock().await;
        if let Some(handle) = active.take() {
            self.shutdown(handle).await?;
        }

        self.set_snapshot(RelayState::Starting, Some(config));
        match RelayServer::new(config, self.events.clone()).start().await {
            Ok(handle) => {
                let effective = *handle.config();
                *active = Some(handle);
                self.set_snapshot(RelayState::Running, Some(effective));
                info!(
                    port = effective.listen_port,
                    protocol = %effective.protocol,
                    "Relay started"
                );
                self.events.publish(RelayEvent::Started {
                    port: effective.listen_port,
                    protocol: effective.protocol,
                });
                Ok(effective)
            }
            Err(e) => {
                self.set_snapshot(RelayState::Stopped, None);
                error!(error = %e, "Relay failed to start");
                self.events.publish(RelayEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Stop the relay. A no-op when already stopped.
    ///
    /// When this returns the listen port is free and every connection of the
    /// run has been closed.
    pub async fn stop(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(handle) => self.shutdown(handle).await,
            None => Ok(()),
        }
    }

    async fn shutdown(&self, handle: RelayHandle) -> Result<()> {
        self.set_snapshot(RelayState::Stopping, None);
        let result = handle.shutdown().await;
        self.set_snapshot(RelayState::Stopped, None);
        info!("Relay stopped");
        self.events.publish(RelayEvent::Stopped);
        result
    }

    fn set_snapshot(&self, state: RelayState, config: Option<RelayConfig>) {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        snapshot.state = state;
        if let Some(config) = config {
            snapshot.config = config;
        }
    }

    pub fn state(&self) -> RelayState {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == RelayState::Running
    }

    /// Last configuration started (or attempted).
    pub fn config(&self) -> RelayConfig {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).config
    }

    /// Proxy URL for the current configuration, e.g. `socks5://127.0.0.1:7890`.
    pub fn proxy_url(&self) -> String {
        self.config().proxy_url()
    }

    pub fn status(&self) -> RelayStatus {
        let (state, config) = {
            let snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
            (snapshot.state, snapshot.config)
        };
        RelayStatus {
            running: state == RelayState::Running,
            state,
            listen_port: config.listen_port,
            tunnel_port: config.tunnel_port,
            remote_port: config.remote_port,
            protocol: config.protocol,
            proxy_url: config.proxy_url(),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

impl Default for RelayManager {
    fn default() -> Self {
        Self::new()
    }
}
