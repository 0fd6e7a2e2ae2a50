//! Device plug/unplug handling.
//!
//! A connected device means two resources are held: the port forward and the
//! relay listener. They are acquired forward-first and released relay-first so
//! the relay never accepts clients without a tunnel behind it.

use crate::{ForwardingProvider, LinkError, Result};
use std::sync::Arc;
use tether_relay::{RelayConfig, RelayManager, RelayStatus};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Device attach/detach notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(String),
    Disconnected(String),
}

/// Snapshot reported by [`ConnectionOrchestrator::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub connected: bool,
    pub device: Option<String>,
    pub relay: RelayStatus,
}

/// Couples a device forward with the relay lifecycle.
pub struct ConnectionOrchestrator<P> {
    relay: Arc<RelayManager>,
    provider: P,
    config: RelayConfig,
    device: Option<String>,
}

impl<P: ForwardingProvider> ConnectionOrchestrator<P> {
    pub fn new(relay: Arc<RelayManager>, provider: P, config: RelayConfig) -> Self {
        Self {
            relay,
            provider,
            config,
            device: None,
        }
    }

    /// Configuration used by the next `connect`.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Replace the configuration. Takes effect on the next `connect`.
    pub fn set_config(&mut self, config: RelayConfig) {
        self.config = config;
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Forward the tunnel port to `device_id` and start the relay.
    ///
    /// An existing link is torn down first. Returns the effective relay
    /// configuration.
    ///
    /// # Errors
    /// * `LinkError::NoDevice` - `device_id` is empty
    /// * `LinkError::Forward` / `LinkError::Spawn` - The forward could not be opened
    /// * `LinkError::Relay` - The relay failed to start; the forward is removed again
    pub async fn connect(&mut self, device_id: &str) -> Result<RelayConfig> {
        if device_id.is_empty() {
            return Err(LinkError::NoDevice);
        }
        if self.device.is_some() {
            self.disconnect().await?;
        }

        let config = self.config;
        self.provider
            .open_forward(config.tunnel_port, config.remote_port, device_id)
            .await?;

        match self.relay.start(config).await {
            Ok(effective) => {
                self.device = Some(device_id.to_string());
                info!(
                    device = device_id,
                    proxy = %effective.proxy_url(),
                    "Device linked"
                );
                Ok(effective)
            }
            Err(e) => {
                if let Err(close_err) = self.provider.close_forward(config.tunnel_port).await {
                    warn!(error = %close_err, "Failed to remove forward after relay start failure");
                }
                Err(e.into())
            }
        }
    }

    /// Stop the relay, then remove the forward. A no-op when not linked.
    ///
    /// # Errors
    /// Returns the provider error if the forward could not be removed. The
    /// orchestrator is unlinked either way.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        self.relay.stop().await?;
        self.provider.close_forward(self.config.tunnel_port).await?;
        info!(device = %device, "Device unlinked");
        Ok(())
    }

    /// Apply one device event.
    ///
    /// A `Connected` for the device already linked is ignored while the
    /// relay is running. A `Disconnected` for any other device is ignored.
    pub async fn handle_event(&mut self, event: DeviceEvent) -> Result<()> {
        match event {
            DeviceEvent::Connected(id) => {
                if self.device.as_deref() == Some(id.as_str()) && self.relay.is_running() {
                    return Ok(());
                }
                self.connect(&id).await.map(|_| ())
            }
            DeviceEvent::Disconnected(id) => {
                if self.device.as_deref() != Some(id.as_str()) {
                    return Ok(());
                }
                self.disconnect().await
            }
        }
    }

    /// Drive events until the channel closes, then unlink.
    ///
    /// Errors from individual events are logged and published on the relay
    /// event bus; they do not end the loop.
    pub async fn run(&mut self, mut events: mpsc::Receiver<DeviceEvent>) -> Result<()> {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(event).await {
                warn!(error = %e, "Device event failed");
                self.relay.events().publish(tether_relay::RelayEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        self.disconnect().await
    }

    pub fn status(&self) -> LinkStatus {
        let relay = self.relay.status();
        LinkStatus {
            connected: self.device.is_some() && relay.running,
            device: self.device.clone(),
            relay,
        }
    }
}
