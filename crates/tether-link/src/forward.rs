//! Port forwarding from the desktop to a device.

use crate::{LinkError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Opens and closes a desktop-to-device TCP forward.
#[async_trait]
pub trait ForwardingProvider: Send + Sync {
    /// Forward `127.0.0.1:local_port` on the desktop to `remote_port` on the device.
    async fn open_forward(&self, local_port: u16, remote_port: u16, device_id: &str) -> Result<()>;

    /// Remove the forward bound to `local_port`.
    async fn close_forward(&self, local_port: u16) -> Result<()>;
}

/// [`ForwardingProvider`] backed by the `adb` command line tool.
///
/// Keeps track of the forwards it opened, per device, so they can be
/// removed on teardown.
pub struct AdbForwarder {
    program: OsString,

    /// Arguments placed before the adb arguments.
    leading_args: Vec<OsString>,

    /// device id -> [(local, remote)]
    forwards: Mutex<HashMap<String, Vec<(u16, u16)>>>,
}

impl AdbForwarder {
    pub fn new(adb_path: impl Into<OsString>) -> Self {
        Self {
            program: adb_path.into(),
            leading_args: Vec::new(),
            forwards: Mutex::new(HashMap::new()),
        }
    }

    /// Run a shell script in place of adb.
    #[cfg(test)]
    fn scripted(script: &std::path::Path) -> Self {
        Self {
            program: "sh".into(),
            leading_args: vec![script.as_os_str().to_owned()],
            forwards: Mutex::new(HashMap::new()),
        }
    }

    async fn run_adb(&self, args: &[String]) -> Result<()> {
        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LinkError::Spawn {
                program: self.program.to_string_lossy().into_owned(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LinkError::Forward(format!(
                "adb {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<(u16, u16)>>> {
        self.forwards.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn device_for(&self, local_port: u16) -> Option<String> {
        self.lock()
            .iter()
            .find(|(_, ports)| ports.iter().any(|(local, _)| *local == local_port))
            .map(|(device, _)| device.clone())
    }

    fn untrack(&self, local_port: u16) {
        let mut forwards = self.lock();
        for ports in forwards.values_mut() {
            ports.retain(|(local, _)| *local != local_port);
        }
        forwards.retain(|_, ports| !ports.is_empty());
    }

    /// Whether a forward opened by this instance is bound to `local_port`.
    pub fn has_forward(&self, local_port: u16) -> bool {
        self.device_for(local_port).is_some()
    }

    /// Forwards opened by this instance, as `(device, local, remote)`.
    pub fn tracked_forwards(&self) -> Vec<(String, u16, u16)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .flat_map(|(device, ports)| {
                ports
                    .iter()
                    .map(move |(local, remote)| (device.clone(), *local, *remote))
            })
            .collect();
        all.sort();
        all
    }

    /// Remove every forward this instance opened. Failures are logged and
    /// the forward is dropped from tracking either way.
    pub async fn close_all(&self) -> usize {
        let tracked = self.tracked_forwards();
        let count = tracked.len();
        for (_, local, _) in tracked {
            if let Err(e) = self.close_forward(local).await {
                warn!(local, error = %e, "Failed to remove forward");
                self.untrack(local);
            }
        }
        count
    }
}

#[async_trait]
impl ForwardingProvider for AdbForwarder {
    async fn open_forward(&self, local_port: u16, remote_port: u16, device_id: &str) -> Result<()> {
        let args = vec![
            "-s".to_string(),
            device_id.to_string(),
            "forward".to_string(),
            format!("tcp:{local_port}"),
            format!("tcp:{remote_port}"),
        ];
        self.run_adb(&args).await?;

        // A forward on the same local port replaces whatever adb had there.
        self.untrack(local_port);
        self.lock()
            .entry(device_id.to_string())
            .or_default()
            .push((local_port, remote_port));
        info!(device = device_id, local_port, remote_port, "Forward opened");
        Ok(())
    }

    async fn close_forward(&self, local_port: u16) -> Result<()> {
        let mut args = Vec::with_capacity(5);
        if let Some(device) = self.device_for(local_port) {
            args.push("-s".to_string());
            args.push(device);
        }
        args.push("forward".to_string());
        args.push("--remove".to_string());
        args.push(format!("tcp:{local_port}"));

        self.run_adb(&args).await?;
        self.untrack(local_port);
        debug!(local_port, "Forward removed");
        Ok(())
    }
}
