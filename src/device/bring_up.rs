//! Host-side GPIB bring-up run once before the bridge is first opened
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::sleep;

use super::{DeviceError, Result};

#[async_trait::async_trait]
pub trait BusBringUp: Send + Sync {
    async fn ensure_bus_ready(&self) -> Result<()>;
}

/// For hosts where the bus is already up
pub struct NoopBringUp;

#[async_trait::async_trait]
impl BusBringUp for NoopBringUp {
    async fn ensure_bus_ready(&self) -> Result<()> {
        Ok(())
    }
}

/// Reload udev rules, wait for the GPIB device node, then run `gpib_config`
#[derive(Debug, Clone)]
pub struct UdevBringUp {
    pub udevadm: String,
    pub gpib_config: String,
    pub device_node: PathBuf,
    pub wait_attempts: u32,
    pub wait_interval: Duration,
}

impl Default for UdevBringUp {
    fn default() -> Self {
        Self {
            udevadm: "udevadm".to_string(),
            gpib_config: "gpib_config".to_string(),
            device_node: PathBuf::from("/dev/gpib0"),
            wait_attempts: 10,
            wait_interval: Duration::from_secs(1),
        }
    }
}

impl UdevBringUp {
    async fn wait_for_node(&self) -> Result<()> {
        for attempt in 1..=self.wait_attempts {
            if tokio::fs::try_exists(&self.device_node).await? {
                log::info!("{} present", self.device_node.display());
                return Ok(());
            }
            log::debug!(
                "Waiting for {} ({}/{})",
                self.device_node.display(),
                attempt,
                self.wait_attempts
            );
            if attempt < self.wait_attempts {
                sleep(self.wait_interval).await;
            }
        }
        Err(DeviceError::BusNotReady(format!(
            "{} did not appear after {} checks",
            self.device_node.display(),
            self.wait_attempts
        )))
    }
}

/// Failures here are not fatal; the device-node wait decides whether the bus is usable
async fn run_step(program: &str, args: &[&str]) {
    match Command::new(program).args(args).status().await {
        Ok(status) if status.success() => log::debug!("{} {} ok", program, args.join(" ")),
        Ok(status) => log::warn!("{} {} exited with {}", program, args.join(" "), status),
        Err(e) => log::warn!("Failed to run {}: {}", program, e),
    }
}

#[async_trait::async_trait]
impl BusBringUp for UdevBringUp {
    async fn ensure_bus_ready(&self) -> Result<()> {
        log::info!("Bringing up GPIB bus");
        run_step(&self.udevadm, &["control", "--reload"]).await;
        run_step(&self.udevadm, &["trigger"]).await;
        self.wait_for_node().await?;
        run_step(&self.gpib_config, &[]).await;
        Ok(())
    }
}
