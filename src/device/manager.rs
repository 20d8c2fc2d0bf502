use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::bridge::GpibBridge;
use crate::config::SorterConfig;
use crate::events::{EventSink, NullSink};
use crate::handler::{run_job, BinConfig, JobReport, JobSpec};
use crate::ids::AcceptedIdSet;
use crate::serial::{SerialInterface, SerialPortIO};
use super::{discovery, BridgeStatus, BusBringUp, ConnectionState, DeviceError, DiscoveredDevice, NoopBringUp, Result};

/// Owns the bridge connection and runs discovery and sort jobs against it.
/// Jobs and discovery are serialized on the connection; only one runs at a time.
pub struct SortManager {
    config: SorterConfig,
    bridge: Arc<Mutex<Option<GpibBridge>>>,
    status: Arc<RwLock<BridgeStatus>>,
    sink: Arc<dyn EventSink>,
    bring_up: Box<dyn BusBringUp>,
}

impl SortManager {
    pub fn new(config: SorterConfig) -> Self {
        let status = BridgeStatus::new(config.connection.port.clone());
        Self {
            config,
            bridge: Arc::new(Mutex::new(None)),
            status: Arc::new(RwLock::new(status)),
            sink: Arc::new(NullSink),
            bring_up: Box::new(NoopBringUp),
        }
    }

    /// Event sink handed to every bridge this manager opens
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_bring_up(mut self, bring_up: Box<dyn BusBringUp>) -> Self {
        self.bring_up = bring_up;
        self
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    pub async fn status(&self) -> BridgeStatus {
        self.status.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.bridge.lock().await.is_some()
    }

    /// Bring the bus up (first time only) and open the configured serial port
    pub async fn connect(&self) -> Result<()> {
        self.ensure_bus_ready().await?;
        self.open(|| SerialInterface::open(&self.config.connection)).await
    }

    /// Connect over an already opened port
    pub async fn connect_with(&self, port: Box<dyn SerialPortIO>) -> Result<()> {
        self.ensure_bus_ready().await?;
        self.open(|| SerialInterface::open_with(port, &self.config.connection)).await
    }

    async fn open<F, Fut>(&self, open: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::serial::Result<SerialInterface>>,
    {
        let mut bridge_guard = self.bridge.lock().await;
        if bridge_guard.is_some() {
            return Err(DeviceError::AlreadyConnected);
        }

        self.set_state(ConnectionState::Connecting).await;
        log::info!("Attempting to connect to port: {}", self.config.connection.port);

        match open().await {
            Ok(transport) => {
                let bridge = GpibBridge::new(transport, self.config.response.clone()).with_sink(self.sink.clone());
                *bridge_guard = Some(bridge);
                self.set_state(ConnectionState::Connected).await;
                Ok(())
            }
            Err(e) => {
                let error_msg = format!("Connection failed: {}", e);
                log::error!("{}", error_msg);
                self.set_state(ConnectionState::Error(error_msg)).await;
                Err(DeviceError::SerialError(e))
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut bridge_guard = self.bridge.lock().await;
        let mut bridge = bridge_guard.take().ok_or(DeviceError::NotConnected)?;

        let closed = bridge.close().await;
        self.set_state(ConnectionState::Disconnected).await;
        log::info!("Disconnected from bridge");
        closed.map_err(DeviceError::SerialError)
    }

    pub async fn discover(&self) -> Result<BTreeMap<String, String>> {
        let mut bridge_guard = self.bridge.lock().await;
        let bridge = bridge_guard.as_mut().ok_or(DeviceError::NotConnected)?;
        Ok(discovery::discover(bridge).await?)
    }

    pub async fn discover_devices(&self) -> Result<Vec<DiscoveredDevice>> {
        let mut bridge_guard = self.bridge.lock().await;
        let bridge = bridge_guard.as_mut().ok_or(DeviceError::NotConnected)?;
        Ok(discovery::discover_devices(bridge).await?)
    }

    /// Configure the handler at `bus_address` and sort `num_parts` parts
    pub async fn run_job(
        &self,
        bus_address: u8,
        accepted: AcceptedIdSet,
        num_parts: usize,
        pass_bin: u8,
        fail_bin: u8,
    ) -> Result<JobReport> {
        let bins = BinConfig::new(pass_bin, fail_bin)?;
        let spec = JobSpec { num_parts, ..JobSpec::for_accepted(bus_address, accepted, bins) };
        self.run(&spec).await
    }

    pub async fn run(&self, spec: &JobSpec) -> Result<JobReport> {
        let mut bridge_guard = self.bridge.lock().await;
        let bridge = bridge_guard.as_mut().ok_or(DeviceError::NotConnected)?;
        Ok(run_job(bridge, spec, &self.config.job_options()).await?)
    }

    async fn ensure_bus_ready(&self) -> Result<()> {
        if self.status.read().await.bus_ready {
            return Ok(());
        }
        self.bring_up.ensure_bus_ready().await?;
        self.status.write().await.bus_ready = true;
        Ok(())
    }

    async fn set_state(&self, state: ConnectionState) {
        self.status.write().await.update_connection_state(state);
    }
}
