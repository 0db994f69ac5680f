//! Cloneable front end to a running [`SessionEngine`](super::SessionEngine)

use super::{Request, SessionCommand, SessionSnapshot};
use crate::device::DeviceId;
use crate::{ProtocolError, Result};
use tokio::sync::{mpsc, oneshot, watch};

/// Sends commands to the engine and observes its published state
///
/// Every method fails with [`ProtocolError::EngineStopped`] once the
/// engine task has exited.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<SessionCommand>,
        snapshots: watch::Receiver<SessionSnapshot>,
    ) -> Self {
        Self {
            commands,
            snapshots,
        }
    }

    async fn request(&self, request: Request) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Request(request, tx))
            .map_err(|_| ProtocolError::EngineStopped)?;
        rx.await.map_err(|_| ProtocolError::EngineStopped)?
    }

    /// Scan for bonded devices, or for devices advertising pairing mode
    pub async fn start_scan(&self, pairing: bool) -> Result<()> {
        self.request(Request::StartScan { pairing }).await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.request(Request::StopScan).await
    }

    /// Attach to a device, replacing any current connection
    ///
    /// Returns once the connection attempt is issued; watch
    /// [`SessionSnapshot::state`] for the outcome.
    pub async fn connect(&self, id: DeviceId) -> Result<()> {
        self.request(Request::Connect(id)).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(Request::Disconnect).await
    }

    /// Drop a device from the registry and the bond list
    pub async fn forget(&self, id: DeviceId) -> Result<()> {
        self.request(Request::Forget(id)).await
    }

    /// Request a listing; entries are published in [`SessionSnapshot::directory`]
    pub async fn list_directory(&self, path: impl Into<String>) -> Result<()> {
        self.request(Request::ListDirectory(path.into())).await
    }

    /// Download a file, resolving with its contents
    ///
    /// `expected_size` only feeds the progress fraction.
    pub async fn download(&self, path: impl Into<String>, expected_size: u64) -> Result<Vec<u8>> {
        let (completion, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Download {
                path: path.into(),
                expected_size,
                completion,
            })
            .map_err(|_| ProtocolError::EngineStopped)?;
        rx.await.map_err(|_| ProtocolError::EngineStopped)?
    }

    /// Upload a file, resolving once the device acknowledged the EOF marker
    pub async fn upload(&self, path: impl Into<String>, data: Vec<u8>) -> Result<()> {
        let (completion, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Upload {
                path: path.into(),
                data,
                completion,
            })
            .map_err(|_| ProtocolError::EngineStopped)?;
        rx.await.map_err(|_| ProtocolError::EngineStopped)?.map(|_| ())
    }

    /// Abort the active transfer; its caller sees a cancellation
    pub async fn cancel_transfer(&self) -> Result<()> {
        self.request(Request::CancelTransfer).await
    }

    pub async fn get_mask(&self) -> Result<()> {
        self.request(Request::GetMask).await
    }

    pub async fn set_mask(&self, mask: u8) -> Result<()> {
        self.request(Request::SetMask(mask)).await
    }

    pub async fn start_countdown(&self) -> Result<()> {
        self.request(Request::StartCountdown).await
    }

    pub async fn cancel_countdown(&self) -> Result<()> {
        self.request(Request::CancelCountdown).await
    }

    pub async fn set_device_mode(&self, mode: u8) -> Result<()> {
        self.request(Request::SetDeviceMode(mode)).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.request(Request::Ping).await
    }

    pub async fn refresh_rssi(&self) -> Result<()> {
        self.request(Request::RefreshRssi).await
    }

    /// Latest published state
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A fresh receiver of state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| ProtocolError::EngineStopped)?;
        Ok(snapshot.clone())
    }

    /// Stop the engine, disconnecting any attached device
    pub fn shutdown(&self) -> Result<()> {
        self.commands
            .send(SessionCommand::Shutdown)
            .map_err(|_| ProtocolError::EngineStopped)
    }
}
