//! In-memory HID report pipe
//!
//! Connects a [`HidGateway`](super::HidGateway) to whatever produces host
//! reports: an OS virtual-HID driver thread, or a test acting as the host.

use super::HidIo;
use crate::error::Result;

use fido_relay_transport::ctaphid::{HidLink, PACKET_SIZE};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// Reports buffered in each direction
pub const PIPE_DEPTH: usize = 64;

type Report = [u8; PACKET_SIZE];

/// One end of a [`hid_pipe`]
///
/// Usable both as the gateway's [`HidIo`] and, from the host side, as a
/// [`HidLink`] for the `ctaphid` exchange helpers.
pub struct PipeEnd {
    tx: mpsc::Sender<Report>,
    rx: Mutex<mpsc::Receiver<Report>>,
}

/// Create a connected pair: `(gateway end, host end)`
pub fn hid_pipe() -> (PipeEnd, PipeEnd) {
    let (to_host, from_gateway) = mpsc::channel(PIPE_DEPTH);
    let (to_gateway, from_host) = mpsc::channel(PIPE_DEPTH);
    (
        PipeEnd {
            tx: to_host,
            rx: Mutex::new(from_host),
        },
        PipeEnd {
            tx: to_gateway,
            rx: Mutex::new(from_gateway),
        },
    )
}

impl PipeEnd {
    async fn push(&self, report: Report) -> fido_relay_transport::Result<()> {
        self.tx
            .send(report)
            .await
            .map_err(|_| fido_relay_transport::Error::Disconnected)
    }

    async fn pull(&self) -> fido_relay_transport::Result<Report> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(fido_relay_transport::Error::Disconnected)
    }
}

#[async_trait]
impl HidIo for PipeEnd {
    async fn send(&self, packet: &Report) -> Result<()> {
        Ok(self.push(*packet).await?)
    }

    async fn recv(&self) -> Result<Report> {
        Ok(self.pull().await?)
    }
}

#[async_trait]
impl HidLink for PipeEnd {
    async fn send(&self, packet: &[u8]) -> fido_relay_transport::Result<()> {
        let report: Report = packet
            .try_into()
            .map_err(|_| fido_relay_transport::Error::InvalidPacket("report must be 64 bytes"))?;
        self.push(report).await
    }

    async fn recv(&self) -> fido_relay_transport::Result<Vec<u8>> {
        Ok(self.pull().await?.to_vec())
    }
}
