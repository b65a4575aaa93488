use super::Device;
use crate::error::{Error, Result};

use fido_relay_transport::ble::{self, BleCommand, BleLink, NotificationReceiver};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Time allowed for a BLE authenticator to answer one request
pub const DEFAULT_BLE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticator behind a GATT connection
///
/// The control point length is read and validated once at connect time.
/// Notifications from the status characteristic must be forwarded into the
/// queue passed to [`BleAuthenticator::connect`].
///
/// The authenticator answers requests in order. When an exchange is abandoned
/// after its request went out, the response still arrives later; it is
/// counted as owed and discarded by the next exchange before that exchange
/// reads its own response.
pub struct BleAuthenticator<L> {
    link: L,
    description: String,
    packet_size: usize,
    response_timeout: Duration,
    notifications: Mutex<NotificationReceiver>,
    /// Requests written whose response has not been consumed
    outstanding: AtomicUsize,
}

impl<L: BleLink> BleAuthenticator<L> {
    /// Read `fidoControlPointLength` and build the authenticator
    ///
    /// A control point length outside `[20, 512]` fails the connection.
    pub async fn connect(
        link: L,
        notifications: NotificationReceiver,
        description: impl Into<String>,
    ) -> Result<Self> {
        let reported = link.read_control_point_length().await?;
        let packet_size = ble::validate_packet_size(reported as usize)?;
        let description = description.into();
        debug!(device = %description, packet_size, "BLE authenticator connected");
        Ok(Self {
            link,
            description,
            packet_size,
            response_timeout: DEFAULT_BLE_RESPONSE_TIMEOUT,
            notifications: Mutex::new(notifications),
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Override the response timeout
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Negotiated control point length
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    async fn exchange(&self, command: BleCommand, payload: &[u8]) -> Result<Vec<u8>> {
        let mut notifications = self.notifications.lock().await;
        let exchange = async {
            ble::send_message(&self.link, command, payload, self.packet_size).await?;
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            loop {
                let stale = self.outstanding.load(Ordering::SeqCst) > 1;
                let result = ble::receive_message(&mut notifications, stale).await;
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                if !stale {
                    return result;
                }
                debug!(
                    device = %self.description,
                    ok = result.is_ok(),
                    "Discarding response owed to an abandoned request"
                );
            }
        };
        match tokio::time::timeout(self.response_timeout, exchange).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Echo `data` through the BLE PING command
    pub async fn ping(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.exchange(BleCommand::Ping, data).await
    }
}

#[async_trait]
impl<L: BleLink> Device for BleAuthenticator<L> {
    fn description(&self) -> String {
        self.description.clone()
    }

    async fn send_cbor(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.exchange(BleCommand::Msg, request).await
    }

    /// Write a CANCEL frame while a response is still owed
    async fn cancel(&self) -> Result<()> {
        if self.outstanding.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        debug!(device = %self.description, "Forwarding CANCEL");
        ble::send_message(&self.link, BleCommand::Cancel, &[], self.packet_size).await?;
        Ok(())
    }
}
