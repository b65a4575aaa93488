use super::Device;
use crate::error::Result;

use fido_relay_transport::ctaphid::{self, Cmd, HidLink};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    /// No channel allocated
    Closed,
    /// Allocated and idle
    Ready(u32),
    /// A request was written and its response has not been read
    ///
    /// Left in place when an exchange is dropped mid-flight; the device may
    /// still answer, so the channel must be resynchronized before reuse.
    Busy(u32),
}

/// Authenticator behind a USB HID link
///
/// A channel is allocated with INIT on first use and reused afterwards. Any
/// transport error drops the channel so the next call starts from a fresh
/// INIT. An exchange abandoned before its response arrived (a timeout or a
/// dropped future) leaves the channel busy; the next call sends INIT on that
/// channel, which aborts the old transaction and discards its remains.
pub struct HidAuthenticator<L> {
    link: L,
    description: String,
    exchange: Mutex<()>,
    channel: StdMutex<Channel>,
}

impl<L: HidLink> HidAuthenticator<L> {
    pub fn new(link: L, description: impl Into<String>) -> Self {
        Self {
            link,
            description: description.into(),
            exchange: Mutex::new(()),
            channel: StdMutex::new(Channel::Closed),
        }
    }

    /// Echo `data` through CTAPHID_PING
    pub async fn ping(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.exchange(Cmd::Ping, data).await
    }

    fn channel(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_channel(&self, channel: Channel) {
        *self.channel() = channel;
    }

    /// Channel to use for the next request, allocating or resynchronizing as needed
    async fn ready_channel(&self) -> Result<u32> {
        let current = *self.channel();
        match current {
            Channel::Ready(cid) => Ok(cid),
            Channel::Busy(stale) => {
                debug!(
                    device = %self.description,
                    cid = format_args!("{:#010x}", stale),
                    "Resynchronizing interrupted channel"
                );
                match ctaphid::init(&self.link, stale).await {
                    Ok(response) => {
                        self.set_channel(Channel::Ready(response.cid));
                        Ok(response.cid)
                    }
                    Err(e) => {
                        warn!(device = %self.description, error = %e, "Resync failed, dropping channel");
                        self.set_channel(Channel::Closed);
                        Err(e.into())
                    }
                }
            }
            Channel::Closed => {
                let cid = ctaphid::open_channel(&self.link).await?;
                debug!(device = %self.description, cid = format_args!("{:#010x}", cid), "Opened channel");
                self.set_channel(Channel::Ready(cid));
                Ok(cid)
            }
        }
    }

    async fn exchange(&self, command: Cmd, payload: &[u8]) -> Result<Vec<u8>> {
        let _exclusive = self.exchange.lock().await;
        let cid = self.ready_channel().await?;

        self.set_channel(Channel::Busy(cid));
        match ctaphid::transact(&self.link, cid, command, payload).await {
            Ok(response) => {
                self.set_channel(Channel::Ready(cid));
                Ok(response)
            }
            Err(e) => {
                warn!(device = %self.description, error = %e, "HID exchange failed, dropping channel");
                self.set_channel(Channel::Closed);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl<L: HidLink> Device for HidAuthenticator<L> {
    fn description(&self) -> String {
        self.description.clone()
    }

    async fn send_cbor(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.exchange(Cmd::Cbor, request).await
    }

    /// Send CTAPHID_CANCEL on a channel with a transaction outstanding
    async fn cancel(&self) -> Result<()> {
        let Channel::Busy(cid) = *self.channel() else {
            return Ok(());
        };
        debug!(device = %self.description, cid = format_args!("{:#010x}", cid), "Forwarding CANCEL");
        for packet in ctaphid::packetize(Cmd::Cancel, cid, &[], self.link.packet_size())? {
            self.link.send(&packet).await?;
        }
        Ok(())
    }
}
