//! Virtual CTAPHID authenticator that relays CBOR to real devices
//!
//! The gateway plays the authenticator side of CTAPHID towards a host (for
//! example a browser talking to a virtual HID device). INIT and PING are
//! answered locally; CBOR requests are forwarded to the first device a
//! [`DeviceList`] reports and the response is framed back to the host.
//!
//! CBOR dispatch runs on its own task so the listen loop keeps serving other
//! channels. While a dispatch is in flight the channel receives
//! KEEPALIVE(PROCESSING) frames and can be cancelled with CANCEL, which is
//! answered with CTAP2_ERR_KEEPALIVE_CANCEL, or aborted silently with INIT on
//! the same channel. Either way the device is asked to cancel as well.

mod pipe;

pub use pipe::{hid_pipe, PipeEnd, PIPE_DEPTH};

use crate::config::GatewayConfig;
use crate::device::{Device, DeviceList};
use crate::error::{Error, Result};

use fido_relay_transport::ctaphid::{
    self, Cmd, ErrorCode, Frame, InitResponse, Reassembler, BROADCAST_CID,
    CTAPHID_PROTOCOL_VERSION, INIT_NONCE_SIZE, KEEPALIVE_PROCESSING, PACKET_SIZE,
};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// CTAP2_ERR_KEEPALIVE_CANCEL, returned as the CBOR status of a cancelled request
pub const CTAP2_ERR_KEEPALIVE_CANCEL: u8 = 0x2D;

/// Raw report I/O between the gateway and the host
#[async_trait]
pub trait HidIo: Send + Sync {
    /// Deliver one report to the host
    async fn send(&self, packet: &[u8; PACKET_SIZE]) -> Result<()>;

    /// Wait for the next report from the host
    ///
    /// `Error::Transport(Disconnected)` ends [`HidGateway::run`].
    async fn recv(&self) -> Result<[u8; PACKET_SIZE]>;
}

/// How many recently issued channel ids are remembered to avoid reissuing them
pub const ISSUED_CHANNEL_HISTORY: usize = 4096;

/// Why a dispatch was stopped before the device answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    /// CTAPHID_CANCEL: answer with CTAP2_ERR_KEEPALIVE_CANCEL
    Cancel,
    /// INIT on the channel: drop the request without a response
    Resync,
}

struct InFlight {
    id: u64,
    abort: watch::Sender<Option<Abort>>,
}

/// Channel bookkeeping shared with dispatch tasks
///
/// Never locked across an `.await`.
#[derive(Default)]
struct ChannelTable {
    issued: HashSet<u32>,
    issue_order: VecDeque<u32>,
    in_flight: HashMap<u32, InFlight>,
    next_dispatch: u64,
}

impl ChannelTable {
    /// Record `cid` as issued unless it was issued recently
    fn issue(&mut self, cid: u32) -> bool {
        if !self.issued.insert(cid) {
            return false;
        }
        self.issue_order.push_back(cid);
        if self.issue_order.len() > ISSUED_CHANNEL_HISTORY {
            if let Some(oldest) = self.issue_order.pop_front() {
                self.issued.remove(&oldest);
            }
        }
        true
    }

    /// Signal the dispatch on `cid`, if any
    ///
    /// A resync frees the channel at once; a cancelled dispatch keeps it until
    /// its cancel status has been sent.
    fn abort(&mut self, cid: u32, reason: Abort) -> bool {
        let Some(in_flight) = self.in_flight.get(&cid) else {
            return false;
        };
        let _ = in_flight.abort.send(Some(reason));
        if reason == Abort::Resync {
            self.in_flight.remove(&cid);
        }
        true
    }

    /// Remove the entry for `cid` if it still belongs to dispatch `id`
    fn finish(&mut self, cid: u32, id: u64) {
        if self.in_flight.get(&cid).is_some_and(|entry| entry.id == id) {
            self.in_flight.remove(&cid);
        }
    }
}

/// CTAPHID error code reported for a failed request read
fn error_code_for(error: &fido_relay_transport::Error) -> ErrorCode {
    use fido_relay_transport::Error as TransportError;
    match error {
        TransportError::InvalidSequence { .. } => ErrorCode::InvalidSeq,
        TransportError::Timeout => ErrorCode::MsgTimeout,
        _ => ErrorCode::InvalidCmd,
    }
}

fn frames(command: Cmd, cid: u32, payload: &[u8]) -> Result<Vec<[u8; PACKET_SIZE]>> {
    ctaphid::packetize(command, cid, payload, PACKET_SIZE)?
        .into_iter()
        .map(|packet| {
            <[u8; PACKET_SIZE]>::try_from(packet.as_slice())
                .map_err(|_| Error::Other("packetizer produced a short report".into()))
        })
        .collect()
}

fn error_frame(cid: u32, code: ErrorCode) -> [u8; PACKET_SIZE] {
    let mut packet = [0u8; PACKET_SIZE];
    packet.copy_from_slice(&ctaphid::error_packet(cid, code));
    packet
}

/// Cloneable handles needed to answer on a channel
#[derive(Clone)]
struct Responder {
    io: Arc<dyn HidIo>,
}

impl Responder {
    async fn send_all(&self, cid: u32, packets: &[[u8; PACKET_SIZE]]) {
        for packet in packets {
            trace!(packet = %hex::encode(packet), "Gateway ->");
            if let Err(e) = self.io.send(packet).await {
                warn!(cid = format_args!("{:#010x}", cid), error = %e, "Failed to deliver report");
                return;
            }
        }
    }

    async fn reply(&self, command: Cmd, cid: u32, payload: &[u8]) {
        match frames(command, cid, payload) {
            Ok(packets) => self.send_all(cid, &packets).await,
            Err(e) => {
                warn!(cid = format_args!("{:#010x}", cid), error = %e, "Response cannot be framed");
                self.error(cid, ErrorCode::Other).await;
            }
        }
    }

    async fn error(&self, cid: u32, code: ErrorCode) {
        debug!(cid = format_args!("{:#010x}", cid), code = ?code, "Sending CTAPHID error");
        self.send_all(cid, &[error_frame(cid, code)]).await;
    }
}

/// Virtual CTAPHID authenticator
pub struct HidGateway {
    io: Arc<dyn HidIo>,
    devices: Arc<dyn DeviceList>,
    config: GatewayConfig,
    channels: Arc<Mutex<ChannelTable>>,
}

impl HidGateway {
    pub fn new(io: Arc<dyn HidIo>, devices: Arc<dyn DeviceList>, config: GatewayConfig) -> Self {
        Self {
            io,
            devices,
            config,
            channels: Arc::new(Mutex::new(ChannelTable::default())),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, ChannelTable> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn responder(&self) -> Responder {
        Responder {
            io: Arc::clone(&self.io),
        }
    }

    /// Pick a random channel id that is neither reserved nor recently issued
    fn allocate_channel(&self) -> u32 {
        let mut table = self.table();
        loop {
            let cid: u32 = rand::random();
            if cid != 0 && cid != BROADCAST_CID && table.issue(cid) {
                return cid;
            }
        }
    }

    /// Serve the host until `shutdown` resolves or the I/O reports a disconnect
    ///
    /// Failed exchanges are answered with CTAPHID errors and never end the loop.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        info!("CTAPHID gateway listening");
        loop {
            let packet = tokio::select! {
                _ = &mut shutdown => {
                    info!("CTAPHID gateway shutting down");
                    return Ok(());
                }
                packet = self.io.recv() => packet,
            };
            match packet {
                Ok(packet) => self.handle_packet(packet).await,
                Err(Error::Transport(fido_relay_transport::Error::Disconnected)) => {
                    info!("Host disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drive one inbound exchange starting at `packet`
    ///
    /// Continuation packets are read from the gateway's I/O as needed.
    pub async fn handle_packet(&self, packet: [u8; PACKET_SIZE]) {
        trace!(packet = %hex::encode(packet), "Gateway <-");
        let responder = self.responder();

        let (cid, cmd) = match Frame::parse(&packet) {
            Ok(Frame::Init { cid, cmd, .. }) => (cid, cmd),
            Ok(Frame::Cont { cid, .. }) => {
                debug!(cid = format_args!("{:#010x}", cid), "Continuation packet without a request");
                responder.error(cid, ErrorCode::InvalidSeq).await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Unparseable report");
                return;
            }
        };

        let payload = match self.read_request(cid, cmd, &packet).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(cid = format_args!("{:#010x}", cid), error = %e, "Request aborted");
                responder.error(cid, error_code_for(&e)).await;
                return;
            }
        };

        self.dispatch(cid, cmd, payload).await;
    }

    /// Reassemble the request started by `first`
    async fn read_request(
        &self,
        cid: u32,
        cmd: u8,
        first: &[u8; PACKET_SIZE],
    ) -> fido_relay_transport::Result<Vec<u8>> {
        let mut reassembler = Reassembler::new(cid, cmd);
        let mut next = reassembler.push(first)?;
        loop {
            if let Some(payload) = next {
                return Ok(payload);
            }
            let packet = match timeout(self.config.continuation_timeout, self.io.recv()).await {
                Ok(Ok(packet)) => packet,
                Ok(Err(_)) => return Err(fido_relay_transport::Error::Disconnected),
                Err(_) => return Err(fido_relay_transport::Error::Timeout),
            };
            trace!(packet = %hex::encode(packet), "Gateway <-");
            next = reassembler.push(&packet)?;
        }
    }

    async fn dispatch(&self, cid: u32, cmd: u8, payload: Vec<u8>) {
        let responder = self.responder();

        if cid == BROADCAST_CID {
            if Cmd::from_u8(cmd) != Some(Cmd::Init) {
                responder.error(cid, ErrorCode::InvalidCmd).await;
                return;
            }
            match self.init_response(&payload, None) {
                Some(response) => {
                    debug!(cid = format_args!("{:#010x}", response.cid), "Allocated channel");
                    responder.reply(Cmd::Init, cid, &response.to_bytes()).await;
                }
                None => responder.error(cid, ErrorCode::InvalidLen).await,
            }
            return;
        }

        if cid == 0 {
            responder.error(cid, ErrorCode::InvalidChannel).await;
            return;
        }

        match Cmd::from_u8(cmd) {
            Some(Cmd::Init) => match self.init_response(&payload, Some(cid)) {
                Some(response) => {
                    if self.table().abort(cid, Abort::Resync) {
                        debug!(cid = format_args!("{:#010x}", cid), "INIT aborted request in flight");
                    }
                    responder.reply(Cmd::Init, cid, &response.to_bytes()).await
                }
                None => responder.error(cid, ErrorCode::InvalidLen).await,
            },
            Some(Cmd::Ping) => responder.reply(Cmd::Ping, cid, &payload).await,
            Some(Cmd::Cbor) => self.start_cbor(cid, payload).await,
            Some(Cmd::Cancel) => self.cancel(cid),
            _ => {
                debug!(
                    cid = format_args!("{:#010x}", cid),
                    cmd = format_args!("{:#04x}", cmd),
                    "Unsupported command"
                );
                responder.error(cid, ErrorCode::InvalidCmd).await;
            }
        }
    }

    /// INIT response echoing `nonce`; `reset` keeps an existing channel id
    fn init_response(&self, nonce: &[u8], reset: Option<u32>) -> Option<InitResponse> {
        let nonce: [u8; INIT_NONCE_SIZE] = nonce.try_into().ok()?;
        Some(InitResponse {
            nonce,
            cid: reset.unwrap_or_else(|| self.allocate_channel()),
            protocol_version: CTAPHID_PROTOCOL_VERSION,
            device_version: self.config.device_version,
            capabilities: self.config.capabilities,
        })
    }

    fn cancel(&self, cid: u32) {
        if self.table().abort(cid, Abort::Cancel) {
            debug!(cid = format_args!("{:#010x}", cid), "Cancelling request");
        } else {
            trace!(cid = format_args!("{:#010x}", cid), "CANCEL with nothing in flight");
        }
    }

    async fn start_cbor(&self, cid: u32, request: Vec<u8>) {
        let (abort, aborted) = watch::channel(None);
        let id = {
            let mut table = self.table();
            if table.in_flight.contains_key(&cid) {
                None
            } else {
                let id = table.next_dispatch;
                table.next_dispatch += 1;
                table.in_flight.insert(cid, InFlight { id, abort });
                Some(id)
            }
        };
        let Some(id) = id else {
            self.responder().error(cid, ErrorCode::ChannelBusy).await;
            return;
        };

        let dispatch = Dispatch {
            id,
            cid,
            request,
            responder: self.responder(),
            devices: Arc::clone(&self.devices),
            config: self.config.clone(),
            channels: Arc::clone(&self.channels),
            active: Mutex::new(None),
        };
        tokio::spawn(dispatch.run(aborted));
    }
}

enum Outcome {
    Response(Vec<u8>),
    TimedOut,
    Aborted(Abort),
}

/// One CBOR request relayed to a device on its own task
struct Dispatch {
    id: u64,
    cid: u32,
    request: Vec<u8>,
    responder: Responder,
    devices: Arc<dyn DeviceList>,
    config: GatewayConfig,
    channels: Arc<Mutex<ChannelTable>>,
    /// Device currently holding the request
    active: Mutex<Option<Arc<dyn Device>>>,
}

impl Dispatch {
    fn set_active(&self, device: Option<Arc<dyn Device>>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = device;
    }

    async fn run(self, mut aborted: watch::Receiver<Option<Abort>>) {
        let cid = self.cid;
        let outcome = {
            let relay = self.relay();
            tokio::pin!(relay);

            let period = self.config.keepalive_interval;
            let mut keepalive = interval_at(Instant::now() + period, period);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    result = &mut relay => break result,
                    Ok(()) = aborted.changed() => {
                        if let Some(reason) = *aborted.borrow_and_update() {
                            break Outcome::Aborted(reason);
                        }
                    }
                    _ = keepalive.tick() => {
                        self.responder.reply(Cmd::Keepalive, cid, &[KEEPALIVE_PROCESSING]).await;
                    }
                }
            }
        };

        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish(cid, self.id);

        let abandoned = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(device) = abandoned {
            debug!(device = %device.description(), "Forwarding cancel to authenticator");
            if let Err(e) = device.cancel().await {
                warn!(device = %device.description(), error = %e, "Authenticator cancel failed");
            }
        }

        match outcome {
            Outcome::Response(response) => self.responder.reply(Cmd::Cbor, cid, &response).await,
            Outcome::TimedOut => self.responder.error(cid, ErrorCode::MsgTimeout).await,
            Outcome::Aborted(Abort::Cancel) => {
                self.responder
                    .reply(Cmd::Cbor, cid, &[CTAP2_ERR_KEEPALIVE_CANCEL])
                    .await
            }
            Outcome::Aborted(Abort::Resync) => {
                debug!(cid = format_args!("{:#010x}", cid), "Request dropped by INIT")
            }
        }
    }

    /// Poll for a device and retry failed exchanges until the request budget runs out
    async fn relay(&self) -> Outcome {
        let attempts = async {
            loop {
                match self.devices.devices().await {
                    Ok(devices) => match devices.first() {
                        Some(device) => {
                            self.set_active(Some(Arc::clone(device)));
                            let result = device.send_cbor(&self.request).await;
                            self.set_active(None);
                            match result {
                                Ok(response) => return response,
                                Err(e) => warn!(
                                    device = %device.description(),
                                    error = %e,
                                    "Authenticator exchange failed, retrying"
                                ),
                            }
                        }
                        None => trace!("No authenticator available yet"),
                    },
                    Err(e) => warn!(error = %e, "Device enumeration failed"),
                }
                sleep(self.config.poll_delay).await;
            }
        };

        match timeout(self.config.request_timeout, attempts).await {
            Ok(response) => Outcome::Response(response),
            Err(_) => {
                warn!(cid = format_args!("{:#010x}", self.cid), "No authenticator answered in time");
                Outcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticDeviceList;

    use fido_relay_transport::ctaphid::HidLink;

    fn gateway() -> (HidGateway, PipeEnd) {
        let (io, host) = hid_pipe();
        let gateway = HidGateway::new(
            Arc::new(io),
            Arc::new(StaticDeviceList::new()),
            GatewayConfig::default(),
        );
        (gateway, host)
    }

    #[test]
    fn test_error_code_mapping() {
        use fido_relay_transport::Error as TransportError;
        assert_eq!(
            error_code_for(&TransportError::InvalidSequence {
                expected: 0,
                actual: 3
            }),
            ErrorCode::InvalidSeq
        );
        assert_eq!(error_code_for(&TransportError::Timeout), ErrorCode::MsgTimeout);
        assert_eq!(
            error_code_for(&TransportError::ChannelMismatch {
                expected: 1,
                actual: 2
            }),
            ErrorCode::InvalidCmd
        );
        assert_eq!(
            error_code_for(&TransportError::MessageTooLarge(9000)),
            ErrorCode::InvalidCmd
        );
    }

    #[test]
    fn test_allocated_channels_are_unique_and_valid() {
        let (gateway, _host) = gateway();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let cid = gateway.allocate_channel();
            assert_ne!(cid, 0);
            assert_ne!(cid, BROADCAST_CID);
            assert!(seen.insert(cid));
        }
    }

    #[test]
    fn test_issued_channel_history_is_bounded() {
        let (gateway, _host) = gateway();
        for _ in 0..ISSUED_CHANNEL_HISTORY * 3 {
            gateway.allocate_channel();
        }
        let table = gateway.table();
        assert_eq!(table.issue_order.len(), ISSUED_CHANNEL_HISTORY);
        assert_eq!(table.issued.len(), ISSUED_CHANNEL_HISTORY);
    }

    #[test]
    fn test_issue_rejects_recent_and_forgets_oldest() {
        let mut table = ChannelTable::default();
        assert!(table.issue(1));
        assert!(!table.issue(1));
        for cid in 2..=ISSUED_CHANNEL_HISTORY as u32 + 1 {
            assert!(table.issue(cid));
        }
        assert!(!table.issued.contains(&1));
        assert!(table.issue(1));
    }

    #[test]
    fn test_finished_dispatch_keeps_newer_entry() {
        let mut table = ChannelTable::default();
        let (old, old_rx) = watch::channel(None);
        table.in_flight.insert(7, InFlight { id: 1, abort: old });
        assert!(table.abort(7, Abort::Cancel));
        assert_eq!(*old_rx.borrow(), Some(Abort::Cancel));
        assert!(table.in_flight.contains_key(&7));
        assert!(table.abort(7, Abort::Resync));
        assert_eq!(*old_rx.borrow(), Some(Abort::Resync));
        assert!(!table.abort(7, Abort::Cancel));

        let (new, _new_rx) = watch::channel(None);
        table.in_flight.insert(7, InFlight { id: 2, abort: new });
        table.finish(7, 1);
        assert!(table.in_flight.contains_key(&7));
        table.finish(7, 2);
        assert!(table.in_flight.is_empty());
    }

    #[test]
    fn test_init_response_requires_eight_byte_nonce() {
        let (gateway, _host) = gateway();
        assert!(gateway.init_response(&[0; 7], None).is_none());
        assert!(gateway.init_response(&[0; 9], None).is_none());

        let response = gateway.init_response(&[7; 8], Some(0x01020304)).unwrap();
        assert_eq!(response.cid, 0x01020304);
        assert_eq!(response.nonce, [7; 8]);
        assert_eq!(response.protocol_version, 2);
        assert_eq!(response.capabilities, 0x0C);
    }

    #[tokio::test]
    async fn test_continuation_without_request() {
        let (gateway, host) = gateway();
        let mut packet = [0u8; PACKET_SIZE];
        packet[..4].copy_from_slice(&0x01020304u32.to_be_bytes());
        packet[4] = 0x00;

        gateway.handle_packet(packet).await;
        let reply = HidLink::recv(&host).await.unwrap();
        assert_eq!(reply, ctaphid::error_packet(0x01020304, ErrorCode::InvalidSeq));
    }
}
