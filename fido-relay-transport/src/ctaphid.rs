//! CTAP HID Protocol Implementation
//!
//! Implements CTAP over USB HID with message fragmentation and reassembly.
//!
//! Packet Format:
//! - Initialization packet: CID(4) + CMD(1) + BCNT(2) + DATA(57)
//! - Continuation packet: CID(4) + SEQ(1) + DATA(59)
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#usb-hid-framing>

use crate::error::{Error, Result};

use async_trait::async_trait;
use tracing::{debug, trace};

/// HID packet size (fixed at 64 bytes for USB HID)
pub const PACKET_SIZE: usize = 64;

/// Maximum CTAP message size for 64-byte packets (57 + 128 * 59 = 7609 bytes)
pub const MAX_MESSAGE_SIZE: usize = 7609;

/// Broadcast channel ID (used for INIT command)
pub const BROADCAST_CID: u32 = 0xFFFFFFFF;

/// INIT nonce length
pub const INIT_NONCE_SIZE: usize = 8;

/// INIT response length
pub const INIT_RESPONSE_SIZE: usize = 17;

/// CTAPHID protocol version reported in INIT responses
pub const CTAPHID_PROTOCOL_VERSION: u8 = 2;

/// KEEPALIVE status: the authenticator is still processing
pub const KEEPALIVE_PROCESSING: u8 = 0x01;

/// KEEPALIVE status: the authenticator is waiting for user presence
pub const KEEPALIVE_UP_NEEDED: u8 = 0x02;

/// Capability flags carried in the INIT response
pub mod capability {
    /// Implements WINK
    pub const WINK: u8 = 0x01;
    /// Implements CBOR
    pub const CBOR: u8 = 0x04;
    /// Does NOT implement MSG
    pub const NMSG: u8 = 0x08;
}

/// CID(4) + CMD(1) + BCNT(2)
const INIT_HEADER_SIZE: usize = 7;

/// CID(4) + SEQ(1)
const CONT_HEADER_SIZE: usize = 5;

/// Highest continuation sequence number
const MAX_SEQ: u8 = 0x7F;

/// CTAP HID commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// Transaction that echoes the data back
    Ping = 0x01,

    /// Encapsulated CTAP1/U2F message
    Msg = 0x03,

    /// Place an exclusive lock for one channel
    Lock = 0x04,

    /// Allocate a new CID or synchronize channel
    Init = 0x06,

    /// Request authenticator to provide visual/audible identification
    Wink = 0x08,

    /// Encapsulated CTAP CBOR encoded message
    Cbor = 0x10,

    /// Cancel any outstanding requests on the given CID
    Cancel = 0x11,

    /// The request is still being processed
    Keepalive = 0x3B,

    /// Error response message
    Error = 0x3F,
}

impl Cmd {
    /// Convert from a command byte, with or without the TYPE bit
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x7F {
            0x01 => Some(Cmd::Ping),
            0x03 => Some(Cmd::Msg),
            0x04 => Some(Cmd::Lock),
            0x06 => Some(Cmd::Init),
            0x08 => Some(Cmd::Wink),
            0x10 => Some(Cmd::Cbor),
            0x11 => Some(Cmd::Cancel),
            0x3B => Some(Cmd::Keepalive),
            0x3F => Some(Cmd::Error),
            _ => None,
        }
    }

    /// Command byte with the TYPE bit set, as found in an initialization packet
    pub fn to_u8_init(self) -> u8 {
        (self as u8) | 0x80
    }

    /// Command value without the TYPE bit
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// CTAP HID error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Invalid command
    InvalidCmd = 0x01,

    /// Invalid parameter
    InvalidPar = 0x02,

    /// Invalid message length
    InvalidLen = 0x03,

    /// Invalid message sequencing
    InvalidSeq = 0x04,

    /// Message has timed out
    MsgTimeout = 0x05,

    /// Channel busy
    ChannelBusy = 0x06,

    /// Command requires channel lock
    LockRequired = 0x0A,

    /// CID invalid
    InvalidChannel = 0x0B,

    /// Other unspecified error
    Other = 0x7F,
}

impl ErrorCode {
    /// Convert to u8 value
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Convert from u8 value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ErrorCode::InvalidCmd),
            0x02 => Some(ErrorCode::InvalidPar),
            0x03 => Some(ErrorCode::InvalidLen),
            0x04 => Some(ErrorCode::InvalidSeq),
            0x05 => Some(ErrorCode::MsgTimeout),
            0x06 => Some(ErrorCode::ChannelBusy),
            0x0A => Some(ErrorCode::LockRequired),
            0x0B => Some(ErrorCode::InvalidChannel),
            0x7F => Some(ErrorCode::Other),
            _ => None,
        }
    }
}

/// Largest payload for `packet_size`
///
/// Bounded both by the 128 continuation packets a message may use and by the
/// 16-bit BCNT field.
pub fn max_payload(packet_size: usize) -> usize {
    let by_sequence = (packet_size - INIT_HEADER_SIZE)
        + (MAX_SEQ as usize + 1) * (packet_size - CONT_HEADER_SIZE);
    by_sequence.min(u16::MAX as usize)
}

/// Split `payload` into HID packets of exactly `packet_size` bytes
///
/// Every packet is zero padded. Payloads that would need a sequence number
/// above `0x7F`, or whose length does not fit BCNT, are rejected rather than
/// wrapped or truncated.
pub fn packetize(command: Cmd, cid: u32, payload: &[u8], packet_size: usize) -> Result<Vec<Vec<u8>>> {
    if packet_size <= INIT_HEADER_SIZE {
        return Err(Error::InvalidArgument("HID packet size must exceed 7 bytes"));
    }
    if payload.len() > max_payload(packet_size) {
        return Err(Error::MessageTooLarge(payload.len()));
    }

    let init_capacity = packet_size - INIT_HEADER_SIZE;
    let cont_capacity = packet_size - CONT_HEADER_SIZE;

    let mut packets = Vec::new();

    let mut init = vec![0u8; packet_size];
    init[0..4].copy_from_slice(&cid.to_be_bytes());
    init[4] = command.to_u8_init();
    init[5..7].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    let first = payload.len().min(init_capacity);
    init[INIT_HEADER_SIZE..INIT_HEADER_SIZE + first].copy_from_slice(&payload[..first]);
    packets.push(init);

    for (seq, chunk) in payload[first..].chunks(cont_capacity).enumerate() {
        let mut cont = vec![0u8; packet_size];
        cont[0..4].copy_from_slice(&cid.to_be_bytes());
        cont[4] = seq as u8;
        cont[CONT_HEADER_SIZE..CONT_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
        packets.push(cont);
    }

    Ok(packets)
}

/// Single ERROR packet carrying `code`
pub fn error_packet(cid: u32, code: ErrorCode) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_SIZE];
    packet[0..4].copy_from_slice(&cid.to_be_bytes());
    packet[4] = Cmd::Error.to_u8_init();
    packet[5..7].copy_from_slice(&1u16.to_be_bytes());
    packet[7] = code.to_u8();
    packet
}

/// A parsed view of one raw HID packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Initialization packet; `cmd` has the TYPE bit cleared
    Init {
        cid: u32,
        cmd: u8,
        len: u16,
        data: &'a [u8],
    },
    /// Continuation packet
    Cont { cid: u32, seq: u8, data: &'a [u8] },
}

impl<'a> Frame<'a> {
    /// Parse a raw packet
    pub fn parse(packet: &'a [u8]) -> Result<Self> {
        if packet.len() < CONT_HEADER_SIZE {
            return Err(Error::InvalidPacket("HID packet shorter than its header"));
        }
        let cid = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
        if packet[4] & 0x80 == 0 {
            return Ok(Frame::Cont {
                cid,
                seq: packet[4],
                data: &packet[CONT_HEADER_SIZE..],
            });
        }
        if packet.len() < INIT_HEADER_SIZE {
            return Err(Error::InvalidPacket("HID packet shorter than its header"));
        }
        Ok(Frame::Init {
            cid,
            cmd: packet[4] & 0x7F,
            len: u16::from_be_bytes([packet[5], packet[6]]),
            data: &packet[INIT_HEADER_SIZE..],
        })
    }

    /// Channel ID
    pub fn cid(&self) -> u32 {
        match self {
            Frame::Init { cid, .. } | Frame::Cont { cid, .. } => *cid,
        }
    }
}

#[derive(Debug)]
struct Partial {
    total: usize,
    data: Vec<u8>,
    next_seq: u8,
}

/// Incremental reassembly of one message on one channel
///
/// Push raw packets in arrival order; `push` returns the payload once the
/// declared length has been received and never returns partial data. Before
/// the initial packet arrives, KEEPALIVE packets are skipped and an ERROR
/// packet surfaces as [`Error::DeviceError`] unless that command is itself the
/// one awaited.
#[derive(Debug)]
pub struct Reassembler {
    cid: u32,
    expected: u8,
    partial: Option<Partial>,
}

impl Reassembler {
    /// Await a message with command value `expected` on channel `cid`
    pub fn new(cid: u32, expected: u8) -> Self {
        Self {
            cid,
            expected: expected & 0x7F,
            partial: None,
        }
    }

    /// Whether the initial packet has been accepted
    pub fn is_started(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one raw packet
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>> {
        let frame = Frame::parse(packet)?;
        if frame.cid() != self.cid {
            return Err(Error::ChannelMismatch {
                expected: self.cid,
                actual: frame.cid(),
            });
        }

        match (frame, self.partial.as_mut()) {
            (Frame::Init { cmd, len, data, .. }, None) => {
                if cmd == self.expected {
                    let total = len as usize;
                    if total > max_payload(packet.len()) {
                        return Err(Error::MessageTooLarge(total));
                    }
                    let take = total.min(data.len());
                    let mut buffer = Vec::with_capacity(total);
                    buffer.extend_from_slice(&data[..take]);
                    self.partial = Some(Partial {
                        total,
                        data: buffer,
                        next_seq: 0,
                    });
                    Ok(self.take_if_complete())
                } else if cmd == Cmd::Keepalive.to_u8() {
                    trace!(
                        cid = format_args!("{:#010x}", self.cid),
                        status = data.first().copied().unwrap_or(0),
                        "Skipping keepalive"
                    );
                    Ok(None)
                } else if cmd == Cmd::Error.to_u8() {
                    let code = data.first().copied().unwrap_or(ErrorCode::Other.to_u8());
                    Err(Error::DeviceError(code))
                } else {
                    Err(Error::UnexpectedCommand(cmd))
                }
            }
            (Frame::Init { .. }, Some(partial)) => Err(Error::InvalidSequence {
                expected: partial.next_seq,
                actual: packet[4],
            }),
            (Frame::Cont { .. }, None) => {
                Err(Error::InvalidPacket("continuation packet before initial packet"))
            }
            (Frame::Cont { seq, data, .. }, Some(partial)) => {
                if seq != partial.next_seq {
                    return Err(Error::InvalidSequence {
                        expected: partial.next_seq,
                        actual: seq,
                    });
                }
                let take = (partial.total - partial.data.len()).min(data.len());
                partial.data.extend_from_slice(&data[..take]);
                partial.next_seq += 1;
                Ok(self.take_if_complete())
            }
        }
    }

    fn take_if_complete(&mut self) -> Option<Vec<u8>> {
        match &self.partial {
            Some(partial) if partial.data.len() == partial.total => {
                self.partial.take().map(|partial| partial.data)
            }
            _ => None,
        }
    }
}

/// Raw packet I/O with a USB HID authenticator
///
/// Implementations own the OS handle; every call moves exactly one report.
#[async_trait]
pub trait HidLink: Send + Sync {
    /// Report size of the device
    fn packet_size(&self) -> usize {
        PACKET_SIZE
    }

    /// Write one packet
    async fn send(&self, packet: &[u8]) -> Result<()>;

    /// Read the next packet
    async fn recv(&self) -> Result<Vec<u8>>;
}

/// Read one complete message with command `expected` from channel `cid`
pub async fn read<L: HidLink + ?Sized>(link: &L, cid: u32, expected: Cmd) -> Result<Vec<u8>> {
    let mut reassembler = Reassembler::new(cid, expected.to_u8());
    loop {
        let packet = link.recv().await?;
        trace!(packet = %hex::encode(&packet), "HID <-");
        if let Some(payload) = reassembler.push(&packet)? {
            return Ok(payload);
        }
    }
}

/// Send `payload` as command `command` on `cid` and read the matching response
pub async fn transact<L: HidLink + ?Sized>(
    link: &L,
    cid: u32,
    command: Cmd,
    payload: &[u8],
) -> Result<Vec<u8>> {
    for packet in packetize(command, cid, payload, link.packet_size())? {
        trace!(packet = %hex::encode(&packet), "HID ->");
        link.send(&packet).await?;
    }
    read(link, cid, command).await
}

/// Parsed INIT response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitResponse {
    pub nonce: [u8; INIT_NONCE_SIZE],
    pub cid: u32,
    pub protocol_version: u8,
    pub device_version: [u8; 3],
    pub capabilities: u8,
}

impl InitResponse {
    /// Parse the 17-byte INIT response payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < INIT_RESPONSE_SIZE {
            return Err(Error::Truncated {
                expected: INIT_RESPONSE_SIZE,
                actual: payload.len(),
            });
        }
        let mut nonce = [0u8; INIT_NONCE_SIZE];
        nonce.copy_from_slice(&payload[..8]);
        Ok(Self {
            nonce,
            cid: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
            protocol_version: payload[12],
            device_version: [payload[13], payload[14], payload[15]],
            capabilities: payload[16],
        })
    }

    /// Encode as the 17-byte INIT response payload
    pub fn to_bytes(&self) -> [u8; INIT_RESPONSE_SIZE] {
        let mut out = [0u8; INIT_RESPONSE_SIZE];
        out[..8].copy_from_slice(&self.nonce);
        out[8..12].copy_from_slice(&self.cid.to_be_bytes());
        out[12] = self.protocol_version;
        out[13..16].copy_from_slice(&self.device_version);
        out[16] = self.capabilities;
        out
    }

    /// Whether the device implements CTAPHID_CBOR
    pub fn supports_cbor(&self) -> bool {
        self.capabilities & capability::CBOR != 0
    }
}

/// Read the INIT response on `cid`
///
/// Anything queued ahead of it (keepalives, the remains of an abandoned
/// response, traffic for other channels) is discarded. An ERROR packet on
/// `cid` still surfaces as [`Error::DeviceError`].
async fn read_init<L: HidLink + ?Sized>(link: &L, cid: u32) -> Result<Vec<u8>> {
    let mut reassembler = Reassembler::new(cid, Cmd::Init.to_u8());
    loop {
        let packet = link.recv().await?;
        trace!(packet = %hex::encode(&packet), "HID <-");
        if !reassembler.is_started() {
            match Frame::parse(&packet)? {
                Frame::Init { cid: from, cmd, .. }
                    if from == cid && (cmd == Cmd::Init.to_u8() || cmd == Cmd::Error.to_u8()) => {}
                frame => {
                    debug!(
                        cid = format_args!("{:#010x}", frame.cid()),
                        "Discarding packet queued ahead of INIT response"
                    );
                    continue;
                }
            }
        }
        if let Some(payload) = reassembler.push(&packet)? {
            return Ok(payload);
        }
    }
}

/// Run the INIT handshake on `cid` with a fresh random nonce
///
/// INIT on an allocated channel aborts whatever the device was doing on it,
/// so this also resynchronizes a channel left mid-transaction. A response
/// that does not echo the nonce is an integrity failure.
pub async fn init<L: HidLink + ?Sized>(link: &L, cid: u32) -> Result<InitResponse> {
    let nonce: [u8; INIT_NONCE_SIZE] = rand::random();
    for packet in packetize(Cmd::Init, cid, &nonce, link.packet_size())? {
        trace!(packet = %hex::encode(&packet), "HID ->");
        link.send(&packet).await?;
    }
    let payload = read_init(link, cid).await?;
    let response = InitResponse::parse(&payload)?;
    if response.nonce != nonce {
        return Err(Error::NonceMismatch);
    }
    debug!(
        cid = format_args!("{:#010x}", response.cid),
        version = response.protocol_version,
        capabilities = format_args!("{:#04x}", response.capabilities),
        "CTAPHID channel initialized"
    );
    Ok(response)
}

/// Allocate a new channel through the broadcast CID
pub async fn open_channel<L: HidLink + ?Sized>(link: &L) -> Result<u32> {
    Ok(init(link, BROADCAST_CID).await?.cid)
}
