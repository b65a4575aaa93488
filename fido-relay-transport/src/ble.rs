//! CTAP over Bluetooth Low Energy
//!
//! Requests are written to the FIDO control point characteristic as a first
//! frame `CMD(1) + LEN(2) + DATA` followed by continuation frames
//! `SEQ(1) + DATA`. Responses arrive as notifications on the status
//! characteristic using the same framing. Frames are never padded.
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#ble>

use crate::error::{Error, Result};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Smallest control point length an authenticator may report
pub const MIN_PACKET_SIZE: usize = 20;

/// Largest control point length an authenticator may report
pub const MAX_PACKET_SIZE: usize = 512;

/// Largest payload the 16-bit length field can describe
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Notification frames buffered between the GATT callback and the reader
pub const NOTIFICATION_QUEUE_DEPTH: usize = 16;

/// FIDO GATT service
pub const FIDO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fffd_0000_1000_8000_00805f9b34fb);

/// fidoControlPoint (write)
pub const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0xf1d0fff1_deaa_ecee_b42f_c9ba7ed623bb);

/// fidoStatus (notify)
pub const STATUS_UUID: Uuid = Uuid::from_u128(0xf1d0fff2_deaa_ecee_b42f_c9ba7ed623bb);

/// fidoControlPointLength (read)
pub const CONTROL_POINT_LENGTH_UUID: Uuid =
    Uuid::from_u128(0xf1d0fff3_deaa_ecee_b42f_c9ba7ed623bb);

/// fidoServiceRevisionBitfield (read/write)
pub const SERVICE_REVISION_BITFIELD_UUID: Uuid =
    Uuid::from_u128(0xf1d0fff4_deaa_ecee_b42f_c9ba7ed623bb);

/// fidoServiceRevision (read)
pub const SERVICE_REVISION_UUID: Uuid = Uuid::from_u128(0x00002a28_0000_1000_8000_00805f9b34fb);

/// First frame header: CMD(1) + LEN(2)
const HEADER_SIZE: usize = 3;

/// Sequence numbers wrap back to zero after this value
const MAX_SEQ: u8 = 0x7F;

/// CTAP BLE commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BleCommand {
    Ping = 0x81,
    Keepalive = 0x82,
    Msg = 0x83,
    Cancel = 0xBE,
    Error = 0xBF,
}

impl BleCommand {
    /// Convert from u8 value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x81 => Some(BleCommand::Ping),
            0x82 => Some(BleCommand::Keepalive),
            0x83 => Some(BleCommand::Msg),
            0xBE => Some(BleCommand::Cancel),
            0xBF => Some(BleCommand::Error),
            _ => None,
        }
    }

    /// Convert to u8 value
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Check a `fidoControlPointLength` value
///
/// Out of range values are a device fault and are never clamped.
pub fn validate_packet_size(len: usize) -> Result<usize> {
    if (MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&len) {
        Ok(len)
    } else {
        Err(Error::InvalidPacketSize(len))
    }
}

/// Split `payload` into control point frames of at most `packet_size` bytes
pub fn packetize_message(
    command: BleCommand,
    payload: &[u8],
    packet_size: usize,
) -> Result<Vec<Vec<u8>>> {
    let packet_size = validate_packet_size(packet_size)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge(payload.len()));
    }

    let first = payload.len().min(packet_size - HEADER_SIZE);
    let mut frames = Vec::with_capacity(1 + (payload.len() - first).div_ceil(packet_size - 1));

    let mut frame = Vec::with_capacity(HEADER_SIZE + first);
    frame.push(command.to_u8());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload[..first]);
    frames.push(frame);

    let mut seq = 0u8;
    for chunk in payload[first..].chunks(packet_size - 1) {
        let mut frame = Vec::with_capacity(1 + chunk.len());
        frame.push(seq);
        frame.extend_from_slice(chunk);
        frames.push(frame);
        seq = if seq == MAX_SEQ { 0 } else { seq + 1 };
    }

    Ok(frames)
}

/// Sender half handed to the GATT notification callback
pub type NotificationSender = mpsc::Sender<Vec<u8>>;

/// Receiver half consumed by [`send_and_receive`]
pub type NotificationReceiver = mpsc::Receiver<Vec<u8>>;

/// Bounded queue carrying status notifications to the reader
pub fn notification_channel() -> (NotificationSender, NotificationReceiver) {
    mpsc::channel(NOTIFICATION_QUEUE_DEPTH)
}

/// GATT operations needed to talk to a FIDO BLE authenticator
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Read `fidoControlPointLength`
    async fn read_control_point_length(&self) -> Result<u16>;

    /// Write one frame to `fidoControlPoint`
    async fn write_control_point(&self, frame: &[u8]) -> Result<()>;
}

async fn next_notification(notifications: &mut NotificationReceiver) -> Result<Vec<u8>> {
    let frame = notifications.recv().await.ok_or(Error::Disconnected)?;
    trace!(frame = %hex::encode(&frame), "BLE <-");
    Ok(frame)
}

/// Consume keepalive frames and return the first frame that is not one
async fn skip_keepalives(notifications: &mut NotificationReceiver) -> Result<Vec<u8>> {
    loop {
        let frame = next_notification(notifications).await?;
        match frame.first() {
            Some(&b) if b == BleCommand::Keepalive.to_u8() => {
                trace!(status = frame.get(1).copied(), "Skipping BLE keepalive");
            }
            _ => return Ok(frame),
        }
    }
}

/// Parse a response header frame into `(command, declared length, data)`
fn parse_header(frame: &[u8]) -> Result<(u8, usize, &[u8])> {
    let Some(&command) = frame.first() else {
        return Err(Error::InvalidPacket("empty BLE frame"));
    };
    if command & 0x80 == 0 {
        return Err(Error::InvalidPacket("BLE response header without command bit"));
    }
    if command == BleCommand::Error.to_u8() {
        return Err(Error::DeviceError(frame.get(3).copied().unwrap_or(0)));
    }
    if frame.len() < HEADER_SIZE {
        return Err(Error::InvalidPacket("BLE response header shorter than 3 bytes"));
    }
    let len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
    Ok((command, len, &frame[HEADER_SIZE..]))
}

/// Write `payload` to the control point as `command` frames
pub async fn send_message<L: BleLink + ?Sized>(
    link: &L,
    command: BleCommand,
    payload: &[u8],
    packet_size: usize,
) -> Result<()> {
    for frame in packetize_message(command, payload, packet_size)? {
        trace!(frame = %hex::encode(&frame), "BLE ->");
        link.write_control_point(&frame).await?;
    }
    Ok(())
}

/// Read one complete response message from `notifications`
///
/// Keepalive frames are skipped before the response header is parsed. With
/// `resync` set, continuation frames that arrive before any header are the
/// tail of a response whose reader went away and are dropped as well.
pub async fn receive_message(
    notifications: &mut NotificationReceiver,
    resync: bool,
) -> Result<Vec<u8>> {
    let header = loop {
        let frame = skip_keepalives(notifications).await?;
        match frame.first() {
            Some(&b) if resync && b & 0x80 == 0 => {
                debug!(seq = b, "Dropping continuation frame of an abandoned response");
            }
            _ => break frame,
        }
    };
    let (response_command, total, data) = parse_header(&header)?;
    debug!(
        command = format_args!("{:#04x}", response_command),
        len = total,
        "BLE response header"
    );

    let mut response = Vec::with_capacity(total);
    response.extend_from_slice(&data[..data.len().min(total)]);

    let mut seq = 0u8;
    while response.len() < total {
        let frame = next_notification(notifications).await?;
        let Some((&actual, data)) = frame.split_first() else {
            return Err(Error::InvalidPacket("empty BLE frame"));
        };
        if actual != seq {
            return Err(Error::InvalidSequence {
                expected: seq,
                actual,
            });
        }
        let take = (total - response.len()).min(data.len());
        response.extend_from_slice(&data[..take]);
        seq = if seq == MAX_SEQ { 0 } else { seq + 1 };
    }

    Ok(response)
}

/// Write `payload` as `command` frames and read the response from `notifications`
pub async fn send_and_receive<L: BleLink + ?Sized>(
    link: &L,
    notifications: &mut NotificationReceiver,
    command: BleCommand,
    payload: &[u8],
    packet_size: usize,
) -> Result<Vec<u8>> {
    send_message(link, command, payload, packet_size).await?;
    receive_message(notifications, false).await
}
