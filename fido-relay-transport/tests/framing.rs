//! Framing tests across the three transports

use fido_relay_transport::ble::{self, BleCommand};
use fido_relay_transport::ctaphid::{self, Cmd, Reassembler, PACKET_SIZE};
use fido_relay_transport::pcsc;
use fido_relay_transport::Error;

#[test]
fn test_hid_channels_are_isolated() {
    let a: Vec<u8> = (0..150u8).collect();
    let b: Vec<u8> = (0..150u8).rev().collect();
    let packets_a = ctaphid::packetize(Cmd::Cbor, 0x0000_0001, &a, PACKET_SIZE).unwrap();
    let packets_b = ctaphid::packetize(Cmd::Cbor, 0x0000_0002, &b, PACKET_SIZE).unwrap();

    let mut reader_a = Reassembler::new(0x0000_0001, Cmd::Cbor.to_u8());
    let mut reader_b = Reassembler::new(0x0000_0002, Cmd::Cbor.to_u8());

    // Interleave the two exchanges; each reader only ever sees its own channel
    let mut done_a = None;
    let mut done_b = None;
    for (pa, pb) in packets_a.iter().zip(packets_b.iter()) {
        done_a = reader_a.push(pa).unwrap().or(done_a);
        done_b = reader_b.push(pb).unwrap().or(done_b);
        assert!(matches!(
            reader_a.push(pb),
            Err(Error::ChannelMismatch { .. })
        ));
    }
    assert_eq!(done_a.unwrap(), a);
    assert_eq!(done_b.unwrap(), b);
}

#[test]
fn test_hid_round_trip_at_size_boundaries() {
    for len in [0usize, 1, 57, 58, 57 + 59, 57 + 59 + 1, ctaphid::MAX_MESSAGE_SIZE] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let packets = ctaphid::packetize(Cmd::Ping, 0xCAFE_F00D, &payload, PACKET_SIZE).unwrap();

        let mut reader = Reassembler::new(0xCAFE_F00D, Cmd::Ping.to_u8());
        let (last, rest) = packets.split_last().unwrap();
        for packet in rest {
            assert_eq!(reader.push(packet).unwrap(), None);
        }
        assert_eq!(reader.push(last).unwrap(), Some(payload), "length {len}");
    }
}

#[test]
fn test_ble_frames_never_exceed_packet_size() {
    let payload = vec![0x5A; 1000];
    for size in [ble::MIN_PACKET_SIZE, 64, 185, ble::MAX_PACKET_SIZE] {
        let frames = ble::packetize_message(BleCommand::Msg, &payload, size).unwrap();
        assert!(frames.iter().all(|f| f.len() <= size));
        let carried: usize = frames[0].len() - 3 + frames[1..].iter().map(|f| f.len() - 1).sum::<usize>();
        assert_eq!(carried, payload.len());
    }
}

#[test]
fn test_pcsc_chain_covers_payload() {
    let payload = vec![0x11; pcsc::CHAIN_CHUNK_SIZE * 2];
    let apdus = pcsc::packetize_chained(&payload);
    assert_eq!(apdus.len(), 2);
    assert_eq!(apdus[0][0], 0x90);
    assert_eq!(apdus[1][0], 0x80);
    assert_eq!(apdus[1].len(), 5 + pcsc::CHAIN_CHUNK_SIZE + 1);
}
