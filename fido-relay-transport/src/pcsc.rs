//! CTAP over ISO 7816-4 APDUs (NFC and contact smartcards through PC/SC)
//!
//! CTAP2 requests travel as `NFCCTAP_MSG` commands (`CLA=80 INS=10`), either
//! as one extended length APDU or as a chain of short APDUs. Responses ending
//! in `61XX` are continued with GET RESPONSE.
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#nfc>

use crate::error::{Error, Result};

use async_trait::async_trait;
use tracing::{debug, trace};

/// SELECT the FIDO applet (AID `A0000006472F0001`)
pub const SELECT_APPLET: [u8; 14] = [
    0x00, 0xA4, 0x04, 0x00, 0x08, 0xA0, 0x00, 0x00, 0x06, 0x47, 0x2F, 0x00, 0x01, 0x00,
];

/// GET RESPONSE with `Le = 00`
pub const GET_RESPONSE: [u8; 5] = [0x00, 0xC0, 0x00, 0x00, 0x00];

/// Largest payload of an extended length APDU
pub const MAX_EXTENDED_PAYLOAD: usize = 65535;

/// Largest data field of one chained short APDU
pub const CHAIN_CHUNK_SIZE: usize = 254;

/// GET RESPONSE rounds allowed for one response
///
/// Enough for a 65535 byte body delivered 256 bytes at a time; a card still
/// answering `61XX` after that is treated as hung.
pub const MAX_GET_RESPONSE_ROUNDS: usize = MAX_EXTENDED_PAYLOAD / 256 + 1;

const CLA_LAST: u8 = 0x80;
const CLA_CHAINED: u8 = 0x90;
const INS_NFCCTAP_MSG: u8 = 0x10;

/// Two-byte ISO 7816 status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);

    /// Split a raw response into data and trailing status word
    pub fn split(response: &[u8]) -> Result<(&[u8], StatusWord)> {
        if response.len() < 2 {
            return Err(Error::Truncated {
                expected: 2,
                actual: response.len(),
            });
        }
        let (data, sw) = response.split_at(response.len() - 2);
        Ok((data, StatusWord(u16::from_be_bytes([sw[0], sw[1]]))))
    }

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// `Some(remaining)` for a `61XX` status
    pub fn more_data(self) -> Option<u8> {
        if self.0 >> 8 == 0x61 {
            Some(self.0 as u8)
        } else {
            None
        }
    }
}

/// One extended APDU: `80 10 00 00 | 00 Lc(2) | data | 00 00`
pub fn packetize_extended(payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    if payload.len() > MAX_EXTENDED_PAYLOAD {
        return Err(Error::MessageTooLarge(payload.len()));
    }
    let mut apdu = Vec::with_capacity(payload.len() + 9);
    apdu.extend_from_slice(&[CLA_LAST, INS_NFCCTAP_MSG, 0x00, 0x00, 0x00]);
    apdu.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    apdu.extend_from_slice(payload);
    apdu.extend_from_slice(&[0x00, 0x00]);
    Ok(vec![apdu])
}

/// Chained short APDUs carrying at most [`CHAIN_CHUNK_SIZE`] bytes each
///
/// Every APDU but the last has CLA `90`; the last has CLA `80` and `Le = 00`.
pub fn packetize_chained(payload: &[u8]) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![vec![CLA_LAST, INS_NFCCTAP_MSG, 0x00, 0x00, 0x00]];
    }

    let chunks: Vec<&[u8]> = payload.chunks(CHAIN_CHUNK_SIZE).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let cla = if i == last { CLA_LAST } else { CLA_CHAINED };
            let mut apdu = Vec::with_capacity(chunk.len() + 6);
            apdu.extend_from_slice(&[cla, INS_NFCCTAP_MSG, 0x00, 0x00, chunk.len() as u8]);
            apdu.extend_from_slice(chunk);
            if i == last {
                apdu.push(0x00);
            }
            apdu
        })
        .collect()
}

/// Raw APDU exchange with a card
#[async_trait]
pub trait ApduTransmitter: Send + Sync {
    /// Send one command APDU and return the full response including the status word
    async fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>>;
}

async fn exchange<T: ApduTransmitter + ?Sized>(transmitter: &T, apdu: &[u8]) -> Result<Vec<u8>> {
    trace!(apdu = %hex::encode(apdu), "APDU ->");
    let response = transmitter.transmit(apdu).await?;
    trace!(response = %hex::encode(&response), "APDU <-");
    Ok(response)
}

/// SELECT the FIDO applet and return its version string (`FIDO_2_0` or `U2F_V2`)
pub async fn select<T: ApduTransmitter + ?Sized>(transmitter: &T) -> Result<Vec<u8>> {
    let response = exchange(transmitter, &SELECT_APPLET).await?;
    let (data, sw) = StatusWord::split(&response)?;
    if !sw.is_success() {
        return Err(Error::ApduStatus(sw.0));
    }
    debug!(version = %String::from_utf8_lossy(data), "FIDO applet selected");
    Ok(data.to_vec())
}

/// Send `payload` as NFCCTAP_MSG and collect the full response body
pub async fn send_and_receive<T: ApduTransmitter + ?Sized>(
    transmitter: &T,
    payload: &[u8],
    select_applet: bool,
    use_extended: bool,
) -> Result<Vec<u8>> {
    if select_applet {
        select(transmitter).await?;
    }

    let apdus = if use_extended {
        packetize_extended(payload)?
    } else {
        packetize_chained(payload)
    };
    let Some((last, chained)) = apdus.split_last() else {
        return Err(Error::InvalidArgument("no APDU to send"));
    };

    for apdu in chained {
        let response = exchange(transmitter, apdu).await?;
        let (_, sw) = StatusWord::split(&response)?;
        if !sw.is_success() {
            return Err(Error::ApduStatus(sw.0));
        }
    }

    let mut body = Vec::new();
    let mut response = exchange(transmitter, last).await?;
    let mut rounds = 0;
    loop {
        let (data, sw) = StatusWord::split(&response)?;
        body.extend_from_slice(data);
        if sw.is_success() {
            return Ok(body);
        }
        match sw.more_data() {
            Some(_) if rounds == MAX_GET_RESPONSE_ROUNDS => {
                debug!(rounds, received = body.len(), "Card never finished its response");
                return Err(Error::Timeout);
            }
            Some(remaining) => {
                trace!(remaining, "Continuing with GET RESPONSE");
                rounds += 1;
                response = exchange(transmitter, &GET_RESPONSE).await?;
            }
            None => return Err(Error::ApduStatus(sw.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records every command APDU
    struct ScriptedCard {
        responses: Mutex<VecDeque<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedCard {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ApduTransmitter for ScriptedCard {
        async fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>> {
            self.sent.lock().unwrap().push(apdu.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(Error::Disconnected)
        }
    }

    #[test]
    fn test_extended_apdu_layout() {
        let apdus = packetize_extended(&[0x04]).unwrap();
        assert_eq!(
            apdus,
            vec![vec![0x80, 0x10, 0x00, 0x00, 0x00, 0x00, 0x01, 0x04, 0x00, 0x00]]
        );

        let big = vec![0xAB; 300];
        let apdu = &packetize_extended(&big).unwrap()[0];
        assert_eq!(&apdu[4..7], &[0x00, 0x01, 0x2C]);
        assert_eq!(apdu.len(), 300 + 9);

        assert_eq!(
            packetize_extended(&vec![0u8; MAX_EXTENDED_PAYLOAD + 1]).unwrap_err(),
            Error::MessageTooLarge(MAX_EXTENDED_PAYLOAD + 1)
        );
    }

    #[test]
    fn test_chained_empty_payload() {
        assert_eq!(packetize_chained(&[]), vec![vec![0x80, 0x10, 0x00, 0x00, 0x00]]);
    }

    #[test]
    fn test_chained_apdus() {
        let payload: Vec<u8> = (0..600u16).map(|i| i as u8).collect();
        let apdus = packetize_chained(&payload);

        assert_eq!(apdus.len(), 3);
        assert_eq!(&apdus[0][..5], &[0x90, 0x10, 0x00, 0x00, 254]);
        assert_eq!(apdus[0].len(), 5 + 254);
        assert_eq!(&apdus[1][..5], &[0x90, 0x10, 0x00, 0x00, 254]);
        assert_eq!(&apdus[2][..5], &[0x80, 0x10, 0x00, 0x00, 92]);
        assert_eq!(apdus[2].len(), 5 + 92 + 1);
        assert_eq!(*apdus[2].last().unwrap(), 0x00);

        let rebuilt: Vec<u8> = apdus
            .iter()
            .enumerate()
            .flat_map(|(i, apdu)| {
                let end = if i == apdus.len() - 1 { apdu.len() - 1 } else { apdu.len() };
                apdu[5..end].to_vec()
            })
            .collect();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn test_status_word() {
        let (data, sw) = StatusWord::split(&[0x01, 0x02, 0x61, 0x0A]).unwrap();
        assert_eq!(data, &[0x01, 0x02]);
        assert_eq!(sw.more_data(), Some(0x0A));
        assert!(!sw.is_success());
        assert!(StatusWord(0x9000).is_success());
        assert_eq!(StatusWord(0x6A82).more_data(), None);
        assert!(StatusWord::split(&[0x90]).is_err());
    }

    #[tokio::test]
    async fn test_get_response_continuation() {
        let card = ScriptedCard::new(vec![
            vec![0x90, 0x00],
            vec![0x00, 0xA1, 0x61, 0x0A],
            vec![0x01, 0x02, 0x90, 0x00],
        ]);

        let body = send_and_receive(&card, &[0x04], true, true).await.unwrap();
        assert_eq!(body, vec![0x00, 0xA1, 0x01, 0x02]);

        let sent = card.sent();
        assert_eq!(sent[0], SELECT_APPLET.to_vec());
        assert_eq!(sent[2], GET_RESPONSE.to_vec());
    }

    #[tokio::test]
    async fn test_endless_get_response_is_bounded() {
        let mut responses = vec![vec![0x00, 0x61, 0x00]];
        responses.extend((0..MAX_GET_RESPONSE_ROUNDS + 10).map(|_| vec![0xEE, 0x61, 0x00]));
        let card = ScriptedCard::new(responses);

        let err = send_and_receive(&card, &[0x04], false, true)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Timeout);

        let sent = card.sent();
        assert_eq!(sent.len(), 1 + MAX_GET_RESPONSE_ROUNDS);
        assert!(sent[1..].iter().all(|apdu| apdu == &GET_RESPONSE.to_vec()));
    }

    #[tokio::test]
    async fn test_select_failure() {
        let card = ScriptedCard::new(vec![vec![0x6A, 0x82]]);
        let err = send_and_receive(&card, &[0x04], true, false)
            .await
            .unwrap_err();
        assert_eq!(err, Error::ApduStatus(0x6A82));
        assert_eq!(card.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_chain_aborts_on_intermediate_status() {
        let card = ScriptedCard::new(vec![vec![0x69, 0x85]]);
        let err = send_and_receive(&card, &vec![0u8; 300], false, false)
            .await
            .unwrap_err();
        assert_eq!(err, Error::ApduStatus(0x6985));
        assert_eq!(card.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_status_carries_word() {
        let card = ScriptedCard::new(vec![vec![0x90, 0x00], vec![0x6F, 0x00]]);
        let err = send_and_receive(&card, &vec![0u8; 300], false, false)
            .await
            .unwrap_err();
        assert_eq!(err, Error::ApduStatus(0x6F00));
    }

    #[tokio::test]
    async fn test_short_response_is_framing_error() {
        let card = ScriptedCard::new(vec![vec![0x90]]);
        let err = send_and_receive(&card, &[0x04], false, true)
            .await
            .unwrap_err();
        assert!(err.is_framing());
    }
}
