use super::Device;
use crate::error::Result;

use fido_relay_transport::pcsc::{self, ApduTransmitter};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

/// Authenticator behind a PC/SC reader (NFC or contact)
///
/// The FIDO applet is selected before the first command and again after any
/// failed exchange.
pub struct PcscAuthenticator<T> {
    transmitter: T,
    description: String,
    use_extended: bool,
    selected: Mutex<bool>,
}

impl<T: ApduTransmitter> PcscAuthenticator<T> {
    /// Create an authenticator that frames requests as chained short APDUs
    pub fn new(transmitter: T, description: impl Into<String>) -> Self {
        Self {
            transmitter,
            description: description.into(),
            use_extended: false,
            selected: Mutex::new(false),
        }
    }

    /// Use a single extended length APDU per request instead of chaining
    pub fn with_extended_apdus(mut self, use_extended: bool) -> Self {
        self.use_extended = use_extended;
        self
    }
}

#[async_trait]
impl<T: ApduTransmitter> Device for PcscAuthenticator<T> {
    fn description(&self) -> String {
        self.description.clone()
    }

    async fn send_cbor(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut selected = self.selected.lock().await;
        let result =
            pcsc::send_and_receive(&self.transmitter, request, !*selected, self.use_extended).await;
        *selected = result.is_ok();
        if let Err(e) = &result {
            warn!(device = %self.description, error = %e, "APDU exchange failed");
        }
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    use fido_relay_transport::pcsc::SELECT_APPLET;

    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct ScriptedReader {
        responses: StdMutex<VecDeque<Vec<u8>>>,
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl ScriptedReader {
        fn queue(&self, response: &[u8]) {
            self.responses.lock().unwrap().push_back(response.to_vec());
        }

        fn selects(&self) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|apdu| apdu.as_slice() == SELECT_APPLET)
                .count()
        }
    }

    #[async_trait]
    impl ApduTransmitter for ScriptedReader {
        async fn transmit(&self, apdu: &[u8]) -> fido_relay_transport::Result<Vec<u8>> {
            self.sent.lock().unwrap().push(apdu.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(fido_relay_transport::Error::Disconnected)
        }
    }

    #[tokio::test]
    async fn test_select_once_then_reselect_after_failure() {
        let device = PcscAuthenticator::new(ScriptedReader::default(), "nfc key");
        let reader = &device.transmitter;

        reader.queue(b"FIDO_2_0\x90\x00");
        reader.queue(&[0x00, 0xA0, 0x90, 0x00]);
        assert_eq!(device.send_cbor(&[0x04]).await.unwrap(), vec![0x00, 0xA0]);

        reader.queue(&[0x00, 0x90, 0x00]);
        assert_eq!(device.send_cbor(&[0x04]).await.unwrap(), vec![0x00]);
        assert_eq!(reader.selects(), 1);

        reader.queue(&[0x6F, 0x00]);
        assert_eq!(
            device.send_cbor(&[0x04]).await.unwrap_err(),
            Error::Transport(fido_relay_transport::Error::ApduStatus(0x6F00))
        );

        reader.queue(b"FIDO_2_0\x90\x00");
        reader.queue(&[0x00, 0x90, 0x00]);
        device.send_cbor(&[0x04]).await.unwrap();
        assert_eq!(reader.selects(), 2);
    }

    #[tokio::test]
    async fn test_extended_apdu_mode() {
        let device =
            PcscAuthenticator::new(ScriptedReader::default(), "reader").with_extended_apdus(true);
        device.transmitter.queue(b"FIDO_2_0\x90\x00");
        device.transmitter.queue(&[0x00, 0x90, 0x00]);
        device.send_cbor(&[0x04]).await.unwrap();

        let sent = device.transmitter.sent.lock().unwrap();
        assert_eq!(sent[1], vec![0x80, 0x10, 0x00, 0x00, 0x00, 0x00, 0x01, 0x04, 0x00, 0x00]);
    }
}
