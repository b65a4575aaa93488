//! Run a CTAPHID gateway in front of a software authenticator and talk to it
//! as a host would.
//!
//! Run with: `RUST_LOG=fido_relay=debug cargo run --example gateway_loopback`

use fido_relay::cbor::MapBuilder;
use fido_relay::transport::ctaphid::{self, Cmd};
use fido_relay::{hid_pipe, Device, GatewayConfig, HidGateway, Result, StaticDeviceList};

use async_trait::async_trait;
use ciborium::Value;

use std::sync::Arc;
use std::time::Duration;

/// authenticatorGetInfo command byte
const GET_INFO: u8 = 0x04;

/// CTAP2_ERR_INVALID_COMMAND
const INVALID_COMMAND: u8 = 0x01;

/// Answers authenticatorGetInfo and nothing else
struct InfoOnlyAuthenticator;

#[async_trait]
impl Device for InfoOnlyAuthenticator {
    fn description(&self) -> String {
        "info-only software authenticator".into()
    }

    async fn send_cbor(&self, request: &[u8]) -> Result<Vec<u8>> {
        if request.first() != Some(&GET_INFO) {
            return Ok(vec![INVALID_COMMAND]);
        }
        let info = MapBuilder::new()
            .insert(0x01, Value::Array(vec![Value::Text("FIDO_2_0".into())]))
            .insert_bytes(0x03, &[0u8; 16])
            .insert(0x06, Value::Array(vec![Value::Integer(2.into())]))
            .build()?;

        let mut response = vec![0x00];
        response.extend_from_slice(&info);
        Ok(response)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Virtual CTAPHID gateway example");

    let devices = Arc::new(StaticDeviceList::new());
    let config = GatewayConfig::builder()
        .request_timeout(Duration::from_secs(5))
        .build();
    let (io, host) = hid_pipe();
    let gateway = HidGateway::new(Arc::new(io), devices.clone(), config);

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        gateway
            .run(async {
                let _ = stopped.await;
            })
            .await
    });

    let init = ctaphid::init(&host, ctaphid::BROADCAST_CID).await?;
    println!(
        "Channel {:#010x} (protocol {}, capabilities {:#04x})",
        init.cid, init.protocol_version, init.capabilities
    );

    let echoed = ctaphid::transact(&host, init.cid, Cmd::Ping, b"hello gateway").await?;
    println!("PING echoed: {}", String::from_utf8_lossy(&echoed));

    // The gateway keeps polling until a device shows up
    let attach = {
        let devices = devices.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            println!("Attaching authenticator");
            devices.add(Arc::new(InfoOnlyAuthenticator));
        })
    };

    let response = ctaphid::transact(&host, init.cid, Cmd::Cbor, &[GET_INFO]).await?;
    println!("authenticatorGetInfo status {:#04x}", response[0]);
    println!("  {}", hex::encode(&response[1..]));

    let _ = attach.await;
    let _ = stop.send(());
    if let Ok(result) = server.await {
        result?;
    }
    println!("Gateway stopped");
    Ok(())
}
