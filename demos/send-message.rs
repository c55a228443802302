#[macro_use]
extern crate log;

#[path = "loopback.rs"]
mod loopback;

use iothub_device_client::{ConfirmationResult, IoTHubClient, Message, RetryPolicyKind};
use loopback::LoopbackTransport;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time;

#[derive(Debug, Deserialize)]
struct DeviceConfig {
    connection_string: String,
    retry_policy: String,
    retry_timeout_secs: u64,
}

impl DeviceConfig {
    fn from_env() -> Result<Self, config::ConfigError> {
        let mut cfg = config::Config::default();
        cfg.set_default(
            "connection_string",
            "HostName=iothubname.azure-devices.net;DeviceId=MyDeviceId;SharedAccessKey=c2VjcmV0",
        )?;
        cfg.set_default("retry_policy", "exponential_backoff_with_jitter")?;
        cfg.set_default("retry_timeout_secs", 0)?;
        cfg.merge(config::File::with_name("demos/config").required(false))?;
        cfg.merge(config::Environment::with_prefix("IOTHUB"))?;
        cfg.try_into()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let DeviceConfig {
        connection_string,
        retry_policy,
        retry_timeout_secs,
    } = DeviceConfig::from_env()?;

    let mut client = IoTHubClient::builder(LoopbackTransport::default())
        .connection_string(connection_string)?
        .retry_policy(retry_policy.parse::<RetryPolicyKind>()?, retry_timeout_secs)
        .build()?;

    info!("Initialized client");

    let confirmed = Arc::new(AtomicU32::new(0));
    for count in 0..5 {
        let msg = Message::builder()
            .set_body(b"Hello, world!".to_vec())
            .set_message_id(format!("{}-t", count))
            .build();

        let confirmed = confirmed.clone();
        client.send_event_async(msg, move |result| {
            if result == ConfirmationResult::Ok {
                confirmed.fetch_add(1, Ordering::SeqCst);
            } else {
                warn!("Message {} not confirmed: {:?}", count, result);
            }
        })?;
    }

    let mut interval = time::interval(time::Duration::from_millis(100));
    while confirmed.load(Ordering::SeqCst) < 5 {
        interval.tick().await;
        client.do_work();
    }

    info!("All messages confirmed");
    client.destroy();

    Ok(())
}
