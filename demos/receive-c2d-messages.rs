#[path = "loopback.rs"]
mod loopback;

use iothub_device_client::{DispositionResult, IoTHubClient};
use log::info;
use loopback::LoopbackTransport;
use tokio::time;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let connection_string = std::env::var("DEVICE_CONNECTION_STRING").unwrap_or_else(|_| {
        "HostName=iothubname.azure-devices.net;DeviceId=MyDeviceId;SharedAccessKey=c2VjcmV0"
            .to_string()
    });

    let mut transport = LoopbackTransport::default();
    for body in ["first", "second", "reject me"] {
        transport.deliver(body.as_bytes());
    }

    let mut client = IoTHubClient::from_connection_string(&connection_string, transport)?;

    info!("Initialized client");

    client.set_message_callback(|msg| {
        info!("Received message {:?}", msg);
        if msg.body.starts_with(b"reject") {
            DispositionResult::Rejected
        } else {
            DispositionResult::Accepted
        }
    })?;

    let mut interval = time::interval(time::Duration::from_millis(100));
    for _ in 0..10 {
        interval.tick().await;
        client.do_work();
    }

    info!(
        "Last message received at {:?}",
        client.get_last_message_receive_time()
    );

    Ok(())
}
