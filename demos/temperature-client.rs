#[path = "loopback.rs"]
mod loopback;

use chrono::{DateTime, Utc};
use iothub_device_client::{
    ConfirmationResult, ConnectionState, DirectMethodResponse, IoTHubClient, Message,
    TwinUpdateState,
};
use log::{info, warn};
use loopback::LoopbackTransport;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::time;

#[derive(Serialize, Debug)]
struct TemperatureReading {
    timestamp: DateTime<Utc>,
    temperature: f32,
}

struct TemperatureSensor {
    distribution: Normal<f32>,
}

impl TemperatureSensor {
    fn new(mean: f32) -> Self {
        TemperatureSensor {
            distribution: Normal::new(mean, 7.0).unwrap(),
        }
    }

    fn get_reading(&self) -> TemperatureReading {
        TemperatureReading {
            timestamp: Utc::now(),
            temperature: self.distribution.sample(&mut rand::thread_rng()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let connection_string = std::env::var("DEVICE_CONNECTION_STRING").unwrap_or_else(|_| {
        "HostName=iothubname.azure-devices.net;DeviceId=thermostat;SharedAccessKey=c2VjcmV0"
            .to_string()
    });

    let mut transport = LoopbackTransport::default();
    transport.patch_desired(br#"{"targetTemperature":21.0,"$version":2}"#);
    transport.invoke("getMaxMinReport", b"{}");

    let mut client = IoTHubClient::from_connection_string(&connection_string, transport)?;
    client.set_option("model_id", "dtmi:com:example:Thermostat;1".into())?;

    info!("Initialized client");

    client.set_connection_status_callback(|state, reason| {
        if state == ConnectionState::Failed {
            warn!("Connection failed: {:?}", reason);
        } else {
            info!("Connection {:?} ({:?})", state, reason);
        }
    });

    let target = Arc::new(Mutex::new(25.0f32));
    let desired = target.clone();
    client.set_device_twin_callback(move |state, payload| {
        info!("Desired properties ({:?}) {}", state, String::from_utf8_lossy(payload));
        if state != TwinUpdateState::Partial {
            return;
        }
        let patch: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(patch) => patch,
            Err(e) => {
                warn!("Ignoring malformed patch: {}", e);
                return;
            }
        };
        if let Some(t) = patch["targetTemperature"].as_f64() {
            *desired.lock().unwrap() = t as f32;
        }
    })?;

    let readings = Arc::new(Mutex::new(Vec::<f32>::new()));
    let report = readings.clone();
    client.set_device_method_callback(move |method_name, _payload| match method_name {
        "getMaxMinReport" => {
            let readings = report.lock().unwrap();
            let body = serde_json::json!({
                "max": readings.iter().cloned().fold(f32::MIN, f32::max),
                "min": readings.iter().cloned().fold(f32::MAX, f32::min),
                "count": readings.len(),
            });
            DirectMethodResponse::new(200, Some(body.to_string().into_bytes()))
        }
        _ => DirectMethodResponse::new(404, None),
    })?;

    let mut interval = time::interval(time::Duration::from_millis(200));
    for count in 0..20u32 {
        interval.tick().await;

        if count % 5 == 0 {
            let sensor = TemperatureSensor::new(*target.lock().unwrap());
            let reading = sensor.get_reading();
            readings.lock().unwrap().push(reading.temperature);

            let msg = Message::builder()
                .set_body(serde_json::to_vec(&reading)?)
                .set_message_id(format!("{}-t", count))
                .set_content_type("application/json".to_owned())
                .set_content_encoding("utf-8".to_owned())
                .build();
            client.send_event_async(msg, move |result| {
                if result != ConfirmationResult::Ok {
                    warn!("Reading {} not delivered: {:?}", count, result);
                }
            })?;

            let reported = serde_json::json!({ "maxTempSinceLastReboot": reading.temperature });
            client.send_reported_state(&serde_json::to_vec(&reported)?, |result, status| {
                info!("Reported state {:?} ({:?})", result, status)
            })?;
        }

        client.do_work();
    }

    client.destroy();
    Ok(())
}
