mod common;

use common::{client, client_with_clock, pump, MockTransport};
use iothub_device_client::{
    ConfirmationResult, ConnectionState, ConnectionStatusReason, DeliveryTag, DirectMethodResponse,
    DispositionResult, IoTHubClient, IoTHubError, ManualClock, Message, MethodId, RetryPolicyKind,
    SendStatus, Subscription, TransportEvent, TwinUpdateState,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn results<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<T>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    (seen.clone(), seen)
}

fn message(n: u32) -> Message {
    Message::builder()
        .set_body(format!("Message #{}", n).into_bytes())
        .set_message_id(format!("{}-t", n))
        .build()
}

#[test]
fn test_connect_from_connection_string() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    assert_eq!(client.descriptor().device_id, "test-device");
    assert_eq!(transport.script().registered.as_deref(), Some("test-device"));
    // Nothing asked for a connection yet
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(transport.script().opens, 0);
}

#[test]
fn test_bad_connection_string() {
    let result = IoTHubClient::from_connection_string("HostName=hub;SharedAccessKey=c2VjcmV0", MockTransport::new());
    assert!(matches!(result, Err(IoTHubError::Token(_))));
}

#[test]
fn test_send_event_completes_once_on_ack() {
    let transport = MockTransport::acking(ConfirmationResult::Ok);
    let mut client = client(transport.clone());
    let (seen, sink) = results();

    client
        .send_event_async(message(0), move |result| sink.lock().unwrap().push(result))
        .unwrap();
    assert_eq!(client.get_send_status(), SendStatus::Busy);

    pump(&mut client, 5);

    assert_eq!(*seen.lock().unwrap(), vec![ConfirmationResult::Ok]);
    assert_eq!(client.get_send_status(), SendStatus::Idle);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(transport.script().sent.len(), 1);
    assert_eq!(transport.script().sent[0].1.message_id(), Some("0-t"));
}

#[test]
fn test_send_event_reports_transport_failure_once() {
    let transport = MockTransport::acking(ConfirmationResult::Error);
    let mut client = client(transport);
    let (seen, sink) = results();

    client
        .send_event_async(message(0), move |result| sink.lock().unwrap().push(result))
        .unwrap();
    pump(&mut client, 5);
    client.destroy();

    assert_eq!(*seen.lock().unwrap(), vec![ConfirmationResult::Error]);
}

#[test]
fn test_rejected_submission_completes_with_error() {
    let transport = MockTransport::new();
    transport.script().reject_sends = true;
    let mut client = client(transport);
    let (seen, sink) = results();

    client
        .send_event_async(message(0), move |result| sink.lock().unwrap().push(result))
        .unwrap();
    pump(&mut client, 3);

    assert_eq!(*seen.lock().unwrap(), vec![ConfirmationResult::Error]);
}

#[test]
fn test_oversized_message_is_rejected() {
    let mut client = client(MockTransport::new());
    let result = client.send_event_async(Message::new(vec![0; 256 * 1024 + 1]), |_| {});
    assert!(matches!(result, Err(IoTHubError::InvalidArgument(_))));
    assert_eq!(client.get_send_status(), SendStatus::Idle);
}

#[test]
fn test_full_registry_is_out_of_memory() {
    let mut client = client(MockTransport::new());
    client
        .set_option("max_pending_operations", json!(2))
        .unwrap();
    client.send_event_async(message(0), |_| {}).unwrap();
    client.send_event_async(message(1), |_| {}).unwrap();
    assert!(matches!(
        client.send_event_async(message(2), |_| {}),
        Err(IoTHubError::OutOfMemory(_))
    ));
}

#[test]
fn test_destroy_completes_outstanding_oldest_first() {
    let transport = MockTransport::new();
    let mut client = client(transport.clone());
    let (seen, _) = results::<(u32, ConfirmationResult)>();

    for n in 0..3 {
        let sink = seen.clone();
        client
            .send_event_async(message(n), move |result| sink.lock().unwrap().push((n, result)))
            .unwrap();
    }
    client.destroy();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (0, ConfirmationResult::BecauseDestroy),
            (1, ConfirmationResult::BecauseDestroy),
            (2, ConfirmationResult::BecauseDestroy),
        ]
    );
    assert!(transport.script().closed);
}

#[test]
fn test_drop_completes_outstanding() {
    let (seen, sink) = results();
    {
        let mut client = client(MockTransport::new());
        client
            .send_event_async(message(0), move |result| sink.lock().unwrap().push(result))
            .unwrap();
    }
    assert_eq!(*seen.lock().unwrap(), vec![ConfirmationResult::BecauseDestroy]);
}

#[test]
fn test_status_callback_sees_every_transition() {
    let transport = MockTransport::new();
    let mut client = client(transport);
    let (seen, sink) = results();
    client.set_connection_status_callback(move |state, reason| {
        sink.lock().unwrap().push((state, reason))
    });

    client.connect();
    pump(&mut client, 3);
    client.destroy();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (ConnectionState::Connecting, ConnectionStatusReason::Ok),
            (ConnectionState::Connected, ConnectionStatusReason::Ok),
            (ConnectionState::Destroyed, ConnectionStatusReason::ClientClosed),
        ]
    );
}

#[test]
fn test_interval_retry_gives_up_when_next_wait_crosses_limit() {
    let clock = ManualClock::new();
    let transport = MockTransport::new();
    transport.script().fail_open = true;
    let mut client = client_with_clock(transport.clone(), &clock);
    client.set_retry_policy(RetryPolicyKind::Interval, 12).unwrap();
    client.set_option("retry_interval_sec", json!(5)).unwrap();
    let (seen, sink) = results();
    client.set_connection_status_callback(move |state, reason| {
        sink.lock().unwrap().push((state, reason))
    });

    client.connect();
    let summary = client.do_work();
    assert_eq!(summary.state, ConnectionState::RetryWait);
    assert_eq!(summary.transitions, 2);

    clock.advance(Duration::from_secs(4));
    assert_eq!(client.do_work().state, ConnectionState::RetryWait);

    clock.advance(Duration::from_secs(1));
    assert_eq!(client.do_work().state, ConnectionState::RetryWait);
    assert_eq!(transport.script().opens, 2);

    clock.advance(Duration::from_secs(5));
    assert_eq!(client.do_work().state, ConnectionState::Failed);
    assert_eq!(transport.script().opens, 3);

    // Stays failed on its own
    clock.advance(Duration::from_secs(120));
    pump(&mut client, 3);
    assert_eq!(client.connection_state(), ConnectionState::Failed);
    assert_eq!(transport.script().opens, 3);

    assert_eq!(
        seen.lock().unwrap().last(),
        Some(&(ConnectionState::Failed, ConnectionStatusReason::RetryExpired))
    );
}

#[test]
fn test_lowered_timeout_expires_a_running_wait() {
    let clock = ManualClock::new();
    let transport = MockTransport::new();
    transport.script().fail_open = true;
    let mut client = client_with_clock(transport.clone(), &clock);
    client.set_retry_policy(RetryPolicyKind::Interval, 0).unwrap();
    client.set_option("retry_interval_sec", json!(5)).unwrap();
    let (seen, sink) = results();
    client.set_connection_status_callback(move |state, reason| {
        sink.lock().unwrap().push((state, reason))
    });

    client.connect();
    assert_eq!(client.do_work().state, ConnectionState::RetryWait);

    clock.advance(Duration::from_secs(3));
    client.set_retry_policy(RetryPolicyKind::Interval, 2).unwrap();
    assert_eq!(client.do_work().state, ConnectionState::Failed);
    assert_eq!(transport.script().opens, 1);
    assert_eq!(
        seen.lock().unwrap().last(),
        Some(&(ConnectionState::Failed, ConnectionStatusReason::RetryExpired))
    );
}

#[test]
fn test_retry_delays_beyond_a_year_are_rejected() {
    let clock = ManualClock::new();
    let transport = MockTransport::new();
    transport.script().fail_open = true;
    let mut client = client_with_clock(transport.clone(), &clock);
    client.set_retry_policy(RetryPolicyKind::Interval, 0).unwrap();

    for name in ["retry_interval_sec", "retry_max_delay_secs"] {
        assert!(matches!(
            client.set_option(name, json!(u64::MAX)),
            Err(IoTHubError::InvalidArgument(_))
        ));
    }
    assert_eq!(client.get_option("retry_interval_sec"), Some(json!(1)));

    client.connect();
    pump(&mut client, 3);
    assert_eq!(client.connection_state(), ConnectionState::RetryWait);
}

#[test]
fn test_follow_up_sends_go_through_a_channel() {
    let transport = MockTransport::acking(ConfirmationResult::Ok);
    let mut client = client(transport.clone());
    let (tx, rx) = std::sync::mpsc::channel();

    let confirmed = tx.clone();
    client
        .send_event_async(message(0), move |result| {
            confirmed.send((0, result)).unwrap()
        })
        .unwrap();
    for _ in 0..10 {
        client.do_work();
        while let Ok((n, result)) = rx.try_recv() {
            assert_eq!(result, ConfirmationResult::Ok);
            if n < 2 {
                let confirmed = tx.clone();
                client
                    .send_event_async(message(n + 1), move |result| {
                        confirmed.send((n + 1, result)).unwrap()
                    })
                    .unwrap();
            }
        }
    }

    let sent: Vec<_> = transport
        .script()
        .sent
        .iter()
        .map(|(_, m)| m.message_id().map(str::to_string))
        .collect();
    assert_eq!(
        sent,
        vec![
            Some("0-t".to_string()),
            Some("1-t".to_string()),
            Some("2-t".to_string())
        ]
    );
    assert_eq!(client.get_send_status(), SendStatus::Idle);
}

#[test]
fn test_sends_while_failed_are_held_until_reconnect() {
    let clock = ManualClock::new();
    let transport = MockTransport::acking(ConfirmationResult::Ok);
    transport.script().fail_open = true;
    let mut client = client_with_clock(transport.clone(), &clock);
    client.set_retry_policy(RetryPolicyKind::None, 0).unwrap();

    client.connect();
    client.do_work();
    assert_eq!(client.connection_state(), ConnectionState::Failed);

    let (seen, sink) = results();
    client
        .send_event_async(message(1), move |result| sink.lock().unwrap().push(result))
        .unwrap();
    pump(&mut client, 3);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(client.get_send_status(), SendStatus::Busy);

    transport.script().fail_open = false;
    client.reconnect();
    pump(&mut client, 3);

    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(*seen.lock().unwrap(), vec![ConfirmationResult::Ok]);
}

#[test]
fn test_dropped_connection_is_retried() {
    let clock = ManualClock::new();
    let transport = MockTransport::new();
    let mut client = client_with_clock(transport.clone(), &clock);
    client.set_retry_policy(RetryPolicyKind::Immediate, 0).unwrap();

    client.connect();
    pump(&mut client, 2);
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    transport.push(TransportEvent::Disconnected(ConnectionStatusReason::NoPingResponse));
    let summary = client.do_work();
    assert_eq!(summary.state, ConnectionState::RetryWait);
    assert_eq!(summary.retry_attempt, 1);

    pump(&mut client, 2);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(transport.script().opens, 2);
}

#[test]
fn test_retry_policy_round_trips() {
    let mut client = client(MockTransport::new());
    assert_eq!(
        client.get_retry_policy(),
        (RetryPolicyKind::ExponentialBackoffWithJitter, 0)
    );
    client
        .set_retry_policy(RetryPolicyKind::LinearBackoff, 300)
        .unwrap();
    assert_eq!(client.get_retry_policy(), (RetryPolicyKind::LinearBackoff, 300));
    assert!(matches!(
        client.set_retry_policy(RetryPolicyKind::Interval, u64::MAX),
        Err(IoTHubError::InvalidArgument(_))
    ));
}

#[test]
fn test_replacing_message_callback() {
    let clock = ManualClock::new();
    let transport = MockTransport::new();
    let mut client = client_with_clock(transport.clone(), &clock);
    let (first, first_sink) = results();
    let (second, second_sink) = results();

    client
        .set_message_callback(move |msg| {
            first_sink.lock().unwrap().push(msg.body.clone());
            DispositionResult::Accepted
        })
        .unwrap();
    client
        .set_message_callback(move |msg| {
            second_sink.lock().unwrap().push(msg.body.clone());
            DispositionResult::Rejected
        })
        .unwrap();
    assert_eq!(client.get_last_message_receive_time(), None);

    pump(&mut client, 2);
    assert_eq!(transport.script().subscriptions, vec![Subscription::Messages]);

    transport.push(TransportEvent::Message {
        tag: DeliveryTag(9),
        message: Message::new(b"hello".to_vec()),
    });
    client.do_work();

    assert!(first.lock().unwrap().is_empty());
    assert_eq!(*second.lock().unwrap(), vec![b"hello".to_vec()]);
    assert_eq!(
        transport.script().dispositions,
        vec![(DeliveryTag(9), DispositionResult::Rejected)]
    );
    assert_eq!(client.get_last_message_receive_time(), Some(clock_wall(&clock)));
}

fn clock_wall(clock: &ManualClock) -> chrono::DateTime<chrono::Utc> {
    use iothub_device_client::Clock;
    clock.wall_clock()
}

#[test]
fn test_message_without_callback_is_abandoned() {
    let transport = MockTransport::new();
    let mut client = client(transport.clone());
    client.connect();
    pump(&mut client, 2);
    transport.push(TransportEvent::Message {
        tag: DeliveryTag(1),
        message: Message::new(b"late".to_vec()),
    });
    let summary = client.do_work();

    assert_eq!(summary.callbacks, 0);
    assert_eq!(
        transport.script().dispositions,
        vec![(DeliveryTag(1), DispositionResult::Abandoned)]
    );
}

#[test]
fn test_twin_updates_and_reported_state() {
    let transport = MockTransport::acking(ConfirmationResult::Ok);
    let mut client = client(transport.clone());
    let (twins, twin_sink) = results();
    let (reported, reported_sink) = results();

    client
        .set_device_twin_callback(move |state, payload| {
            twin_sink.lock().unwrap().push((state, payload.to_vec()))
        })
        .unwrap();
    assert!(matches!(
        client.send_reported_state(b"not json", |_, _| {}),
        Err(IoTHubError::InvalidArgument(_))
    ));
    client
        .send_reported_state(br#"{"temperature":21.5}"#, move |result, status| {
            reported_sink.lock().unwrap().push((result, status))
        })
        .unwrap();

    pump(&mut client, 3);
    transport.push(TransportEvent::Twin {
        state: TwinUpdateState::Partial,
        payload: br#"{"targetTemperature":22}"#.to_vec(),
    });
    client.do_work();

    assert_eq!(*reported.lock().unwrap(), vec![(ConfirmationResult::Ok, Some(200))]);
    assert_eq!(
        *twins.lock().unwrap(),
        vec![(TwinUpdateState::Partial, br#"{"targetTemperature":22}"#.to_vec())]
    );
    assert_eq!(transport.script().subscriptions, vec![Subscription::DeviceTwin]);
}

#[test]
fn test_direct_method_is_answered() {
    let transport = MockTransport::acking(ConfirmationResult::Ok);
    let mut client = client(transport.clone());
    client
        .set_device_method_callback(|name, payload| {
            assert_eq!(name, "reboot");
            assert_eq!(payload, b"{}");
            DirectMethodResponse::new(200, Some(b"\"done\"".to_vec()))
        })
        .unwrap();

    pump(&mut client, 2);
    transport.push(TransportEvent::MethodInvoked {
        method_id: MethodId(4),
        method_name: "reboot".to_string(),
        payload: b"{}".to_vec(),
    });
    pump(&mut client, 3);

    assert_eq!(
        transport.script().method_responses,
        vec![(MethodId(4), 200, b"\"done\"".to_vec())]
    );
    assert_eq!(client.do_work().pending_operations, 0);
}

#[test]
fn test_direct_method_ex_is_answered_later_and_once() {
    let transport = MockTransport::acking(ConfirmationResult::Ok);
    let mut client = client(transport.clone());
    let (invoked, sink) = results();
    client
        .set_device_method_callback(|_, _| DirectMethodResponse::new(200, None))
        .unwrap();
    client
        .set_device_method_callback_ex(move |name, _, method_id| {
            sink.lock().unwrap().push((name.to_string(), method_id))
        })
        .unwrap();

    pump(&mut client, 2);
    transport.push(TransportEvent::MethodInvoked {
        method_id: MethodId(11),
        method_name: "getLog".to_string(),
        payload: Vec::new(),
    });
    client.do_work();

    assert_eq!(
        *invoked.lock().unwrap(),
        vec![("getLog".to_string(), MethodId(11))]
    );
    assert!(transport.script().method_responses.is_empty());

    client
        .device_method_response(MethodId(11), b"[]", 202)
        .unwrap();
    assert!(matches!(
        client.device_method_response(MethodId(11), b"[]", 202),
        Err(IoTHubError::InvalidArgument(_))
    ));
    pump(&mut client, 2);

    assert_eq!(
        transport.script().method_responses,
        vec![(MethodId(11), 202, b"[]".to_vec())]
    );
}

#[test]
fn test_method_without_callback_is_not_implemented() {
    let transport = MockTransport::acking(ConfirmationResult::Ok);
    let mut client = client(transport.clone());
    client.connect();
    pump(&mut client, 2);
    transport.push(TransportEvent::MethodInvoked {
        method_id: MethodId(1),
        method_name: "missing".to_string(),
        payload: Vec::new(),
    });
    pump(&mut client, 2);

    assert_eq!(
        transport.script().method_responses,
        vec![(MethodId(1), 501, Vec::new())]
    );
}

#[test]
fn test_options() {
    let transport = MockTransport::new();
    transport
        .script()
        .supported_options
        .push("keep_alive".to_string());
    let mut client = client(transport.clone());

    client.set_option("retry_interval_sec", json!(5)).unwrap();
    assert_eq!(client.get_option("retry_interval_sec"), Some(json!(5)));

    assert!(matches!(
        client.set_option("retry_jitter_fraction", json!(1.5)),
        Err(IoTHubError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.set_option("model_id", json!("dtmi:com:example:Thermostat")),
        Err(IoTHubError::InvalidArgument(_))
    ));
    client
        .set_option("model_id", json!("dtmi:com:example:Thermostat;1"))
        .unwrap();
    assert_eq!(
        client.get_option("model_id"),
        Some(json!("dtmi:com:example:Thermostat;1"))
    );

    client.set_option("keep_alive", json!(240)).unwrap();
    assert_eq!(
        transport.script().options,
        vec![("keep_alive".to_string(), json!(240))]
    );
    assert!(matches!(
        client.set_option("unknown", json!(true)),
        Err(IoTHubError::NotSupported(_))
    ));
}

#[test]
fn test_builder_with_access_key() {
    let client = IoTHubClient::builder(MockTransport::new())
        .iothub_details("test-hub.azure-devices.net", "dev-1")
        .access_key("c2VjcmV0a2V5")
        .unwrap()
        .retry_policy(RetryPolicyKind::ExponentialBackoff, 60)
        .build()
        .unwrap();

    assert_eq!(client.descriptor().device_id, "dev-1");
    assert_eq!(
        client.get_retry_policy(),
        (RetryPolicyKind::ExponentialBackoff, 60)
    );
}
