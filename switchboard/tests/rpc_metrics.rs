//! End-to-end RPC flows, observed through the metrics plugin.

mod common;

use serde_json::json;
use std::time::Duration;

use switchboard::{Api, Kwargs, RpcMessage};

fn example_api() -> Api {
    Api::builder("example.test")
        .event("my_event", ["f"])
        .procedure("my_method", |_kwargs| async { Ok(json!("value")) })
        .build()
        .unwrap()
}

#[tokio::test]
async fn round_trip_rpc_emits_correlated_metric_events() {
    let harness = common::metrics_harness(example_api());
    let consumer = harness.bus.spawn_rpc_consumer(None);

    let value = harness
        .bus
        .rpc("example.test", "my_method")
        .kwarg("f", 123)
        .call()
        .await
        .unwrap();
    assert_eq!(value, json!("value"));

    harness.bus.close().await;
    consumer.await.unwrap().unwrap();

    let metrics = harness.metric_events();
    let names: Vec<&str> = metrics.iter().map(|e| e.event_name.as_str()).collect();
    let position = |name: &str| {
        names
            .iter()
            .position(|n| *n == name)
            .unwrap_or_else(|| panic!("expected metric event {name}, got {names:?}"))
    };

    // The caller-side pair brackets the server-side pair it triggered.
    assert_eq!(position("rpc_call_sent"), 0);
    assert!(position("rpc_call_received") < position("rpc_response_sent"));
    assert!(position("rpc_call_sent") < position("rpc_response_received"));

    let sent = &metrics[position("rpc_call_sent")];
    let received = &metrics[position("rpc_response_received")];
    let rpc_id = sent.kwargs["rpc_id"].as_str().unwrap().to_string();
    assert!(!rpc_id.is_empty());
    for metric in [sent, received] {
        assert_eq!(metric.kwargs["api_name"], json!("example.test"));
        assert_eq!(metric.kwargs["procedure_name"], json!("my_method"));
        assert_eq!(metric.kwargs["rpc_id"], json!(rpc_id.clone()));
        assert_eq!(metric.kwargs["process_name"], json!("test-proc"));
        assert!(metric.kwargs["timestamp"].as_f64().unwrap() > 0.0);
    }
    assert_eq!(sent.kwargs["kwargs"], json!({"f": 123}));

    let response_sent = &metrics[position("rpc_response_sent")];
    assert_eq!(response_sent.kwargs["rpc_id"], json!(rpc_id));
    assert_eq!(response_sent.kwargs["result"], json!("value"));
}

#[tokio::test]
async fn serving_an_injected_rpc_emits_received_then_sent() {
    let harness = common::metrics_harness(example_api());

    let mut kwargs = Kwargs::new();
    kwargs.insert("f".into(), json!(123));
    harness.rpc.inject(RpcMessage::with_id(
        "123abc",
        "example.test",
        "my_method",
        kwargs,
    ));

    let consumer = harness
        .bus
        .spawn_rpc_consumer(Some(vec!["example.test".into()]));
    let done = common::wait_for(Duration::from_secs(5), || {
        harness
            .metric_events()
            .iter()
            .any(|e| e.event_name == "rpc_response_sent")
    })
    .await;
    assert!(done, "the injected rpc was never served");

    harness.bus.close().await;
    consumer.await.unwrap().unwrap();

    let metrics = harness.metric_events();
    let names: Vec<&str> = metrics.iter().map(|e| e.event_name.as_str()).collect();
    assert_eq!(names, vec!["rpc_call_received", "rpc_response_sent"]);

    for metric in &metrics {
        assert_eq!(metric.kwargs["rpc_id"], json!("123abc"));
        assert_eq!(metric.kwargs["api_name"], json!("example.test"));
        assert_eq!(metric.kwargs["procedure_name"], json!("my_method"));
        assert_eq!(metric.kwargs["process_name"], json!("test-proc"));
    }
    assert_eq!(metrics[1].kwargs["result"], json!("value"));
}

#[tokio::test]
async fn remote_errors_are_reraised_to_the_caller() {
    let api = Api::builder("example.test")
        .procedure("boom", |_kwargs| async {
            Err::<serde_json::Value, switchboard::HandlerError>("it broke".into())
        })
        .build()
        .unwrap();
    let harness = common::plain_harness(api);
    let consumer = harness.bus.spawn_rpc_consumer(None);

    let err = harness
        .bus
        .rpc("example.test", "boom")
        .call()
        .await
        .unwrap_err();
    match err {
        switchboard::BusError::RemoteError { message, trace } => {
            assert_eq!(message, "it broke");
            assert!(trace.unwrap().contains("it broke"));
        }
        other => panic!("expected a remote error, got {other}"),
    }

    harness.bus.close().await;
    consumer.await.unwrap().unwrap();
}

#[tokio::test]
async fn calling_an_unknown_api_fails_the_call_remotely() {
    let harness = common::plain_harness(example_api());
    let consumer = harness
        .bus
        .spawn_rpc_consumer(Some(vec!["example.test".into(), "missing.api".into()]));

    let err = harness
        .bus
        .rpc("missing.api", "my_method")
        .call()
        .await
        .unwrap_err();
    assert!(matches!(err, switchboard::BusError::RemoteError { .. }));

    harness.bus.close().await;
    consumer.await.unwrap().unwrap();
}
