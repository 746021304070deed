//! At-least-once delivery under injected failures.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use switchboard::{Api, HandlerError, MemoryRpcTransport, SuddenDeath, TransportOptions};

#[tokio::test]
async fn a_listener_that_fails_once_still_handles_every_event() {
    let api = Api::builder("example.test")
        .event("my_event", ["field"])
        .build()
        .unwrap();
    let harness = common::plain_harness(api);

    let attempts: Arc<Mutex<HashMap<i64, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let handled: Arc<Mutex<HashMap<i64, usize>>> = Arc::new(Mutex::new(HashMap::new()));

    let listener = {
        let attempts = attempts.clone();
        let handled = handled.clone();
        move |event: switchboard::EventMessage| {
            let attempts = attempts.clone();
            let handled = handled.clone();
            async move {
                let field = event.kwargs["field"].as_i64().unwrap();
                let attempt = {
                    let mut attempts = attempts.lock().unwrap();
                    let attempt = attempts.entry(field).or_insert(0);
                    *attempt += 1;
                    *attempt
                };
                // The very first delivery of field=0 dies; everything else
                // succeeds.
                if field == 0 && attempt == 1 {
                    return Err(Box::new(SuddenDeath) as HandlerError);
                }
                *handled.lock().unwrap().entry(field).or_insert(0) += 1;
                Ok(())
            }
        }
    };
    harness
        .bus
        .listen(
            "example.test",
            "my_event",
            listener,
            TransportOptions::new().with("listener_group", "reliability"),
        )
        .await
        .unwrap();

    for field in 0..100i64 {
        harness
            .bus
            .event("example.test", "my_event")
            .kwarg("field", field)
            .fire()
            .await
            .unwrap();
    }

    let done = common::wait_for(Duration::from_secs(10), || {
        handled.lock().unwrap().len() == 100
    })
    .await;
    assert!(done, "every event is eventually handled");
    harness.bus.close().await;

    let handled = handled.lock().unwrap();
    let mut fields: Vec<i64> = handled.keys().copied().collect();
    fields.sort_unstable();
    assert_eq!(fields, (0..100).collect::<Vec<i64>>());

    assert_eq!(attempts.lock().unwrap()[&0], 2);
    assert!(harness.events.redelivered_batches() >= 1);
}

#[tokio::test]
async fn random_rpc_failures_cause_duplicates_but_no_loss() {
    let ok_counts: Arc<Mutex<HashMap<u64, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let deaths = Arc::new(AtomicUsize::new(0));
    let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(0x5EED)));

    let api = {
        let ok_counts = ok_counts.clone();
        let deaths = deaths.clone();
        let rng = rng.clone();
        Api::builder("my.dummy")
            .procedure("my_proc", move |kwargs: switchboard::Kwargs| {
                let ok_counts = ok_counts.clone();
                let deaths = deaths.clone();
                let rng = rng.clone();
                async move {
                    let n = kwargs["n"].as_u64().unwrap();
                    // ~30% of invocations simulate the worker dying.
                    let dies = rng.lock().unwrap().gen::<f64>() < 0.3;
                    if dies {
                        deaths.fetch_add(1, Ordering::SeqCst);
                        return Err(Box::new(SuddenDeath) as HandlerError);
                    }
                    *ok_counts.lock().unwrap().entry(n).or_insert(0) += 1;
                    Ok(json!(n))
                }
            })
            .build()
            .unwrap()
    };

    // Small batches so an abandoned batch usually contains some already
    // handled requests.
    let harness = common::harness(api, false, MemoryRpcTransport::with_batch_limit(10));

    let mut callers = Vec::new();
    for n in 0..100u64 {
        let bus = harness.bus.clone();
        callers.push(tokio::spawn(async move {
            bus.rpc("my.dummy", "my_proc")
                .kwarg("n", n)
                .timeout(Duration::from_secs(30))
                .call()
                .await
        }));
    }

    // Let the requests pile up so batches are full.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let consumer = harness.bus.spawn_rpc_consumer(None);

    for (n, caller) in callers.into_iter().enumerate() {
        let value = caller.await.unwrap().unwrap();
        assert_eq!(value, json!(n as u64));
    }

    let done = common::wait_for(Duration::from_secs(10), || {
        ok_counts.lock().unwrap().len() == 100
    })
    .await;
    assert!(done, "every call is eventually handled");
    harness.bus.close().await;
    consumer.await.unwrap().unwrap();

    let ok_counts = ok_counts.lock().unwrap();
    let mut ids: Vec<u64> = ok_counts.keys().copied().collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..100).collect::<Vec<u64>>());

    let duplicates: usize = ok_counts.values().map(|count| count - 1).sum();
    assert!(duplicates > 0, "redelivered batches re-run handled requests");
    assert!(deaths.load(Ordering::SeqCst) > 0);
    assert!(harness.rpc.redelivered_batches() > 0);
}
