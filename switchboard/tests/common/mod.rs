#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use switchboard::{
    Api, Bus, BusConfig, EventMessage, MemoryEventTransport, MemoryResultTransport,
    MemoryRpcTransport, MetricsPlugin, METRICS_API_NAME,
};

/// A bus wired to in-memory transports, with handles kept for inspection.
pub struct Harness {
    pub bus: Bus,
    pub rpc: Arc<MemoryRpcTransport>,
    pub results: Arc<MemoryResultTransport>,
    pub events: Arc<MemoryEventTransport>,
}

pub fn plain_harness(api: Api) -> Harness {
    harness(api, false, MemoryRpcTransport::new())
}

pub fn metrics_harness(api: Api) -> Harness {
    harness(api, true, MemoryRpcTransport::new())
}

pub fn harness(api: Api, metrics: bool, rpc: MemoryRpcTransport) -> Harness {
    let rpc = Arc::new(rpc);
    let results = Arc::new(MemoryResultTransport::new());
    let events = Arc::new(MemoryEventTransport::new());

    let mut builder = Bus::builder()
        .api(api)
        .rpc_transport(rpc.clone())
        .result_transport(results.clone())
        .event_transport(events.clone())
        .config(
            BusConfig::default()
                .with_process_name("test-proc")
                .with_rpc_timeout(Duration::from_secs(10)),
        );
    if metrics {
        builder = builder.plugin(MetricsPlugin::new());
    }

    Harness {
        bus: builder.build().expect("bus assembles"),
        rpc,
        results,
        events,
    }
}

impl Harness {
    /// The `internal.metrics` events recorded by the event transport.
    pub fn metric_events(&self) -> Vec<EventMessage> {
        self.events
            .sent()
            .into_iter()
            .filter(|event| event.api_name == METRICS_API_NAME)
            .collect()
    }
}

/// Poll `condition` until it holds or `deadline` elapses.
pub async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
