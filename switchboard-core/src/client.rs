//! The bus client: issues RPC calls, correlates results, fires events, and
//! dispatches incoming traffic to registered handlers.
//!
//! A [`Bus`] is assembled once with [`Bus::builder`] and cloned freely;
//! clones share the registry, transports, plugins, and listener groups.
//! Consumer loops run as tokio tasks and shut down cooperatively through a
//! shared cancellation token.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{Api, BoxFuture};
use crate::config::BusConfig;
use crate::consumption::Consumption;
use crate::dispatch::{dispatch_rpc, Dispatch};
use crate::error::{BusError, HandlerError};
use crate::message::{EventMessage, Kwargs, RpcMessage};
use crate::plugin::{BusPlugin, HookContext, PluginSet};
use crate::registry::ApiRegistry;
use crate::transport::{
    EventTransport, ListenerGroupKey, ResultTransport, RpcTransport, TransportOptions,
};

/// Callback invoked once per delivered event matching its registration.
///
/// A failing callback propagates out of the consumption context, so the
/// batch it arrived in is not acknowledged and will be re-delivered.
pub type EventCallback = Arc<dyn Fn(EventMessage) -> BoxFuture<Result<(), HandlerError>> + Send + Sync>;

struct Listener {
    api_name: String,
    event_name: String,
    callback: EventCallback,
}

struct ListenerGroup {
    listeners: Arc<RwLock<Vec<Listener>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct BusInner {
    registry: ApiRegistry,
    rpc_transport: Arc<dyn RpcTransport>,
    result_transport: Arc<dyn ResultTransport>,
    event_transport: Arc<dyn EventTransport>,
    plugins: PluginSet,
    config: BusConfig,
    listener_groups: Mutex<HashMap<ListenerGroupKey, ListenerGroup>>,
    shutdown: CancellationToken,
}

impl BusInner {
    fn hook_context(&self) -> HookContext<'_> {
        HookContext::new(&self.config.process_name, &self.event_transport)
    }
}

/// The bus client.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    pub fn registry(&self) -> &ApiRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Register a surface on this bus.
    pub fn register(&self, api: Api) -> Result<(), BusError> {
        self.inner.registry.add(api).map(|_| ())
    }

    /// Start building an RPC call to `<api_name>.<procedure_name>`.
    pub fn rpc(
        &self,
        api_name: impl Into<String>,
        procedure_name: impl Into<String>,
    ) -> RpcCall {
        RpcCall {
            bus: self.clone(),
            api_name: api_name.into(),
            procedure_name: procedure_name.into(),
            kwargs: Kwargs::new(),
            options: TransportOptions::new(),
        }
    }

    /// Start building an event emission of `<api_name>.<event_name>`.
    pub fn event(
        &self,
        api_name: impl Into<String>,
        event_name: impl Into<String>,
    ) -> EventFire {
        EventFire {
            bus: self.clone(),
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs: Kwargs::new(),
            options: TransportOptions::new(),
        }
    }

    /// Issue an RPC call and await its result.
    ///
    /// Returns the remote value, or re-raises the error carried in the
    /// result envelope as [`BusError::RemoteError`]. When `options` carry no
    /// timeout the configured default applies.
    pub async fn call_rpc(
        &self,
        api_name: &str,
        procedure_name: &str,
        kwargs: Kwargs,
        options: TransportOptions,
    ) -> Result<Value, BusError> {
        let mut options = options;
        if options.timeout.is_none() {
            options.timeout = Some(self.inner.config.rpc_timeout);
        }

        let mut request = RpcMessage::new(api_name, procedure_name, kwargs);
        let return_path = self.inner.result_transport.get_return_path(&request);
        request.return_path = return_path.clone();

        let ctx = self.inner.hook_context();
        self.inner.plugins.before_rpc_call(&request, &ctx).await;
        debug!(call = %request.canonical_name(), rpc_id = %request.rpc_id, "issuing rpc call");
        self.inner.rpc_transport.call_rpc(&request, &options).await?;

        let result = self
            .inner
            .result_transport
            .receive_result(&request, &return_path, &options)
            .await?;
        self.inner.plugins.after_rpc_call(&request, &result, &ctx).await;

        if result.error {
            let message = match &result.result {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            Err(BusError::RemoteError {
                message,
                trace: result.trace,
            })
        } else {
            Ok(result.result)
        }
    }

    /// Fire a fire-and-forget event declared on a locally registered
    /// surface.
    pub async fn fire_event(
        &self,
        api_name: &str,
        event_name: &str,
        kwargs: Kwargs,
        options: TransportOptions,
    ) -> Result<(), BusError> {
        let api = self.inner.registry.get(api_name)?;
        api.event(event_name)?;

        let event = EventMessage::new(api_name, event_name, kwargs);
        let ctx = self.inner.hook_context();
        self.inner.plugins.before_event_sent(&event, &ctx).await;
        debug!(event = %event.canonical_name(), "firing event");
        self.inner.event_transport.send_event(&event, &options).await?;
        self.inner.plugins.after_event_sent(&event, &ctx).await;
        Ok(())
    }

    /// Serve RPC requests until the bus is closed.
    ///
    /// Consumes requests for the given surfaces (all registered surfaces
    /// when `None`), dispatches them, sends results to each request's
    /// return path, and acknowledges each batch once fully handled.
    pub async fn consume_rpcs(&self, api_names: Option<Vec<String>>) -> Result<(), BusError> {
        let api_names = match api_names {
            Some(names) => names,
            None => self.inner.registry.names(),
        };
        info!(apis = ?api_names, "serving rpc calls");
        let mut consumption =
            Consumption::rpcs(self.inner.rpc_transport.clone(), api_names);
        let cancel = self.inner.shutdown.clone();

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => {
                    consumption.close().await?;
                    return Ok(());
                }
                fetched = consumption.next_batch() => fetched,
            };
            let batch = match fetched {
                Ok(batch) => batch,
                Err(err) => {
                    error!(error = %err, "fetching rpc batch failed");
                    tokio::time::sleep(self.inner.config.fetch_retry_delay).await;
                    continue;
                }
            };

            let mut abandoned = false;
            for request in batch.to_vec() {
                let ctx = self.inner.hook_context();
                self.inner.plugins.before_rpc_execution(&request, &ctx).await;
                match dispatch_rpc(&self.inner.registry, &request).await {
                    Dispatch::Completed(result) => {
                        if let Err(err) = self
                            .inner
                            .result_transport
                            .send_result(&request, &result, &request.return_path)
                            .await
                        {
                            error!(error = %err, rpc_id = %request.rpc_id, "sending rpc result failed");
                        }
                        self.inner
                            .plugins
                            .after_rpc_execution(&request, &result, &ctx)
                            .await;
                    }
                    Dispatch::Abandoned => {
                        abandoned = true;
                        break;
                    }
                }
            }

            if abandoned {
                // Dropped un-acked: the transport re-delivers the batch.
                drop(batch);
            } else if let Err(err) = consumption.ack(batch).await {
                error!(error = %err, "acknowledging rpc batch failed");
            }
        }
    }

    /// Spawn [`Bus::consume_rpcs`] as a background task.
    pub fn spawn_rpc_consumer(
        &self,
        api_names: Option<Vec<String>>,
    ) -> JoinHandle<Result<(), BusError>> {
        let bus = self.clone();
        tokio::spawn(async move { bus.consume_rpcs(api_names).await })
    }

    /// Register a listener for `<api_name>.<event_name>`.
    ///
    /// The event transport's listener-group key decides whether this
    /// registration starts a fresh consumption loop or joins one that is
    /// already running for the same key.
    pub async fn listen<F, Fut>(
        &self,
        api_name: &str,
        event_name: &str,
        callback: F,
        options: TransportOptions,
    ) -> Result<ListenerHandle, BusError>
    where
        F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let callback: EventCallback = Arc::new(move |event| Box::pin(callback(event)));
        let key = self
            .inner
            .event_transport
            .listener_group_key(api_name, event_name, &options);
        let listener = Listener {
            api_name: api_name.to_string(),
            event_name: event_name.to_string(),
            callback,
        };

        let mut groups = self.inner.listener_groups.lock().await;
        if let Some(group) = groups.get(&key) {
            group.listeners.write().await.push(listener);
            debug!(group = %key, event = %format!("{api_name}.{event_name}"), "joined existing listener group");
            return Ok(ListenerHandle {
                key,
                cancel: group.cancel.clone(),
            });
        }

        self.inner
            .event_transport
            .start_listening_for(api_name, event_name, &options)
            .await?;
        let listeners = Arc::new(RwLock::new(vec![listener]));
        let cancel = self.inner.shutdown.child_token();
        let task = tokio::spawn(listener_loop(
            self.inner.clone(),
            key.clone(),
            listeners.clone(),
            cancel.clone(),
        ));
        info!(group = %key, event = %format!("{api_name}.{event_name}"), "started listener group");
        groups.insert(
            key.clone(),
            ListenerGroup {
                listeners,
                cancel: cancel.clone(),
                task,
            },
        );
        Ok(ListenerHandle { key, cancel })
    }

    /// The number of currently running listener groups.
    pub async fn listener_group_count(&self) -> usize {
        self.inner.listener_groups.lock().await.len()
    }

    /// Shut the bus down: cancel every consumer loop and wait for listener
    /// groups to wind down. In-flight batches are left un-acknowledged, so
    /// their transports re-deliver them to the next consumer.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut groups = self.inner.listener_groups.lock().await;
            groups.drain().map(|(_, group)| group.task).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        debug!("bus closed");
    }
}

async fn listener_loop(
    inner: Arc<BusInner>,
    key: ListenerGroupKey,
    listeners: Arc<RwLock<Vec<Listener>>>,
    cancel: CancellationToken,
) {
    let mut consumption = Consumption::events(inner.event_transport.clone());

    loop {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            fetched = consumption.next_batch() => fetched,
        };
        let batch = match fetched {
            Ok(batch) => batch,
            Err(err) => {
                error!(group = %key, error = %err, "fetching event batch failed");
                tokio::time::sleep(inner.config.fetch_retry_delay).await;
                continue;
            }
        };

        let mut failed = false;
        'deliveries: for event in batch.to_vec() {
            let matching: Vec<EventCallback> = {
                let listeners = listeners.read().await;
                listeners
                    .iter()
                    .filter(|listener| {
                        listener.api_name == event.api_name
                            && listener.event_name == event.event_name
                    })
                    .map(|listener| listener.callback.clone())
                    .collect()
            };
            for callback in matching {
                let ctx = inner.hook_context();
                inner.plugins.before_event_execution(&event, &ctx).await;
                match callback(event.clone()).await {
                    Ok(()) => {
                        inner.plugins.after_event_execution(&event, &ctx).await;
                    }
                    Err(err) => {
                        warn!(
                            group = %key,
                            event = %event.canonical_name(),
                            error = %err,
                            "event listener failed; batch left unacknowledged"
                        );
                        failed = true;
                        break 'deliveries;
                    }
                }
            }
        }

        if failed {
            // Dropped un-acked: the transport re-delivers the batch.
            drop(batch);
        } else if let Err(err) = consumption.ack(batch).await {
            error!(group = %key, error = %err, "acknowledging event batch failed");
        }
    }

    // Wind down: withdraw the subscription hints, release the stream, and
    // deregister the group.
    let registrations: BTreeSet<(String, String)> = {
        let listeners = listeners.read().await;
        listeners
            .iter()
            .map(|listener| (listener.api_name.clone(), listener.event_name.clone()))
            .collect()
    };
    for (api_name, event_name) in registrations {
        if let Err(err) = inner
            .event_transport
            .stop_listening_for(&api_name, &event_name)
            .await
        {
            warn!(group = %key, error = %err, "stop_listening_for failed");
        }
    }
    if let Err(err) = consumption.close().await {
        warn!(group = %key, error = %err, "closing event consumption failed");
    }
    inner.listener_groups.lock().await.remove(&key);
    debug!(group = %key, "listener group stopped");
}

/// Handle to a listener registration.
///
/// Stopping the handle cancels the whole listener group it belongs to,
/// including any registrations that share its key.
pub struct ListenerHandle {
    key: ListenerGroupKey,
    cancel: CancellationToken,
}

impl ListenerHandle {
    pub fn key(&self) -> &ListenerGroupKey {
        &self.key
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Builder-style RPC call, created by [`Bus::rpc`].
pub struct RpcCall {
    bus: Bus,
    api_name: String,
    procedure_name: String,
    kwargs: Kwargs,
    options: TransportOptions,
}

impl RpcCall {
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs.extend(kwargs);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options = self.options.with(key, value);
        self
    }

    pub async fn call(self) -> Result<Value, BusError> {
        self.bus
            .call_rpc(&self.api_name, &self.procedure_name, self.kwargs, self.options)
            .await
    }
}

/// Builder-style event emission, created by [`Bus::event`].
pub struct EventFire {
    bus: Bus,
    api_name: String,
    event_name: String,
    kwargs: Kwargs,
    options: TransportOptions,
}

impl EventFire {
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs.extend(kwargs);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options = self.options.with(key, value);
        self
    }

    pub async fn fire(self) -> Result<(), BusError> {
        self.bus
            .fire_event(&self.api_name, &self.event_name, self.kwargs, self.options)
            .await
    }
}

/// Assembles a [`Bus`] from its registry, transports, plugins, and config.
pub struct BusBuilder {
    registry: ApiRegistry,
    apis: Vec<Api>,
    rpc_transport: Option<Arc<dyn RpcTransport>>,
    result_transport: Option<Arc<dyn ResultTransport>>,
    event_transport: Option<Arc<dyn EventTransport>>,
    plugins: Vec<Arc<dyn BusPlugin>>,
    config: BusConfig,
}

impl BusBuilder {
    fn new() -> Self {
        Self {
            registry: ApiRegistry::new(),
            apis: Vec::new(),
            rpc_transport: None,
            result_transport: None,
            event_transport: None,
            plugins: Vec::new(),
            config: BusConfig::default(),
        }
    }

    /// Use an existing registry instead of a fresh one.
    pub fn registry(mut self, registry: ApiRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a surface when the bus is built.
    pub fn api(mut self, api: Api) -> Self {
        self.apis.push(api);
        self
    }

    pub fn rpc_transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.rpc_transport = Some(transport);
        self
    }

    pub fn result_transport(mut self, transport: Arc<dyn ResultTransport>) -> Self {
        self.result_transport = Some(transport);
        self
    }

    pub fn event_transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.event_transport = Some(transport);
        self
    }

    /// Install a plugin. Hooks are emitted in installation order.
    pub fn plugin(mut self, plugin: impl BusPlugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the bus. Registers the queued surfaces and any
    /// plugin-contributed surfaces that ask for auto-registration.
    pub fn build(self) -> Result<Bus, BusError> {
        let rpc_transport = self.rpc_transport.ok_or_else(|| {
            BusError::Configuration("an rpc transport is required".to_string())
        })?;
        let result_transport = self.result_transport.ok_or_else(|| {
            BusError::Configuration("a result transport is required".to_string())
        })?;
        let event_transport = self.event_transport.ok_or_else(|| {
            BusError::Configuration("an event transport is required".to_string())
        })?;

        for api in self.apis {
            self.registry.add(api)?;
        }
        for plugin in &self.plugins {
            for api in plugin.apis() {
                if api.auto_register() {
                    self.registry.add(api)?;
                }
            }
        }

        Ok(Bus {
            inner: Arc::new(BusInner {
                registry: self.registry,
                rpc_transport,
                result_transport,
                event_transport,
                plugins: PluginSet::new(self.plugins),
                config: self.config,
                listener_groups: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}
