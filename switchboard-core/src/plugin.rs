//! Plugin hooks: before/after emission points around every bus operation.
//!
//! Plugins are passive observers. Hooks run serialized on the emitting
//! task; a failing hook is logged and skipped so a broken plugin can never
//! poison a serve loop. Plugins may also contribute surfaces (typically
//! `internal.*` ones), which the bus builder registers on their behalf when
//! the surface asks for auto-registration.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::api::Api;
use crate::error::BusError;
use crate::message::{EventMessage, ResultMessage, RpcMessage};
use crate::transport::{EventTransport, TransportOptions};

/// Ambient state handed to every hook invocation.
pub struct HookContext<'a> {
    process_name: &'a str,
    event_transport: &'a Arc<dyn EventTransport>,
}

impl<'a> HookContext<'a> {
    pub fn new(process_name: &'a str, event_transport: &'a Arc<dyn EventTransport>) -> Self {
        Self {
            process_name,
            event_transport,
        }
    }

    /// The name identifying this bus process in hook payloads.
    pub fn process_name(&self) -> &str {
        self.process_name
    }

    /// Publish an internal event straight on the event transport.
    ///
    /// Bypasses registry validation and hook emission, so a plugin emitting
    /// its own events cannot recurse into itself.
    pub async fn emit_internal(&self, event: EventMessage) -> Result<(), BusError> {
        self.event_transport
            .send_event(&event, &TransportOptions::default())
            .await
    }
}

/// Before/after emission points consumed by observability plugins.
///
/// Every hook has a default no-op implementation; implement only the ones
/// you care about.
#[async_trait]
pub trait BusPlugin: Send + Sync {
    /// The plugin's name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Surfaces this plugin contributes. Surfaces with `auto_register` set
    /// are registered during bus build.
    fn apis(&self) -> Vec<Api> {
        Vec::new()
    }

    async fn before_rpc_call(
        &self,
        _request: &RpcMessage,
        _ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        Ok(())
    }

    async fn after_rpc_call(
        &self,
        _request: &RpcMessage,
        _result: &ResultMessage,
        _ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        Ok(())
    }

    async fn before_rpc_execution(
        &self,
        _request: &RpcMessage,
        _ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        Ok(())
    }

    async fn after_rpc_execution(
        &self,
        _request: &RpcMessage,
        _result: &ResultMessage,
        _ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        Ok(())
    }

    async fn before_event_sent(
        &self,
        _event: &EventMessage,
        _ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        Ok(())
    }

    async fn after_event_sent(
        &self,
        _event: &EventMessage,
        _ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        Ok(())
    }

    async fn before_event_execution(
        &self,
        _event: &EventMessage,
        _ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        Ok(())
    }

    async fn after_event_execution(
        &self,
        _event: &EventMessage,
        _ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        Ok(())
    }
}

/// Generate the `PluginSet` fan-out methods: each emits one hook across
/// every installed plugin, logging and skipping failures.
macro_rules! fan_out {
    ($($hook:ident($($arg:ident: $ty:ty),*);)+) => {
        impl PluginSet {
            $(
                pub async fn $hook(&self, $($arg: $ty,)* ctx: &HookContext<'_>) {
                    for plugin in self.plugins.iter() {
                        if let Err(error) = plugin.$hook($($arg,)* ctx).await {
                            warn!(
                                plugin = plugin.name(),
                                hook = stringify!($hook),
                                %error,
                                "plugin hook failed"
                            );
                        }
                    }
                }
            )+
        }
    };
}

/// The installed plugins, emitted to in installation order.
#[derive(Clone, Default)]
pub struct PluginSet {
    plugins: Arc<Vec<Arc<dyn BusPlugin>>>,
}

impl PluginSet {
    pub fn new(plugins: Vec<Arc<dyn BusPlugin>>) -> Self {
        Self {
            plugins: Arc::new(plugins),
        }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BusPlugin>> {
        self.plugins.iter()
    }
}

fan_out! {
    before_rpc_call(request: &RpcMessage);
    after_rpc_call(request: &RpcMessage, result: &ResultMessage);
    before_rpc_execution(request: &RpcMessage);
    after_rpc_execution(request: &RpcMessage, result: &ResultMessage);
    before_event_sent(event: &EventMessage);
    after_event_sent(event: &EventMessage);
    before_event_execution(event: &EventMessage);
    after_event_execution(event: &EventMessage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kwargs;
    use crate::transport::AckToken;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct NullEventTransport;

    #[async_trait]
    impl EventTransport for NullEventTransport {
        async fn send_event(
            &self,
            _event: &EventMessage,
            _options: &TransportOptions,
        ) -> Result<(), BusError> {
            Ok(())
        }

        async fn fetch_events(&self) -> Result<(Vec<EventMessage>, AckToken), BusError> {
            std::future::pending().await
        }

        async fn consumption_complete(&self, _token: AckToken) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        hooks: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl BusPlugin for Arc<Recording> {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn before_rpc_call(
            &self,
            _request: &RpcMessage,
            _ctx: &HookContext<'_>,
        ) -> Result<(), BusError> {
            self.hooks.lock().unwrap().push("before_rpc_call");
            Ok(())
        }

        async fn after_rpc_call(
            &self,
            _request: &RpcMessage,
            _result: &ResultMessage,
            _ctx: &HookContext<'_>,
        ) -> Result<(), BusError> {
            self.hooks.lock().unwrap().push("after_rpc_call");
            Ok(())
        }
    }

    struct Failing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BusPlugin for Arc<Failing> {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn before_rpc_call(
            &self,
            _request: &RpcMessage,
            _ctx: &HookContext<'_>,
        ) -> Result<(), BusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BusError::Transport("hook exploded".into()))
        }
    }

    #[tokio::test]
    async fn hooks_fan_out_in_installation_order_and_survive_failures() {
        let recording = Arc::new(Recording::default());
        let failing = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let plugins = PluginSet::new(vec![
            Arc::new(failing.clone()) as Arc<dyn BusPlugin>,
            Arc::new(recording.clone()) as Arc<dyn BusPlugin>,
        ]);

        let transport: Arc<dyn EventTransport> = Arc::new(NullEventTransport);
        let ctx = HookContext::new("proc-test", &transport);
        let request = RpcMessage::with_id("id1", "example.test", "my_method", Kwargs::new());
        let result = ResultMessage::success("id1", json!("value"));

        plugins.before_rpc_call(&request, &ctx).await;
        plugins.after_rpc_call(&request, &result, &ctx).await;

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *recording.hooks.lock().unwrap(),
            vec!["before_rpc_call", "after_rpc_call"]
        );
    }
}
