//! The handler dispatcher: resolves `<api>.<procedure>` against the
//! registry, invokes it, and wraps the outcome in a result envelope.
//!
//! A failing handler is converted into an error result and never allowed to
//! tear down the consumption loop. The one exception is [`SuddenDeath`],
//! the synthetic worker-died failure: it abandons the whole batch so the
//! transport re-delivers it.

use tracing::{debug, warn};

use crate::error::SuddenDeath;
use crate::message::{ResultMessage, RpcMessage};
use crate::registry::ApiRegistry;

/// Outcome of dispatching one RPC request.
#[derive(Debug)]
pub enum Dispatch {
    /// A result envelope is ready to send to the request's return path.
    Completed(ResultMessage),
    /// The handler simulated a dying worker; the batch must be left
    /// un-acknowledged and no result sent.
    Abandoned,
}

/// Resolve and invoke the procedure named by `request`.
pub async fn dispatch_rpc(registry: &ApiRegistry, request: &RpcMessage) -> Dispatch {
    let api = match registry.get(&request.api_name) {
        Ok(api) => api,
        Err(err) => {
            warn!(
                call = %request.canonical_name(),
                rpc_id = %request.rpc_id,
                "rpc call for unknown api"
            );
            return Dispatch::Completed(ResultMessage::from_failure(&request.rpc_id, &err));
        }
    };

    let invocation = match api.call(&request.procedure_name, request.kwargs.clone()) {
        Ok(invocation) => invocation,
        Err(err) => {
            warn!(
                call = %request.canonical_name(),
                rpc_id = %request.rpc_id,
                "rpc call for unknown procedure"
            );
            return Dispatch::Completed(ResultMessage::from_failure(&request.rpc_id, &err));
        }
    };

    match invocation.await {
        Ok(value) => Dispatch::Completed(ResultMessage::success(&request.rpc_id, value)),
        Err(err) if err.downcast_ref::<SuddenDeath>().is_some() => {
            warn!(
                call = %request.canonical_name(),
                rpc_id = %request.rpc_id,
                "handler died mid-batch; leaving the batch unacknowledged"
            );
            Dispatch::Abandoned
        }
        Err(err) => {
            debug!(
                call = %request.canonical_name(),
                rpc_id = %request.rpc_id,
                error = %err,
                "handler failed; returning an error result"
            );
            Dispatch::Completed(ResultMessage::from_failure(&request.rpc_id, &*err))
        }
    }
}
