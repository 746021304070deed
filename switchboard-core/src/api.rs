//! Service surfaces: named bundles of procedures and event declarations.
//!
//! A surface is a value built with [`Api::builder`] and registered explicitly
//! — registration is an ordered step at process init, never a side effect of
//! defining the surface. Procedures and events live in explicit tables on
//! the surface, keyed by member name.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{BusError, HandlerError};
use crate::message::Kwargs;

/// Boxed future used by procedure and event handler tables.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type ProcedureFn = Arc<dyn Fn(Kwargs) -> BoxFuture<Result<Value, HandlerError>> + Send + Sync>;

/// An event declaration: the named parameters an event carries.
///
/// A declaration belongs to exactly one surface and is addressed as
/// `<surface>.<event>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDecl {
    arguments: Vec<String>,
}

impl EventDecl {
    pub fn new<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

/// True when every dot-separated segment matches `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn valid_api_name(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(valid_name_segment)
}

/// True when a member name matches `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn valid_name_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A named service surface addressable on the bus.
pub struct Api {
    pub(crate) name: String,
    pub(crate) internal: bool,
    pub(crate) auto_register: bool,
    pub(crate) events: BTreeMap<String, EventDecl>,
    pub(crate) procedures: BTreeMap<String, ProcedureFn>,
}

impl Api {
    pub fn builder(name: impl Into<String>) -> ApiBuilder {
        ApiBuilder {
            name: name.into(),
            internal: false,
            auto_register: true,
            events: BTreeMap::new(),
            procedures: BTreeMap::new(),
        }
    }

    /// The bus address of this surface.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this surface is bus-infrastructural and hidden from public
    /// enumeration.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Whether this surface asks to be registered by default when handed to
    /// an initializer (e.g. as a plugin-contributed surface).
    pub fn auto_register(&self) -> bool {
        self.auto_register
    }

    /// Look up an event declaration by name.
    pub fn event(&self, event_name: &str) -> Result<&EventDecl, BusError> {
        self.events
            .get(event_name)
            .ok_or_else(|| BusError::EventNotFound {
                api_name: self.name.clone(),
                event_name: event_name.to_string(),
            })
    }

    pub fn events(&self) -> impl Iterator<Item = (&str, &EventDecl)> {
        self.events.iter().map(|(name, decl)| (name.as_str(), decl))
    }

    pub fn has_procedure(&self, procedure_name: &str) -> bool {
        self.procedures.contains_key(procedure_name)
    }

    pub fn procedure_names(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }

    /// Invoke the named procedure with arguments supplied by name.
    ///
    /// Returns the invocation future, or [`BusError::ProcedureNotFound`]
    /// when the member is not a procedure on this surface.
    pub fn call(
        &self,
        procedure_name: &str,
        kwargs: Kwargs,
    ) -> Result<BoxFuture<Result<Value, HandlerError>>, BusError> {
        let procedure =
            self.procedures
                .get(procedure_name)
                .ok_or_else(|| BusError::ProcedureNotFound {
                    api_name: self.name.clone(),
                    procedure_name: procedure_name.to_string(),
                })?;
        Ok(procedure(kwargs))
    }
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("name", &self.name)
            .field("internal", &self.internal)
            .field("auto_register", &self.auto_register)
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .field("procedures", &self.procedures.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Builder for [`Api`] surfaces.
///
/// `build()` performs the registration sanity checks: the surface must carry
/// a name, and every name must fit the `<api>.<member>` addressing grammar.
pub struct ApiBuilder {
    name: String,
    internal: bool,
    auto_register: bool,
    events: BTreeMap<String, EventDecl>,
    procedures: BTreeMap<String, ProcedureFn>,
}

impl ApiBuilder {
    /// Mark the surface as bus-infrastructural. Internal surfaces
    /// conventionally use the `internal.` name prefix.
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn auto_register(mut self, auto_register: bool) -> Self {
        self.auto_register = auto_register;
        self
    }

    /// Declare an event and the named parameters it carries.
    pub fn event<I, S>(mut self, event_name: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events.insert(event_name.into(), EventDecl::new(arguments));
        self
    }

    /// Declare a procedure. Arguments arrive by name from the envelope's
    /// keyword arguments.
    pub fn procedure<F, Fut>(mut self, procedure_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let invoker: ProcedureFn = Arc::new(move |kwargs| Box::pin(handler(kwargs)));
        self.procedures.insert(procedure_name.into(), invoker);
        self
    }

    pub fn build(self) -> Result<Api, BusError> {
        if self.name.is_empty() {
            return Err(BusError::MisconfiguredApiOptions(
                "the surface does not specify a name; the name is the address \
                 used to reach the surface on the bus"
                    .to_string(),
            ));
        }
        if !valid_api_name(&self.name) {
            return Err(BusError::MisconfiguredApiOptions(format!(
                "surface name '{}' does not match the addressing grammar \
                 (dot-separated segments of [A-Za-z_][A-Za-z0-9_]*)",
                self.name
            )));
        }
        for member in self.events.keys().chain(self.procedures.keys()) {
            if !valid_name_segment(member) {
                return Err(BusError::MisconfiguredApiOptions(format!(
                    "member name '{member}' on surface '{}' does not match \
                     [A-Za-z_][A-Za-z0-9_]*",
                    self.name
                )));
            }
        }
        Ok(Api {
            name: self.name,
            internal: self.internal,
            auto_register: self.auto_register,
            events: self.events,
            procedures: self.procedures,
        })
    }
}
