//! Purpose: Hold the name→handler mapping for every capability the gateway exposes.
//! Exports: `Registry`, `Capability`, `CapabilityEntry`, `CapabilityKind`, `Handler`, `Peer`.
//! Role: Leaf component consulted by the protocol pipeline for discovery and dispatch.
//! Invariants: `(kind, name)` is unique; resource URIs are unique; duplicates are rejected.
//! Invariants: Registration happens before the gateway is built; no deregistration exists.
//! Invariants: Arguments are validated against the compiled input schema before a handler runs.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use url::Url;

use crate::core::error::{Error, ErrorKind};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, Error>> + Send>>;
pub type Handler = Arc<dyn Fn(Map<String, Value>, Peer) -> HandlerFuture + Send + Sync>;
type NotifySink = Arc<dyn Fn(Value) -> Result<(), Error> + Send + Sync>;

/// Wraps an async closure into a shareable capability handler.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Error>> + Send + 'static,
{
    Arc::new(move |args, _peer| Box::pin(f(args)))
}

/// Like [`handler`], but the closure also receives the calling [`Peer`].
pub fn peer_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Map<String, Value>, Peer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Error>> + Send + 'static,
{
    Arc::new(move |args, peer| Box::pin(f(args, peer)))
}

/// The connection a call arrived on, as seen by its handler.
///
/// Notifications sent through it travel on the caller's push channel: the
/// SSE stream for an HTTP session, stdout for the local peer. A detached
/// peer has no channel and drops them.
#[derive(Clone, Default)]
pub struct Peer {
    session: Option<String>,
    sink: Option<NotifySink>,
}

impl Peer {
    pub fn new<F>(session: Option<String>, sink: F) -> Self
    where
        F: Fn(Value) -> Result<(), Error> + Send + Sync + 'static,
    {
        Self {
            session,
            sink: Some(Arc::new(sink)),
        }
    }

    pub fn detached() -> Self {
        Self::default()
    }

    /// Session id of the caller; `None` for the local peer.
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<(), Error> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        sink(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("session", &self.session)
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Resource => "resource",
            CapabilityKind::Prompt => "prompt",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative half of a registration; the handler is supplied separately.
#[derive(Clone, Debug, PartialEq)]
pub struct Capability {
    kind: CapabilityKind,
    name: String,
    description: String,
    input_schema: Value,
    uri: Option<String>,
    mime_type: Option<String>,
}

impl Capability {
    pub fn new(
        kind: CapabilityKind,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            description: description.into(),
            input_schema: json!({ "type": "object" }),
            uri: None,
            mime_type: None,
        }
    }

    pub fn tool(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Tool, name, description)
    }

    pub fn prompt(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Prompt, name, description)
    }

    pub fn resource(
        uri: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let mut capability = Self::new(CapabilityKind::Resource, name, description);
        capability.uri = Some(uri.into());
        capability
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

pub struct CapabilityEntry {
    kind: CapabilityKind,
    name: String,
    description: String,
    input_schema: Value,
    uri: Option<String>,
    mime_type: Option<String>,
    validator: JSONSchema,
    handler: Handler,
}

impl CapabilityEntry {
    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    fn validate(&self, instance: &Value) -> Result<(), Error> {
        if let Err(errors) = self.validator.validate(instance) {
            let details = errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{path}: {error}")
                    }
                })
                .collect::<Vec<_>>();
            return Err(Error::new(ErrorKind::InvalidArguments)
                .with_message(format!("invalid arguments: {}", details.join("; "))));
        }
        Ok(())
    }
}

impl fmt::Debug for CapabilityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityEntry")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct Registry {
    entries: Vec<CapabilityEntry>,
    by_key: HashMap<(CapabilityKind, String), usize>,
    by_uri: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one capability. Duplicate `(kind, name)` pairs and duplicate
    /// resource URIs are rejected rather than overwritten.
    pub fn register(&mut self, capability: Capability, handler: Handler) -> Result<(), Error> {
        let name = capability.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("{} name must not be empty", capability.kind)));
        }
        let key = (capability.kind, name.clone());
        if self.by_key.contains_key(&key) {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message(format!("{} already registered: {name}", capability.kind)));
        }

        let uri = match (capability.kind, capability.uri) {
            (CapabilityKind::Resource, Some(uri)) => {
                Url::parse(&uri).map_err(|err| {
                    Error::new(ErrorKind::Usage)
                        .with_message(format!("resource uri is not an absolute URL: {uri}"))
                        .with_source(err)
                })?;
                if self.by_uri.contains_key(&uri) {
                    return Err(Error::new(ErrorKind::AlreadyExists)
                        .with_message(format!("resource uri already registered: {uri}")));
                }
                Some(uri)
            }
            (CapabilityKind::Resource, None) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("resource {name} requires a uri")));
            }
            (_, _) => None,
        };

        if let Some(schema_type) = capability.input_schema.get("type") {
            if schema_type != "object" {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("input schema for {name} must describe an object")));
            }
        }
        let validator = JSONSchema::compile(&capability.input_schema).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("input schema for {name} does not compile: {err}"))
        })?;

        let index = self.entries.len();
        if let Some(uri) = &uri {
            self.by_uri.insert(uri.clone(), index);
        }
        self.by_key.insert(key, index);
        self.entries.push(CapabilityEntry {
            kind: capability.kind,
            name,
            description: capability.description,
            input_schema: capability.input_schema,
            uri,
            mime_type: capability.mime_type,
            validator,
            handler,
        });
        Ok(())
    }

    pub fn register_tool<F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        schema: Value,
        f: F,
    ) -> Result<(), Error>
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        self.register(
            Capability::tool(name, description).with_schema(schema),
            handler(f),
        )
    }

    /// Registers a tool whose handler can notify its caller while it runs.
    pub fn register_tool_with_peer<F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        schema: Value,
        f: F,
    ) -> Result<(), Error>
    where
        F: Fn(Map<String, Value>, Peer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        self.register(
            Capability::tool(name, description).with_schema(schema),
            peer_handler(f),
        )
    }

    pub fn register_resource<F, Fut>(
        &mut self,
        uri: &str,
        name: &str,
        description: &str,
        mime_type: &str,
        f: F,
    ) -> Result<(), Error>
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        self.register(
            Capability::resource(uri, name, description).with_mime_type(mime_type),
            handler(f),
        )
    }

    pub fn register_prompt<F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        schema: Value,
        f: F,
    ) -> Result<(), Error>
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        self.register(
            Capability::prompt(name, description).with_schema(schema),
            handler(f),
        )
    }

    /// Entries of one kind, in registration order.
    pub fn list(&self, kind: CapabilityKind) -> impl Iterator<Item = &CapabilityEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    pub fn get(&self, kind: CapabilityKind, name: &str) -> Option<&CapabilityEntry> {
        self.by_key
            .get(&(kind, name.to_string()))
            .and_then(|index| self.entries.get(*index))
    }

    pub fn resource_by_uri(&self, uri: &str) -> Option<&CapabilityEntry> {
        self.by_uri.get(uri).and_then(|index| self.entries.get(*index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn dispatch(
        &self,
        kind: CapabilityKind,
        name: &str,
        args: Map<String, Value>,
    ) -> Result<Value, Error> {
        self.dispatch_with_peer(kind, name, args, Peer::detached()).await
    }

    pub async fn dispatch_with_peer(
        &self,
        kind: CapabilityKind,
        name: &str,
        args: Map<String, Value>,
        peer: Peer,
    ) -> Result<Value, Error> {
        let entry = self.get(kind, name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("{kind} not found: {name}"))
        })?;

        let instance = Value::Object(args);
        entry.validate(&instance)?;
        let Value::Object(args) = instance else {
            return Err(Error::new(ErrorKind::Internal).with_message("arguments lost their shape"));
        };

        let run = Arc::clone(&entry.handler);
        run(args, peer).await
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["a", "b"]
        })
    }

    fn registry_with_add() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_tool("add", "Add two numbers", add_schema(), |args| async move {
                let a = args.get("a").and_then(Value::as_f64).unwrap_or_default();
                let b = args.get("b").and_then(Value::as_f64).unwrap_or_default();
                Ok(json!(a + b))
            })
            .expect("register add");
        registry
    }

    #[tokio::test]
    async fn every_kind_lists_and_dispatches_after_register() {
        let mut registry = registry_with_add();
        registry
            .register_resource(
                "gateway://info",
                "info",
                "Gateway info",
                "application/json",
                |_| async { Ok(json!({"ok": true})) },
            )
            .expect("register resource");
        registry
            .register_prompt(
                "greet",
                "Greeting",
                json!({"type":"object","properties":{"who":{"type":"string"}}}),
                |args| async move { Ok(json!(format!("hi {}", args["who"]))) },
            )
            .expect("register prompt");

        for (kind, name, args) in [
            (CapabilityKind::Tool, "add", json!({"a": 2, "b": 3})),
            (CapabilityKind::Resource, "info", json!({})),
            (CapabilityKind::Prompt, "greet", json!({"who": "ada"})),
        ] {
            let names = registry.list(kind).map(CapabilityEntry::name).collect::<Vec<_>>();
            assert_eq!(names, vec![name]);
            let Value::Object(args) = args else {
                panic!("object args");
            };
            registry.dispatch(kind, name, args).await.expect("dispatch");
        }
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn dispatch_runs_handler_with_valid_arguments() {
        let registry = registry_with_add();
        let args = json!({"a": 2, "b": 3});
        let result = registry
            .dispatch(CapabilityKind::Tool, "add", args.as_object().cloned().expect("map"))
            .await
            .expect("dispatch");
        assert_eq!(result, json!(5.0));
    }

    #[tokio::test]
    async fn dispatch_unknown_name_is_not_found() {
        let registry = registry_with_add();
        let err = registry
            .dispatch(CapabilityKind::Tool, "subtract", Map::new())
            .await
            .expect_err("not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().unwrap_or_default().contains("not found"));
    }

    #[tokio::test]
    async fn dispatch_rejects_schema_mismatch_before_handler() {
        let mut registry = Registry::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        registry
            .register_tool("add", "Add", add_schema(), move |_| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Ok(json!(0)) }
            })
            .expect("register");
        let args = json!({"a": "two"});
        let err = registry
            .dispatch(CapabilityKind::Tool, "add", args.as_object().cloned().expect("map"))
            .await
            .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        assert!(err.message().unwrap_or_default().starts_with("invalid arguments"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn peer_handlers_notify_the_caller() {
        let mut registry = Registry::new();
        registry
            .register_tool_with_peer(
                "tick",
                "Tick",
                json!({"type":"object"}),
                |_, peer| async move {
                    peer.notify("notifications/progress", json!({"progress": 1}))?;
                    Ok(json!(peer.session_id()))
                },
            )
            .expect("register");

        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let peer = Peer::new(Some("abc".to_string()), move |message| {
            sink.lock().expect("lock").push(message);
            Ok(())
        });
        let result = registry
            .dispatch_with_peer(CapabilityKind::Tool, "tick", Map::new(), peer)
            .await
            .expect("dispatch");
        assert_eq!(result, json!("abc"));
        let sent = sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["method"], json!("notifications/progress"));
        assert_eq!(sent[0]["jsonrpc"], json!("2.0"));
        assert!(sent[0].get("id").is_none());

        let detached = registry
            .dispatch(CapabilityKind::Tool, "tick", Map::new())
            .await
            .expect("detached peer drops notifications");
        assert_eq!(detached, Value::Null);
    }

    #[test]
    fn duplicate_kind_and_name_is_rejected() {
        let mut registry = registry_with_add();
        let err = registry
            .register_tool("add", "Again", add_schema(), |_| async { Ok(Value::Null) })
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        registry
            .register_prompt("add", "Same name, other kind", json!({"type":"object"}), |_| async {
                Ok(Value::Null)
            })
            .expect("distinct kind is fine");
    }

    #[test]
    fn resources_need_unique_absolute_uris() {
        let mut registry = Registry::new();
        let err = registry
            .register_resource("not a uri", "bad", "Bad", "text/plain", |_| async {
                Ok(Value::Null)
            })
            .expect_err("relative uri");
        assert_eq!(err.kind(), ErrorKind::Usage);

        registry
            .register_resource("docs://readme", "readme", "Readme", "text/plain", |_| async {
                Ok(json!("hello"))
            })
            .expect("register");
        let err = registry
            .register_resource("docs://readme", "readme2", "Copy", "text/plain", |_| async {
                Ok(Value::Null)
            })
            .expect_err("duplicate uri");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(
            registry.resource_by_uri("docs://readme").map(CapabilityEntry::name),
            Some("readme")
        );
    }

    #[test]
    fn non_object_schema_is_rejected() {
        let mut registry = Registry::new();
        let err = registry
            .register_tool("bad", "Bad", json!({"type": "string"}), |_| async {
                Ok(Value::Null)
            })
            .expect_err("non-object schema");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(registry.is_empty());
    }

    #[test]
    fn list_preserves_registration_order() {
        let mut registry = Registry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry
                .register_tool(name, name, json!({"type":"object"}), |_| async { Ok(Value::Null) })
                .expect("register");
        }
        let names = registry
            .list(CapabilityKind::Tool)
            .map(CapabilityEntry::name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(registry.list(CapabilityKind::Prompt).count(), 0);
    }
}
