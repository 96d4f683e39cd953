//! Purpose: Demo capabilities the `capgate` binary registers at startup.
//! Exports: `builtin_registry`.
//! Role: Gives a freshly started gateway something to list and call.

use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::debug;

use capgate::core::error::{Error, ErrorKind};
use capgate::mcp::Implementation;
use capgate::registry::{Peer, Registry};

pub fn builtin_registry(implementation: &Implementation) -> Result<Registry, Error> {
    let mut registry = Registry::new();

    registry.register_tool(
        "add",
        "Add two numbers and return the sum as text.",
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "number" },
                "b": { "type": "number" }
            },
            "required": ["a", "b"],
            "additionalProperties": false
        }),
        |args| async move { add(&args).map(Value::String) },
    )?;

    registry.register_tool(
        "echo",
        "Return the given text unchanged.",
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        }),
        |args| async move { Ok(args.get("text").cloned().unwrap_or(Value::Null)) },
    )?;

    registry.register_tool_with_peer(
        "countdown",
        "Count down to zero, sending one log notification per step to the caller.",
        json!({
            "type": "object",
            "properties": {
                "from": { "type": "integer", "minimum": 1, "maximum": 10 },
                "interval_ms": { "type": "integer", "minimum": 0, "maximum": 1000 }
            },
            "required": ["from"]
        }),
        |args, peer| async move { countdown(&args, &peer).await },
    )?;

    let info = json!({
        "name": implementation.name,
        "version": implementation.version,
    });
    registry.register_resource(
        "gateway://info",
        "gateway-info",
        "Name and version of this gateway.",
        "application/json",
        move |_| {
            let info = info.clone();
            async move { Ok(info) }
        },
    )?;

    registry.register_prompt(
        "summarize",
        "Ask the model for a short summary of a topic.",
        json!({
            "type": "object",
            "properties": { "topic": { "type": "string", "description": "What to summarize" } },
            "required": ["topic"]
        }),
        |args| async move {
            let topic = args.get("topic").and_then(Value::as_str).unwrap_or_default();
            Ok(Value::String(format!(
                "Summarize the following topic in three sentences: {topic}"
            )))
        },
    )?;

    Ok(registry)
}

fn add(args: &Map<String, Value>) -> Result<String, Error> {
    let (Some(a), Some(b)) = (args.get("a"), args.get("b")) else {
        return Err(Error::new(ErrorKind::InvalidArguments).with_message("a and b are required"));
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(sum.to_string());
        }
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok((a + b).to_string()),
        _ => Err(Error::new(ErrorKind::InvalidArguments).with_message("a and b must be numbers")),
    }
}

async fn countdown(args: &Map<String, Value>, peer: &Peer) -> Result<Value, Error> {
    let from = args.get("from").and_then(Value::as_u64).unwrap_or(1);
    let interval_ms = args.get("interval_ms").and_then(Value::as_u64).unwrap_or(0);
    let interval = Duration::from_millis(interval_ms);
    for remaining in (1..=from).rev() {
        let params = json!({
            "level": "info",
            "logger": "countdown",
            "data": { "remaining": remaining }
        });
        if let Err(err) = peer.notify("notifications/message", params) {
            debug!(error = %err, "countdown step not delivered");
        }
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(Value::String("liftoff".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgate::registry::CapabilityKind;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn add_prefers_integer_formatting() {
        assert_eq!(add(&args(json!({"a": 2, "b": 3}))).expect("sum"), "5");
        assert_eq!(add(&args(json!({"a": 1.5, "b": 2}))).expect("sum"), "3.5");
    }

    #[tokio::test]
    async fn every_builtin_is_listed_and_callable() {
        let registry =
            builtin_registry(&Implementation::new("capgate", "9.9.9")).expect("registry");
        assert_eq!(registry.list(CapabilityKind::Tool).count(), 3);
        assert_eq!(registry.list(CapabilityKind::Resource).count(), 1);
        assert_eq!(registry.list(CapabilityKind::Prompt).count(), 1);

        let echoed = registry
            .dispatch(CapabilityKind::Tool, "echo", args(json!({"text": "hi"})))
            .await
            .expect("echo");
        assert_eq!(echoed, json!("hi"));

        let info = registry
            .dispatch(CapabilityKind::Resource, "gateway-info", Map::new())
            .await
            .expect("info");
        assert_eq!(info["version"], json!("9.9.9"));

        let err = registry
            .dispatch(CapabilityKind::Tool, "add", args(json!({"a": "two", "b": 3})))
            .await
            .expect_err("schema rejects strings");
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[tokio::test]
    async fn countdown_notifies_each_step_then_lands() {
        let registry = builtin_registry(&Implementation::default()).expect("registry");
        let sent = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&sent);
        let peer = Peer::new(None, move |message| {
            sink.lock().expect("lock").push(message);
            Ok(())
        });

        let result = registry
            .dispatch_with_peer(CapabilityKind::Tool, "countdown", args(json!({"from": 3})), peer)
            .await
            .expect("countdown");
        assert_eq!(result, json!("liftoff"));

        let sent = sent.lock().expect("lock");
        let remaining = sent
            .iter()
            .map(|message| message["params"]["data"]["remaining"].clone())
            .collect::<Vec<_>>();
        assert_eq!(remaining, vec![json!(3), json!(2), json!(1)]);
        assert!(sent.iter().all(|message| message["method"] == json!("notifications/message")));
    }

    #[tokio::test]
    async fn countdown_range_is_enforced_by_schema() {
        let registry = builtin_registry(&Implementation::default()).expect("registry");
        let err = registry
            .dispatch(CapabilityKind::Tool, "countdown", args(json!({"from": 0})))
            .await
            .expect_err("below minimum");
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }
}
