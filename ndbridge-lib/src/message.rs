use crate::time_util::epoch_millis;

/// Method the client sends when the debug session starts running; its receipt
/// completes the prelude capture.
pub const SESSION_START_METHOD: &str = "Runtime.runIfWaitingForDebugger";

/// Method the upstream emits when its execution context is torn down.
pub const CONTEXT_DESTROYED_METHOD: &str = "Runtime.executionContextDestroyed";

/// Method of the synthetic console event sent downstream after a reconnect.
pub const CONSOLE_API_METHOD: &str = "Runtime.consoleAPICalled";

/// Extract the `method` field of a protocol frame. Frames that are not JSON
/// objects or carry no method yield `None`; they relay as opaque payload.
pub(crate) fn method_of(frame: &str) -> Option<String> {
  let value: serde_json::Value = serde_json::from_str(frame).ok()?;
  value.get("method")?.as_str().map(str::to_owned)
}

/// Build a console-log-shaped event carrying the given string arguments.
/// Sent downstream only, never upstream.
pub(crate) fn console_log_event(args: &[&str]) -> String {
  let args = args
    .iter()
    .map(|value| serde_json::json!({"type": "string", "value": value}))
    .collect::<Vec<_>>();
  serde_json::json!({
    "method": CONSOLE_API_METHOD,
    "params": {
      "type": "log",
      "args": args,
      "executionContextId": 1,
      "timestamp": epoch_millis(),
    }
  })
  .to_string()
}
