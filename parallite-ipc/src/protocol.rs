//! Submission and response envelopes
//!
//! The daemon reads only the top-level envelope keys. `payload`, `context`,
//! `result`, and `benchmark` are opaque and travel as the original bytes:
//! [`Submission`] and [`WorkerReply`] validate the envelope and keep the
//! verbatim frame payload alongside, so forwarding never re-encodes user
//! data. Unknown submission keys are ignored; unknown response keys ride to
//! the client untouched.

use bytes::Bytes;
use rmpv::Value;

use crate::error::IpcError;

/// The only message kind today; the `type` key is reserved for more.
pub const MSG_TYPE_SUBMIT: &str = "submit";

/// A validated client submission, retaining the verbatim frame payload.
#[derive(Debug, Clone)]
pub struct Submission {
    task_id: String,
    enable_benchmark: bool,
    raw: Bytes,
}

impl Submission {
    /// Decode and validate a submission envelope.
    ///
    /// Required keys: `type` (must be `"submit"`), `task_id` (non-empty
    /// string), and `payload`. `context` must be a map when present and
    /// `enable_benchmark` a boolean when present. Anything else is ignored.
    pub fn decode(raw: Bytes) -> Result<Self, IpcError> {
        let value = read_envelope(&raw)?;
        let entries = as_map(&value)?;

        let mut msg_type: Option<&str> = None;
        let mut task_id: Option<String> = None;
        let mut has_payload = false;
        let mut context_is_map = true;
        let mut enable_benchmark = false;
        for (key, val) in entries {
            let Some(key) = key.as_str() else { continue };
            match key {
                "type" => msg_type = val.as_str(),
                "task_id" => task_id = val.as_str().map(str::to_owned),
                "payload" => has_payload = true,
                "context" => context_is_map = val.is_map() || val.is_nil(),
                "enable_benchmark" => enable_benchmark = val.as_bool().unwrap_or(false),
                _ => {}
            }
        }

        match msg_type {
            Some(MSG_TYPE_SUBMIT) => {}
            Some(other) => {
                let reason = format!("unsupported message type {other:?}");
                return Err(IpcError::invalid(reason, task_id));
            }
            None => return Err(IpcError::invalid("missing \"type\" key", task_id)),
        }
        let task_id = match task_id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(IpcError::invalid("missing or empty \"task_id\"", None)),
        };
        if !has_payload {
            return Err(IpcError::invalid("missing \"payload\"", Some(task_id)));
        }
        if !context_is_map {
            return Err(IpcError::invalid("\"context\" must be a map", Some(task_id)));
        }

        Ok(Self {
            task_id,
            enable_benchmark,
            raw,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn enable_benchmark(&self) -> bool {
        self.enable_benchmark
    }

    /// Verbatim envelope bytes, forwarded to the worker unchanged.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

/// A validated worker response, retaining the verbatim frame payload.
#[derive(Debug, Clone)]
pub struct WorkerReply {
    task_id: String,
    ok: bool,
    raw: Bytes,
}

impl WorkerReply {
    /// Decode and validate a worker response envelope.
    ///
    /// Required keys: `ok` (bool), `task_id` (string), plus `result` when ok
    /// and `error` (string) when not. Unknown keys are left in place; the
    /// raw bytes go back to the client as-is.
    pub fn decode(raw: Bytes) -> Result<Self, IpcError> {
        let value = read_envelope(&raw)?;
        let entries = as_map(&value)?;

        let mut ok: Option<bool> = None;
        let mut task_id: Option<String> = None;
        let mut has_result = false;
        let mut has_error = false;
        for (key, val) in entries {
            let Some(key) = key.as_str() else { continue };
            match key {
                "ok" => ok = val.as_bool(),
                "task_id" => task_id = val.as_str().map(str::to_owned),
                "result" => has_result = true,
                "error" => has_error = val.is_str(),
                _ => {}
            }
        }

        let task_id = match task_id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(IpcError::invalid("missing or empty \"task_id\"", None)),
        };
        let ok = match ok {
            Some(ok) => ok,
            None => {
                return Err(IpcError::invalid(
                    "missing \"ok\" key",
                    Some(task_id),
                ))
            }
        };
        if ok && !has_result {
            return Err(IpcError::invalid(
                "ok response without \"result\"",
                Some(task_id),
            ));
        }
        if !ok && !has_error {
            return Err(IpcError::invalid(
                "failure response without \"error\" string",
                Some(task_id),
            ));
        }

        Ok(Self { task_id, ok, raw })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Verbatim envelope bytes, written back to the client unchanged.
    pub fn into_raw(self) -> Bytes {
        self.raw
    }
}

/// Fully-decoded response as a client sees it. Used by clients and tests;
/// the daemon itself never takes responses apart this far.
#[derive(Debug, Clone)]
pub struct Response {
    pub ok: bool,
    pub task_id: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub benchmark: Option<Value>,
}

impl Response {
    pub fn decode(raw: &[u8]) -> Result<Self, IpcError> {
        let value = read_envelope(raw)?;
        let entries = as_map(&value)?;

        let mut ok: Option<bool> = None;
        let mut task_id: Option<String> = None;
        let mut result = None;
        let mut error = None;
        let mut benchmark = None;
        for (key, val) in entries {
            let Some(key) = key.as_str() else { continue };
            match key {
                "ok" => ok = val.as_bool(),
                "task_id" => task_id = val.as_str().map(str::to_owned),
                "result" => result = Some(val.clone()),
                "error" => error = val.as_str().map(str::to_owned),
                "benchmark" => benchmark = Some(val.clone()),
                _ => {}
            }
        }

        let task_id = task_id
            .ok_or_else(|| IpcError::invalid("missing or empty \"task_id\"", None))?;
        let ok =
            ok.ok_or_else(|| IpcError::invalid("missing \"ok\" key", Some(task_id.clone())))?;
        Ok(Self {
            ok,
            task_id,
            result,
            error,
            benchmark,
        })
    }
}

/// Build a synthesized failure response `{ok: false, task_id, error}`.
///
/// Key order is fixed, so daemon-authored frames re-encode byte-identically.
pub fn encode_failure(task_id: &str, error: &str) -> Bytes {
    encode_value(&Value::Map(vec![
        (Value::from("ok"), Value::Boolean(false)),
        (Value::from("task_id"), Value::from(task_id)),
        (Value::from("error"), Value::from(error)),
    ]))
}

/// Build a success response `{ok: true, task_id, result[, benchmark]}`.
///
/// This is the worker side of the protocol; the daemon only synthesizes
/// failures.
pub fn encode_success(task_id: &str, result: Value, benchmark: Option<Value>) -> Bytes {
    let mut entries = vec![
        (Value::from("ok"), Value::Boolean(true)),
        (Value::from("task_id"), Value::from(task_id)),
        (Value::from("result"), result),
    ];
    if let Some(benchmark) = benchmark {
        entries.push((Value::from("benchmark"), benchmark));
    }
    encode_value(&Value::Map(entries))
}

/// Build a submission envelope. This is the client side of the protocol;
/// clients in other runtimes produce the same shape.
pub fn encode_submission(task_id: &str, payload: &[u8], enable_benchmark: bool) -> Bytes {
    let mut entries = vec![
        (Value::from("type"), Value::from(MSG_TYPE_SUBMIT)),
        (Value::from("task_id"), Value::from(task_id)),
        (Value::from("payload"), Value::Binary(payload.to_vec())),
        (Value::from("context"), Value::Map(Vec::new())),
    ];
    if enable_benchmark {
        entries.push((Value::from("enable_benchmark"), Value::Boolean(true)));
    }
    encode_value(&Value::Map(entries))
}

/// Encode any MessagePack value to frame-payload bytes.
pub fn encode_value(value: &Value) -> Bytes {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    rmpv::encode::write_value(&mut buf, value).expect("msgpack encode to Vec");
    Bytes::from(buf)
}

fn read_envelope(raw: &[u8]) -> Result<Value, IpcError> {
    let mut cursor = raw;
    let value = rmpv::decode::read_value(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(IpcError::invalid(
            format!("{} trailing bytes after envelope", cursor.len()),
            None,
        ));
    }
    Ok(value)
}

fn as_map(value: &Value) -> Result<&Vec<(Value, Value)>, IpcError> {
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(IpcError::invalid("envelope is not a map", None)),
    }
}
