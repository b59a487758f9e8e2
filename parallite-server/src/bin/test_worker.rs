//! parallite-test-worker: reference executor for the dispatch protocol
//!
//! Speaks the worker side of the protocol over stdio and interprets the
//! opaque `payload` as a UTF-8 command string. The daemon never sees any
//! of this vocabulary; it exists so the test suite can stand up real
//! workers with controllable behavior, and it doubles as a working example
//! for executor implementers.
//!
//! Commands:
//!   echo <text>        respond with <text> as the result
//!   sleep <ms> <text>  sleep, then respond with <text>
//!   pid                respond with this process's pid
//!   exit <code>        exit immediately without responding
//!   garbage            respond with a frame that is not a valid envelope

use std::time::Instant;

use rmpv::Value;

use parallite_ipc::protocol::encode_value;
use parallite_ipc::{encode_failure, encode_success, StdioEndpoint};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mut endpoint = StdioEndpoint::new();
    loop {
        let frame = match endpoint.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break, // daemon closed stdin: exit cleanly
            Err(e) => {
                eprintln!("recv failed: {e}");
                std::process::exit(1);
            }
        };

        let started = Instant::now();
        let Some(request) = Request::decode(&frame) else {
            eprintln!("malformed request frame");
            std::process::exit(1);
        };

        let response = request.run(started).await;
        if let Err(e) = endpoint.send(&response).await {
            eprintln!("send failed: {e}");
            std::process::exit(1);
        }
    }
}

struct Request {
    task_id: String,
    command: String,
    enable_benchmark: bool,
}

impl Request {
    fn decode(frame: &[u8]) -> Option<Self> {
        let mut cursor = frame;
        let value = rmpv::decode::read_value(&mut cursor).ok()?;
        let Value::Map(entries) = value else {
            return None;
        };

        let mut task_id = None;
        let mut command = None;
        let mut enable_benchmark = false;
        for (key, val) in &entries {
            match key.as_str() {
                Some("task_id") => task_id = val.as_str().map(str::to_owned),
                Some("payload") => {
                    command = match val {
                        Value::Binary(bytes) => String::from_utf8(bytes.clone()).ok(),
                        Value::String(s) => s.as_str().map(str::to_owned),
                        _ => None,
                    };
                }
                Some("enable_benchmark") => {
                    enable_benchmark = val.as_bool().unwrap_or(false);
                }
                _ => {}
            }
        }

        Some(Self {
            task_id: task_id?,
            command: command?,
            enable_benchmark,
        })
    }

    async fn run(&self, started: Instant) -> Vec<u8> {
        let (verb, rest) = match self.command.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (self.command.as_str(), ""),
        };

        let result = match verb {
            "echo" => Value::from(rest),
            "sleep" => {
                let (ms, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let ms: u64 = ms.parse().unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                Value::from(text)
            }
            "pid" => Value::from(u64::from(std::process::id())),
            "exit" => {
                let code: i32 = rest.parse().unwrap_or(1);
                eprintln!("exiting with code {code} as instructed");
                std::process::exit(code);
            }
            "garbage" => {
                return encode_value(&Value::from("not an envelope")).to_vec();
            }
            other => {
                return encode_failure(&self.task_id, &format!("unknown command: {other}"))
                    .to_vec();
            }
        };

        let benchmark = self.enable_benchmark.then(|| {
            Value::Map(vec![(
                Value::from("duration_ms"),
                Value::from(started.elapsed().as_millis() as u64),
            )])
        });
        encode_success(&self.task_id, result, benchmark).to_vec()
    }
}
