//! Protocol-conformant worker simulator.
//!
//! Stands in for a PHP worker in the integration tests: speaks the wire
//! protocol over stdin/stdout, honors `MAX_REQUESTS`, and misbehaves on
//! demand. The "script path" argument is a comma-separated behavior spec:
//!
//! - `echo`            respond 200 with the request body (default)
//! - `delay:<ms>`      sleep before responding
//! - `error:<msg>`     answer with an ERROR frame
//! - `badmagic`        answer with garbage bytes instead of a frame
//! - `poison:<path>`   misbehave like `badmagic` until `<path>` exists
//! - `noready`         omit the trailing WORKER_READY and exit
//! - `report-env`      respond with the worker-relevant environment
//!
//! Example: `stub-worker delay:500,echo`

use membrane::protocol::message::{
    self, ResponseHeaders, StreamHeaders, EVENT_MESSAGE,
};
use membrane::protocol::wire::{
    self, Frame, ProtocolError, TYPE_PING, TYPE_REQUEST, TYPE_STREAM_DATA, TYPE_WORKER_STOP,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Default)]
struct Behavior {
    delay: Option<Duration>,
    error_message: Option<String>,
    bad_magic: bool,
    poison_marker: Option<PathBuf>,
    skip_ready: bool,
    report_env: bool,
}

impl Behavior {
    fn parse(spec: &str) -> Self {
        let mut behavior = Self::default();
        for token in spec.split(',') {
            let token = token.trim();
            if let Some(ms) = token.strip_prefix("delay:") {
                behavior.delay = ms.parse().ok().map(Duration::from_millis);
            } else if let Some(msg) = token.strip_prefix("error:") {
                behavior.error_message = Some(msg.to_string());
            } else if let Some(path) = token.strip_prefix("poison:") {
                behavior.poison_marker = Some(PathBuf::from(path));
            } else {
                match token {
                    "badmagic" => behavior.bad_magic = true,
                    "noready" => behavior.skip_ready = true,
                    "report-env" => behavior.report_env = true,
                    _ => {} // "echo" and unknown tokens fall through to echo
                }
            }
        }
        behavior
    }

    /// Whether this request should be answered with garbage. The poison
    /// marker makes the misbehavior one-shot across respawns.
    fn should_corrupt(&self) -> bool {
        if self.bad_magic {
            return true;
        }
        if let Some(marker) = &self.poison_marker {
            if !marker.exists() {
                let _ = std::fs::write(marker, b"poisoned");
                return true;
            }
        }
        false
    }
}

fn main() {
    let spec = std::env::args().nth(1).unwrap_or_else(|| "echo".to_string());
    let behavior = Behavior::parse(&spec);
    if let Err(e) = run(&behavior) {
        eprintln!("stub-worker: {}", e);
        std::process::exit(1);
    }
}

fn run(behavior: &Behavior) -> Result<(), ProtocolError> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    let max_requests: Option<u64> = std::env::var("MAX_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok());
    let mut served: u64 = 0;

    wire::write_frame_sync(&mut output, &Frame::worker_ready())?;

    loop {
        let frame = match wire::read_frame_sync(&mut input) {
            Ok(frame) => frame,
            // Parent went away or closed stdin.
            Err(_) => return Ok(()),
        };

        match frame.frame_type {
            TYPE_WORKER_STOP => return Ok(()),
            TYPE_PING => {
                wire::write_frame_sync(&mut output, &Frame::pong())?;
            }
            TYPE_REQUEST => {
                if let Some(delay) = behavior.delay {
                    std::thread::sleep(delay);
                }

                if behavior.should_corrupt() {
                    output.write_all(&[0xDE, 0xAD, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])?;
                    output.flush()?;
                    continue;
                }

                if let Some(msg) = &behavior.error_message {
                    wire::write_frame_sync(&mut output, &Frame::error(msg.clone()))?;
                } else {
                    let (_request, body) = message::decode_request(frame)?;
                    let payload = if behavior.report_env {
                        render_env()
                    } else {
                        body
                    };
                    let response = ResponseHeaders {
                        status: 200,
                        headers: HashMap::from([
                            ("Content-Type".to_string(), "text/plain".to_string()),
                            ("x-stub-pid".to_string(), std::process::id().to_string()),
                        ]),
                    };
                    wire::write_frame_sync(
                        &mut output,
                        &message::encode_response(&response, payload)?,
                    )?;
                }

                if behavior.skip_ready {
                    // Die without announcing readiness, like a worker that
                    // crashed during post-request cleanup.
                    return Ok(());
                }
                wire::write_frame_sync(&mut output, &Frame::worker_ready())?;

                served += 1;
                if let Some(max) = max_requests
                    && served >= max
                {
                    // Self-recycle, the way a memory-capped worker would.
                    return Ok(());
                }
            }
            TYPE_STREAM_DATA => {
                let (headers, payload) = message::decode_stream_data(frame)?;
                let reply = StreamHeaders {
                    connection_id: headers.connection_id,
                    event: EVENT_MESSAGE.to_string(),
                    room: headers.room,
                };
                wire::write_frame_sync(
                    &mut output,
                    &message::encode_stream_data(0, &reply, payload)?,
                )?;
                wire::write_frame_sync(&mut output, &Frame::worker_ready())?;
            }
            other => {
                wire::write_frame_sync(
                    &mut output,
                    &Frame::error(format!("unexpected frame type 0x{:02x}", other)),
                )?;
                wire::write_frame_sync(&mut output, &Frame::worker_ready())?;
            }
        }
    }
}

/// Render the worker-relevant environment, sorted for stable assertions.
fn render_env() -> Vec<u8> {
    let mut lines: Vec<String> = std::env::vars()
        .filter(|(key, _)| key == "MAX_REQUESTS" || key.starts_with("PHP_INI_"))
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    lines.sort();
    lines.join("\n").into_bytes()
}
