//! Operator control socket.
//!
//! A line-based Unix domain socket mirroring the command set: each line is
//! one command, answered with `ok`, `rejected: <reason>`, or (for `status`)
//! one JSON telemetry snapshot. `watch` switches the connection to a
//! telemetry stream until the client disconnects. The HTTP/WebSocket UI, if
//! any, lives in a separate process and talks to this socket.

use anyhow::Result;
use motion::Direction;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracking::{Axis, TrackMode};

use crate::arbiter::ArbiterHandle;
use crate::command::{Command, CommandOutcome};
use crate::telemetry::TelemetrySnapshot;

/// Produces a fresh telemetry snapshot on demand.
pub type SnapshotFn = Arc<dyn Fn() -> TelemetrySnapshot + Send + Sync>;

pub async fn run_control_socket(
    path: String,
    handle: ArbiterHandle,
    snapshot: SnapshotFn,
    telemetry: broadcast::Sender<TelemetrySnapshot>,
) -> Result<()> {
    // Clean up any stale socket from a previous run.
    if Path::new(&path).exists() {
        let _ = std::fs::remove_file(&path);
        info!(%path, "removed stale control socket");
    }
    let listener = UnixListener::bind(&path)
        .map_err(|err| anyhow::anyhow!("failed to bind control socket {path}: {err}"))?;
    info!(%path, "control socket listening");

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let handle = handle.clone();
                let snapshot = snapshot.clone();
                let telemetry = telemetry.subscribe();
                tokio::spawn(handle_client(stream, handle, snapshot, telemetry));
            }
            Err(err) => error!(error = %err, "control socket accept failed"),
        }
    }
}

async fn handle_client(
    mut stream: UnixStream,
    handle: ArbiterHandle,
    snapshot: SnapshotFn,
    mut telemetry: broadcast::Receiver<TelemetrySnapshot>,
) {
    info!("operator connected");
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!("operator disconnected");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let reply = match parse_operator_line(trimmed) {
                    Ok(OperatorRequest::Status) => match serde_json::to_string(&snapshot()) {
                        Ok(json) => json,
                        Err(err) => format!("rejected: {err}"),
                    },
                    Ok(OperatorRequest::Watch) => {
                        // The connection becomes a telemetry stream.
                        loop {
                            match telemetry.recv().await {
                                Ok(snap) => {
                                    let Ok(json) = serde_json::to_string(&snap) else {
                                        continue;
                                    };
                                    if writer.write_all(json.as_bytes()).await.is_err()
                                        || writer.write_all(b"\n").await.is_err()
                                    {
                                        return;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    warn!(skipped, "telemetry watcher lagged");
                                }
                                Err(broadcast::error::RecvError::Closed) => return,
                            }
                        }
                    }
                    Ok(OperatorRequest::Submit(command)) => match handle.submit(command).await {
                        CommandOutcome::Ok => "ok".to_string(),
                        CommandOutcome::Rejected(reason) => format!("rejected: {reason}"),
                    },
                    Err(reason) => format!("rejected: {reason}"),
                };
                if writer.write_all(reply.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "control socket read failed");
                break;
            }
        }
    }
}

pub enum OperatorRequest {
    Status,
    Watch,
    Submit(Command),
}

fn arg<T: FromStr>(args: &[&str], index: usize, name: &str) -> Result<T, String> {
    let raw = args
        .get(index)
        .ok_or_else(|| format!("missing argument '{name}'"))?;
    raw.parse()
        .map_err(|_| format!("invalid value '{raw}' for '{name}'"))
}

/// Parses one operator line into a request.
pub fn parse_operator_line(line: &str) -> Result<OperatorRequest, String> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().ok_or("empty command")?.to_ascii_lowercase();
    let args: Vec<&str> = parts.collect();

    let command = match verb.as_str() {
        "status" => return Ok(OperatorRequest::Status),
        "watch" => return Ok(OperatorRequest::Watch),
        "jog" => {
            let axis = match args.first().copied() {
                Some("x") => Axis::X,
                Some("y") => Axis::Y,
                _ => return Err("usage: jog <x|y> <steps>".into()),
            };
            let steps: i64 = arg(&args, 1, "steps")?;
            Command::Jog {
                axis,
                steps: steps.unsigned_abs() as u32,
                direction: if steps >= 0 {
                    Direction::Cw
                } else {
                    Direction::Ccw
                },
            }
        }
        "move" => Command::MoveAbsolute {
            x_steps: arg(&args, 0, "x_steps")?,
            y_steps: arg(&args, 1, "y_steps")?,
        },
        "center" => Command::CenterOnPixel {
            x: arg(&args, 0, "x")?,
            y: arg(&args, 1, "y")?,
            frame_w: arg(&args, 2, "frame_w")?,
            frame_h: arg(&args, 3, "frame_h")?,
        },
        "track" => Command::TrackTarget {
            cx: arg(&args, 0, "cx")?,
            cy: arg(&args, 1, "cy")?,
            frame_w: arg(&args, 2, "frame_w")?,
            frame_h: arg(&args, 3, "frame_h")?,
            ts: Instant::now(),
        },
        "mode" => match args.first().copied() {
            Some("camera") => Command::SetMode(TrackMode::Camera),
            Some("crosshair") => Command::SetMode(TrackMode::Crosshair),
            _ => return Err("usage: mode <camera|crosshair>".into()),
        },
        "home" => Command::Home,
        "sethome" => Command::SetHome,
        "enable" => Command::Enable,
        "disable" => Command::Disable,
        "arm" => match args.first().copied() {
            Some("on") => Command::LaserArm(true),
            Some("off") => Command::LaserArm(false),
            _ => return Err("usage: arm <on|off>".into()),
        },
        "power" => Command::LaserSetPower {
            pct: arg(&args, 0, "pct")?,
        },
        "fire" => Command::LaserFire {
            duration_ms: if args.is_empty() {
                0
            } else {
                arg(&args, 0, "duration_ms")?
            },
        },
        "burst" => Command::LaserBurst {
            count: arg(&args, 0, "count")?,
            on_ms: arg(&args, 1, "on_ms")?,
            off_ms: arg(&args, 2, "off_ms")?,
        },
        _ => return Err(format!("unknown command '{verb}'")),
    };
    Ok(OperatorRequest::Submit(command))
}
