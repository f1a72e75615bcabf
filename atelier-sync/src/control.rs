//! Host control channel: line-delimited JSON over a byte stream.
//!
//! The hosting application spawns the server process and talks to it over
//! stdin/stdout, one JSON object per line:
//! ```text
//! host → server   {"type":"status"}  {"type":"ping"}  {"type":"stop"}
//!                 {"type":"stats"}   {"type":"backup","path":"/opt/bk"}
//! server → host   {"type":"status","status":"running","port":8080}
//!                 {"type":"stats","sessions":2,"elements":14,...}
//!                 {"type":"backup","path":".../workspace-2024-..."}
//! ```
//! End of input means the host is gone and is treated like `stop`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::engine::{EngineHandle, EngineStats};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlCommand {
    Start,
    Stop,
    Status,
    Ping,
    Stats,
    Backup {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlReply {
    Status {
        status: ServerStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Stats(EngineStats),
    Backup {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ControlReply {
    pub fn status(status: ServerStatus, port: Option<u16>) -> Self {
        Self::Status {
            status,
            port,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Status {
            status: ServerStatus::Error,
            port: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode control reply: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlExit {
    StopRequested,
    InputClosed,
}

/// Writes one JSON reply per line and flushes after each.
pub struct ControlWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, reply: &ControlReply) -> Result<(), ControlError> {
        let mut line = serde_json::to_vec(reply)?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Answer host commands until `stop` or end of input.
pub async fn serve<R, W>(
    input: R,
    writer: &mut ControlWriter<W>,
    engine: &EngineHandle,
    port: u16,
) -> Result<ControlExit, ControlError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command = match serde_json::from_str::<ControlCommand>(line) {
            Ok(command) => command,
            Err(e) => {
                log::warn!("ignoring control message {line:?}: {e}");
                continue;
            }
        };
        log::info!("control command: {command:?}");

        let reply = match command {
            ControlCommand::Stop => return Ok(ControlExit::StopRequested),
            // Already started by the time commands are read
            ControlCommand::Start | ControlCommand::Ping | ControlCommand::Status => {
                let status = if engine.is_running() {
                    ServerStatus::Running
                } else {
                    ServerStatus::Stopped
                };
                ControlReply::status(status, Some(port))
            }
            ControlCommand::Stats => match engine.stats().await {
                Ok(stats) => ControlReply::Stats(stats),
                Err(e) => ControlReply::error(e.to_string()),
            },
            ControlCommand::Backup { path } => match engine.backup(path).await {
                Ok(path) => ControlReply::Backup {
                    path: Some(path),
                    error: None,
                },
                Err(e) => ControlReply::Backup {
                    path: None,
                    error: Some(e.to_string()),
                },
            },
        };
        writer.send(&reply).await?;
    }

    log::info!("control input closed");
    Ok(ControlExit::InputClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, SyncEngine};

    fn replies(out: Vec<u8>) -> Vec<serde_json::Value> {
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_parse_commands() {
        let cmd: ControlCommand = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Ping);
        let cmd: ControlCommand = serde_json::from_str(r#"{"type":"backup"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Backup { path: None });
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"type":"backup","path":"/tmp/x"}"#).unwrap();
        assert_eq!(
            cmd,
            ControlCommand::Backup {
                path: Some(PathBuf::from("/tmp/x"))
            }
        );
    }

    #[test]
    fn test_status_reply_shape() {
        let json = serde_json::to_value(ControlReply::status(ServerStatus::Running, Some(8080))).unwrap();
        assert_eq!(json, serde_json::json!({"type": "status", "status": "running", "port": 8080}));

        let json = serde_json::to_value(ControlReply::error("Port 8080 is already in use")).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "Port 8080 is already in use");
        assert!(json.get("port").is_none());
    }

    #[tokio::test]
    async fn test_serve_answers_until_stop() {
        let (engine, _task) = SyncEngine::in_memory().spawn(EngineConfig::default());
        let input: &[u8] = b"{\"type\":\"ping\"}\nnot json\n\n{\"type\":\"stats\"}\n{\"type\":\"stop\"}\n{\"type\":\"ping\"}\n";
        let mut writer = ControlWriter::new(Vec::new());

        let exit = serve(input, &mut writer, &engine, 9000).await.unwrap();
        assert_eq!(exit, ControlExit::StopRequested);

        let out = replies(writer.into_inner());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["status"], "running");
        assert_eq!(out[0]["port"], 9000);
        assert_eq!(out[1]["type"], "stats");
        assert_eq!(out[1]["sessions"], 0);
    }

    #[tokio::test]
    async fn test_end_of_input_means_shutdown() {
        let (engine, _task) = SyncEngine::in_memory().spawn(EngineConfig::default());
        let mut writer = ControlWriter::new(Vec::new());
        let exit = serve(&b"{\"type\":\"status\"}\n"[..], &mut writer, &engine, 1).await.unwrap();
        assert_eq!(exit, ControlExit::InputClosed);
    }

    #[tokio::test]
    async fn test_backup_without_storage_reports_error() {
        let (engine, _task) = SyncEngine::in_memory().spawn(EngineConfig::default());
        let mut writer = ControlWriter::new(Vec::new());
        serve(&b"{\"type\":\"backup\"}\n"[..], &mut writer, &engine, 1).await.unwrap();

        let out = replies(writer.into_inner());
        assert_eq!(out[0]["type"], "backup");
        assert_eq!(out[0]["error"], "persistence is disabled");
    }
}
