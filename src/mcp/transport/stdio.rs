//! stdio 传输：子进程 stdin/stdout 行分隔 JSON-RPC
//!
//! 子进程环境清空后只保留安全白名单与配置的变量；stderr 转发到 tracing。

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::RpcChannel;
use crate::mcp::error::McpError;
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::mcp::types::{ServerConnectionConfig, TransportKind};

/// 单行响应上限
const MAX_RESPONSE_BYTES: usize = 512 * 1024;

/// 允许传给子进程的环境变量
const SAFE_ENV_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "SHELL",
    "TMPDIR",
    "TMP",
    "TEMP",
    "XDG_RUNTIME_DIR",
    "XDG_CONFIG_HOME",
    "XDG_CACHE_HOME",
    "NODE_PATH",
    "NPM_CONFIG_PREFIX",
    "NVM_DIR",
];

pub struct StdioChannel {
    server: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl StdioChannel {
    async fn write_line(&mut self, message: &JsonRpcRequest) -> Result<(), McpError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl RpcChannel for StdioChannel {
    async fn open(config: &ServerConnectionConfig) -> Result<Self, McpError> {
        let TransportKind::Stdio { command, args } = &config.transport else {
            return Err(McpError::Connection("stdio channel needs a stdio transport".to_string()));
        };

        let safe_env: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| SAFE_ENV_KEYS.contains(&k.as_str()))
            .collect();

        let mut child = Command::new(command)
            .args(args)
            .env_clear()
            .envs(safe_env)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Connection(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Connection("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Connection("failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = config.server_name.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let trimmed = line.trim_end();
                            if !trimmed.is_empty() {
                                tracing::warn!(server = %server, "{}", trimmed);
                            }
                        }
                    }
                }
            });
        }

        Ok(Self {
            server: config.server_name.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn request(&mut self, id: u64, method: &str, params: Value) -> Result<Value, McpError> {
        self.write_line(&JsonRpcRequest::request(id, method, params)).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = self.stdout.read_line(&mut line).await?;
            if read == 0 {
                return Err(McpError::Connection(format!("{} closed stdout", self.server)));
            }
            if line.len() > MAX_RESPONSE_BYTES {
                return Err(McpError::Protocol(format!(
                    "response exceeded {} bytes",
                    MAX_RESPONSE_BYTES
                )));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.answers(id) => return resp.into_result(),
                Ok(resp) => {
                    tracing::debug!(server = %self.server, method = ?resp.method, "Skipping non-matching MCP message");
                }
                Err(_) => {
                    tracing::debug!(server = %self.server, "Skipping non-JSON stdout line");
                }
            }
        }
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<(), McpError> {
        self.write_line(&JsonRpcRequest::notification(method, params)).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(server = %self.server, "Failed to kill MCP subprocess: {}", e);
        }
    }
}
