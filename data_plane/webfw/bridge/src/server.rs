//! # Message Server
//!
//! JSON-lines listener exposing the message API to UI collaborators:
//! one request object per line in, one response object per line out.
//!
//! Besides the controller messages it accepts
//! `{"type": "evaluate", "url": ..., "resourceType": ...}`, which runs a
//! request through the local engine so matches flow into telemetry.

use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use rule_engine::{MessageHandler, ResourceType};

use crate::enforcement_engine::LocalEngine;

/// Longest request line accepted, newline excluded
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateRequest {
    url: String,
    #[serde(default)]
    resource_type: Option<ResourceType>,
}

/// Routes one line either to the engine or to the message handler
#[derive(Clone)]
pub struct MessageServer {
    handler: MessageHandler,
    engine: Arc<LocalEngine>,
}

impl MessageServer {
    pub fn new(handler: MessageHandler, engine: Arc<LocalEngine>) -> Self {
        Self { handler, engine }
    }

    pub async fn handle_line(&self, line: &str) -> String {
        let is_evaluate = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "evaluate"))
            .unwrap_or(false);
        if !is_evaluate {
            return self.handler.handle_json(line).await;
        }

        let reply = match serde_json::from_str::<EvaluateRequest>(line) {
            Ok(request) => match self.engine.evaluate(&request.url, request.resource_type) {
                Some(decided) => json!({"ok": true, "matched": true, "match": decided}),
                None => json!({"ok": true, "matched": false}),
            },
            Err(e) => json!({"ok": false, "error": format!("Malformed message: {}", e)}),
        };
        reply.to_string()
    }

    /// Accept connections forever, one task per connection.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!("Message server listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Connection from {}", peer);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!("Connection from {} closed with error: {}", peer, e);
                }
            });
        }
    }

    /// Answer lines until EOF; an oversized line gets an error reply and
    /// closes the connection.
    async fn handle_connection(&self, stream: TcpStream) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = (&mut reader)
                .take(MAX_LINE_BYTES as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await?;
            if read == 0 {
                return Ok(());
            }
            if buf.len() > MAX_LINE_BYTES && buf.last() != Some(&b'\n') {
                warn!("Dropping connection after a line over {} bytes", MAX_LINE_BYTES);
                let reply = json!({"ok": false, "error": format!("Message exceeds {} bytes", MAX_LINE_BYTES)});
                writer.write_all(format!("{}\n", reply).as_bytes()).await?;
                return Ok(());
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut reply = self.handle_line(line).await;
            reply.push('\n');
            writer.write_all(reply.as_bytes()).await?;
        }
    }
}

/// Bind `addr` and serve until the listener fails
pub async fn start_message_server(
    server: MessageServer,
    addr: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind {}: {}", addr, e);
        e
    })?;
    server.serve(listener).await?;
    Ok(())
}
