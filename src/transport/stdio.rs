//! Newline-delimited JSON over a byte stream
//!
//! One line in, one message. Output is written by a separate task so a slow
//! tool never blocks reading the next request.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::mcp::protocol::Outbound;
use crate::mcp::server::McpServer;
use crate::mcp::types::JsonRpcMessage;
use crate::utils::truncate;

/// Serve one session on the process's stdin and stdout
pub async fn serve_stdio(server: McpServer) -> Result<()> {
    info!(server = %server.id(), "MCP server running on stdio");
    serve(server, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve one session until `reader` reaches EOF
///
/// Requests read before EOF are answered before the session is closed.
pub async fn serve<R, W>(server: McpServer, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (session, outbound) = server.connect();
    let writer_task = tokio::spawn(write_loop(writer, outbound, session.protocol().closed_token()));

    let mut lines = BufReader::new(reader).lines();
    let read_result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match JsonRpcMessage::parse(line) {
            Ok(message) => session.receive(message).await,
            Err(error) => {
                warn!(line = %truncate(line, 200), error = %error.message, "unreadable message");
                if session.protocol().send_error(None, error).is_err() {
                    break Ok(());
                }
            }
        }
    };

    debug!(session = %session.id(), in_flight = session.protocol().in_flight_count(), "input closed");
    if !session.protocol().drain(server.config().request_timeout()).await {
        warn!(session = %session.id(), "requests still running at shutdown, dropping their responses");
    }
    server.disconnect(session.id());
    match writer_task.await {
        Ok(Err(e)) => warn!(error = %e, "failed writing output"),
        Err(e) => warn!(error = %e, "writer task panicked"),
        Ok(Ok(())) => {}
    }
    info!(session = %session.id(), "stdio session finished");
    read_result?;
    Ok(())
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    closed: CancellationToken,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            next = outbound.recv() => next,
            _ = closed.cancelled() => None,
        };
        let Some(out) = next else { break };
        write_message(&mut writer, &out.message).await?;
    }

    // flush whatever was queued before the session closed
    while let Ok(out) = outbound.try_recv() {
        write_message(&mut writer, &out.message).await?;
    }
    writer.flush().await
}

async fn write_message<W>(writer: &mut W, message: &JsonRpcMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
