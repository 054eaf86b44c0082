//! The per-connection reader task: framing, parsing, and dispatch.
//!
//! Exactly one reader exists per client. It owns the line buffer, parses each
//! complete line, and routes messages to pending waiters or the notification
//! queue. Malformed lines are counted and dropped without disturbing
//! correlation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::{
    lock_pending, parse_id, ClientHandle, Error, Notification, PendingRequests, ProtocolErrorKind,
    StatsInner, JSONRPC_METHOD_NOT_FOUND,
};

pub(crate) struct ReaderContext {
    pub(crate) pending: PendingRequests,
    pub(crate) stats: Arc<StatsInner>,
    pub(crate) notify_tx: mpsc::Sender<Notification>,
    pub(crate) responder: ClientHandle,
    pub(crate) max_message_bytes: usize,
}

pub(crate) fn spawn_reader_task<R>(reader: R, ctx: ReaderContext) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let ReaderContext {
            pending,
            stats,
            notify_tx,
            responder,
            max_message_bytes,
        } = ctx;

        let mut reader = tokio::io::BufReader::new(reader);
        loop {
            match read_line_limited(&mut reader, max_message_bytes).await {
                Ok(Some(line)) => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let value: Value = match serde_json::from_slice(&line) {
                        Ok(value) => value,
                        Err(err) => {
                            stats.invalid_json_lines.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                bytes = line.len(),
                                error = %err,
                                "discarding invalid json line"
                            );
                            continue;
                        }
                    };
                    dispatch(value, &pending, &stats, &notify_tx, &responder).await;
                }
                Ok(None) => {
                    responder.close("peer closed connection").await;
                    return;
                }
                Err(err) => {
                    let reason = format!("io error: {err}");
                    responder.close_with_error(reason, Error::Io(err)).await;
                    return;
                }
            }
        }
    })
}

async fn dispatch(
    value: Value,
    pending: &PendingRequests,
    stats: &Arc<StatsInner>,
    notify_tx: &mpsc::Sender<Notification>,
    responder: &ClientHandle,
) {
    // Batch arrays are unpacked element-wise; everything else is one message.
    let mut stack = vec![value];
    while let Some(value) = stack.pop() {
        let map = match value {
            Value::Object(map) => map,
            Value::Array(items) => {
                for item in items.into_iter().rev() {
                    stack.push(item);
                }
                continue;
            }
            _ => {
                tracing::warn!("discarding non-object json-rpc message");
                continue;
            }
        };

        let method = map
            .get("method")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let Some(method) = method else {
            // No method: treat as a response.
            resolve_response(map, pending, stats);
            continue;
        };

        if let Some(id_value) = map.get("id") {
            // Server-initiated request: the client hosts no handlers.
            let Some(id) = parse_id(id_value) else {
                tracing::warn!(method = %method, "discarding server request with invalid id");
                continue;
            };
            tracing::debug!(method = %method, "rejecting unsupported server-to-client request");
            let _ = responder
                .respond_error(
                    id,
                    JSONRPC_METHOD_NOT_FOUND,
                    format!("method not found: {method}"),
                )
                .await;
            continue;
        }

        // Server-initiated notification.
        let note = Notification {
            method,
            params: map.get("params").cloned(),
        };
        match notify_tx.try_send(note) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(note)) => {
                stats
                    .dropped_notifications_full
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(method = %note.method, "notification queue full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                stats
                    .dropped_notifications_closed
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn resolve_response(
    map: serde_json::Map<String, Value>,
    pending: &PendingRequests,
    stats: &Arc<StatsInner>,
) {
    let Some(id) = map.get("id").and_then(parse_id) else {
        tracing::warn!("discarding response without a valid id");
        return;
    };

    let tx = {
        let mut pending = lock_pending(pending);
        pending.remove(&id)
    };
    let Some(tx) = tx else {
        // Either never issued or already timed out; either way nobody waits.
        stats.stale_responses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(?id, "discarding response with no pending waiter");
        return;
    };

    if map.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
        let _ = tx.send(Err(Error::protocol(
            ProtocolErrorKind::InvalidMessage,
            "invalid response jsonrpc version",
        )));
        return;
    }

    match (map.get("error"), map.get("result")) {
        (Some(error), None) => {
            let _ = tx.send(Err(parse_rpc_error(error)));
        }
        (None, Some(result)) => {
            let _ = tx.send(Ok(result.clone()));
        }
        _ => {
            let _ = tx.send(Err(Error::protocol(
                ProtocolErrorKind::InvalidMessage,
                "invalid response: must include exactly one of result/error",
            )));
        }
    }
}

fn parse_rpc_error(error: &Value) -> Error {
    let Value::Object(error) = error else {
        return Error::protocol(ProtocolErrorKind::InvalidMessage, "invalid error response");
    };
    let (Some(code), Some(message)) = (
        error.get("code").and_then(|v| v.as_i64()),
        error.get("message").and_then(|v| v.as_str()),
    ) else {
        return Error::protocol(ProtocolErrorKind::InvalidMessage, "invalid error response");
    };
    Error::Rpc {
        code,
        message: message.to_string(),
        data: error.get("data").cloned(),
    }
}

async fn read_line_limited<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, std::io::Error> {
    use tokio::io::AsyncBufReadExt;

    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|b| *b == b'\n');
        let take = newline_pos
            .map(|idx| idx.saturating_add(1))
            .unwrap_or(available.len());
        if buf.len().saturating_add(take) > max_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "jsonrpc message too large",
            ));
        }
        buf.extend_from_slice(&available[..take]);
        reader.consume(take);

        if newline_pos.is_some() {
            break;
        }
    }

    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }

    Ok(Some(buf))
}
