//! Per-connection lifecycle: read pump, write pump, and teardown.
//!
//! One reader and one writer run per connection. The reader decodes inbound
//! frames and hands them to the dispatcher; the writer drains the outbound
//! queue and sends heartbeat pings. Either side stopping brings down the
//! other, and the connection is unregistered exactly once.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, close_code};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};

use talkie_core::{DispatchError, Envelope, Identity};

use super::connection::ClientConnection;
use super::dispatcher::EventDispatcher;
use super::heartbeat::ReadDeadline;
use super::registry::Registry;
use crate::config::HubConfig;
use crate::metrics::{
    EVENTS_DROPPED_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};

/// Extra time granted to the writer, beyond one write deadline, to flush its
/// close frame during teardown.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Shared state every connection pump needs.
pub struct PumpContext {
    /// Process-wide connection registry.
    pub registry: Arc<Registry>,
    /// Routes decoded inbound envelopes.
    pub dispatcher: Arc<EventDispatcher>,
    /// Queue and heartbeat tuning.
    pub config: HubConfig,
}

/// Why the read side of a connection stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadEnd {
    /// The peer sent a close frame or the stream ended.
    PeerClosed,
    /// No pong arrived within the read deadline.
    Timeout,
    /// An inbound frame exceeded the size limit.
    Oversized,
    /// The transport returned an error.
    Failed,
    /// The write side stopped first.
    WriterStopped,
}

impl ReadEnd {
    /// Metric and log label.
    pub fn label(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::Timeout => "timeout",
            Self::Oversized => "oversized",
            Self::Failed => "read_error",
            Self::WriterStopped => "writer_stopped",
        }
    }

    /// Close frame the writer sends on the way out.
    fn close_frame(self) -> Option<CloseFrame> {
        match self {
            Self::Oversized => Some(CloseFrame {
                code: close_code::SIZE,
                reason: "frame too large".into(),
            }),
            Self::PeerClosed => Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            }),
            Self::Timeout | Self::Failed | Self::WriterStopped => None,
        }
    }
}

/// Drive one authenticated connection until either side ends.
///
/// `writer` and `reader` are the two halves of the socket. The connection is
/// registered before any frame is read and unregistered before returning.
#[instrument(skip_all, fields(user_id = %identity.user_id, conn_id = tracing::field::Empty))]
pub async fn run_connection<W, R, E>(writer: W, mut reader: R, identity: Identity, ctx: Arc<PumpContext>)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let (conn, queue) = ClientConnection::new(identity, ctx.config.queue_capacity);
    let _ = Span::current().record("conn_id", tracing::field::display(&conn.id));

    if let Err(e) = ctx.registry.connect(Arc::clone(&conn)).await {
        warn!(error = %e, "registry unavailable, dropping connection");
        let _ = conn.close_queue();
        conn.mark_closed();
        return;
    }

    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(display_name = %conn.display_name, "client connected");

    let stop = CancellationToken::new();
    let (close_tx, close_rx) = oneshot::channel();
    let mut writer_task = tokio::spawn(write_pump(
        writer,
        queue,
        close_rx,
        ctx.config.clone(),
        stop.clone(),
    ));

    let end = read_pump(&mut reader, &conn, &ctx, &stop).await;
    conn.begin_closing();
    let _ = close_tx.send(end.close_frame());

    // Unregistering closes the queue, which tells the writer to flush and exit.
    if let Err(e) = ctx.registry.disconnect(&conn).await {
        debug!(error = %e, "registry stopped before disconnect");
        let _ = conn.close_queue();
    }
    if timeout(ctx.config.write_wait + WRITER_GRACE, &mut writer_task)
        .await
        .is_err()
    {
        warn!("writer did not stop in time, aborting");
        writer_task.abort();
    }
    conn.mark_closed();

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => end.label()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
    info!(
        reason = end.label(),
        dropped_frames = conn.dropped_frames(),
        "client disconnected"
    );
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("write failed: {0}")]
    Sink(String),
}

async fn write_frame<W>(writer: &mut W, message: Message, wait: Duration) -> Result<(), WriteError>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match timeout(wait, writer.send(message)).await {
        Err(_) => Err(WriteError::Timeout(wait)),
        Ok(Err(e)) => Err(WriteError::Sink(e.to_string())),
        Ok(Ok(())) => Ok(()),
    }
}

/// Join the frame just received with everything already queued behind it.
fn coalesce(first: &str, queue: &mut mpsc::Receiver<Arc<str>>) -> String {
    let mut text = String::from(first);
    while let Ok(next) = queue.try_recv() {
        text.push('\n');
        text.push_str(&next);
    }
    text
}

/// Sole writer to the socket. Exits on queue close (after sending a close
/// frame), on write failure, or on write timeout; always cancels `stop`.
async fn write_pump<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<Arc<str>>,
    mut close: oneshot::Receiver<Option<CloseFrame>>,
    config: HubConfig,
    stop: CancellationToken,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ping = interval_at(Instant::now() + config.ping_period, config.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            queued = queue.recv() => {
                let Some(frame) = queued else {
                    let reason = close.try_recv().ok().flatten();
                    if let Err(e) = write_frame(&mut writer, Message::Close(reason), config.write_wait).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    break;
                };
                let text = if config.coalesce_writes {
                    coalesce(&frame, &mut queue)
                } else {
                    frame.to_string()
                };
                if let Err(e) = write_frame(&mut writer, Message::Text(text.into()), config.write_wait).await {
                    debug!(error = %e, "outbound write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = write_frame(&mut writer, Message::Ping(Vec::new().into()), config.write_wait).await {
                    debug!(error = %e, "ping failed");
                    break;
                }
            }
        }
    }
    stop.cancel();
}

/// Sole reader of the socket. Returns why it stopped.
async fn read_pump<R, E>(
    reader: &mut R,
    conn: &ClientConnection,
    ctx: &PumpContext,
    stop: &CancellationToken,
) -> ReadEnd
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = ReadDeadline::new(ctx.config.pong_wait);
    loop {
        let next = tokio::select! {
            () = stop.cancelled() => return ReadEnd::WriterStopped,
            next = timeout_at(deadline.at(), reader.next()) => next,
        };
        let message = match next {
            Err(_) => return ReadEnd::Timeout,
            Ok(None) => return ReadEnd::PeerClosed,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read failed");
                return ReadEnd::Failed;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if text.as_str().len() > ctx.config.max_frame_bytes {
                    warn!(len = text.as_str().len(), "inbound frame too large");
                    return ReadEnd::Oversized;
                }
                handle_frame(text.as_str(), conn, ctx).await;
            }
            Message::Binary(data) => {
                if data.len() > ctx.config.max_frame_bytes {
                    warn!(len = data.len(), "inbound frame too large");
                    return ReadEnd::Oversized;
                }
                match std::str::from_utf8(&data) {
                    Ok(text) => handle_frame(text, conn, ctx).await,
                    Err(_) => {
                        counter!(EVENTS_DROPPED_TOTAL, "reason" => "decode").increment(1);
                        debug!(len = data.len(), "non-utf8 binary frame skipped");
                    }
                }
            }
            Message::Pong(_) => deadline.refresh(),
            Message::Ping(_) => {}
            Message::Close(frame) => {
                debug!(code = frame.as_ref().map(|f| f.code), "peer sent close");
                return ReadEnd::PeerClosed;
            }
        }
    }
}

/// Decode and dispatch one inbound frame. Failures never end the connection.
async fn handle_frame(text: &str, conn: &ClientConnection, ctx: &PumpContext) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            counter!(EVENTS_DROPPED_TOTAL, "reason" => "decode").increment(1);
            debug!(error = %e, "malformed frame skipped");
            return;
        }
    };
    if let Err(e) = ctx.dispatcher.dispatch(conn, envelope).await {
        counter!(EVENTS_DROPPED_TOTAL, "reason" => e.reason()).increment(1);
        match e {
            DispatchError::Persistence(_) | DispatchError::ReadTracking(_) => {
                warn!(error = %e, "event dropped");
            }
            _ => debug!(error = %e, "event dropped"),
        }
    }
}
