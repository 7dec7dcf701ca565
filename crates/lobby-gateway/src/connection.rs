use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use lobby_types::close::Refusal;
use lobby_types::events::ServerEvent;

use crate::{FramePolicy, Gateway};
use crate::pipeline::{self, FrameOutcome};
use crate::session::{ChatTarget, Connecting, Outbound, Phase, SessionContext, establish};

/// How long a server-initiated close may take to flush before the send task
/// is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// `GET /ws/chat/{room_link}`
pub async fn room_chat_ws(
    State(gateway): State<Gateway>,
    Path(room_link): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let connecting = Connecting::new(ChatTarget::Room { link: room_link }, &headers);
    ws.on_upgrade(move |socket| run_session(socket, gateway, connecting))
}

/// `GET /ws/chat/d/{username}`
pub async fn direct_chat_ws(
    State(gateway): State<Gateway>,
    Path(username): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let connecting = Connecting::new(ChatTarget::Direct { username }, &headers);
    ws.on_upgrade(move |socket| run_session(socket, gateway, connecting))
}

/// Run one upgraded connection from handshake to teardown.
pub async fn run_session(mut socket: WebSocket, gateway: Gateway, connecting: Connecting) {
    let target = connecting.target().clone();

    let joined = match establish(&gateway, connecting).await {
        Ok(joined) => joined,
        Err(failure) => {
            info!("Refused {} while {}: {}", target, failure.phase, failure.refusal);
            let _ = socket.send(close_message(failure.refusal)).await;
            return;
        }
    };

    let (ctx, outbound, subscription) = joined.into_parts();
    let username = ctx.identity.username.clone();
    let session_id = ctx.session_id;

    let (sender, receiver) = socket.split();
    let (control_tx, control_rx) = oneshot::channel::<Refusal>();

    let pong_received = Arc::new(AtomicBool::new(true));

    let mut send_task = tokio::spawn(send_loop(
        sender,
        outbound,
        control_rx,
        gateway.config.heartbeat_interval,
        pong_received.clone(),
    ));
    let mut recv_task = tokio::spawn(recv_loop(receiver, gateway, ctx, pong_received));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        result = &mut recv_task => match result {
            Ok(Some(refusal)) => {
                // let the send task deliver the close frame, then stop it
                let _ = control_tx.send(refusal);
                if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
                    send_task.abort();
                }
            }
            _ => send_task.abort(),
        },
    }

    subscription.release();
    info!("{} disconnected from {} (session {}, {})", username, target, session_id, Phase::Closed);
}

async fn send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: Outbound,
    mut control: oneshot::Receiver<Refusal>,
    heartbeat_interval: Duration,
    pong_received: Arc<AtomicBool>,
) {
    // history goes out before anything live
    if let Some(history) = outbound.take_history() {
        if send_event(&mut sender, &history).await.is_err() {
            return;
        }
    }

    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            biased;

            refusal = &mut control => {
                if let Ok(refusal) = refusal {
                    let _ = sender.send(close_message(refusal)).await;
                }
                break;
            }
            event = outbound.next_live() => {
                let Some(event) = event else { break };
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Returns the refusal to close with, or `None` when the client went away.
async fn recv_loop(
    mut receiver: SplitStream<WebSocket>,
    gateway: Gateway,
    ctx: SessionContext,
    pong_received: Arc<AtomicBool>,
) -> Option<Refusal> {
    while let Some(Ok(msg)) = receiver.next().await {
        // any frame from the peer proves the connection is alive
        pong_received.store(true, Ordering::Release);
        match msg {
            Message::Text(text) => {
                let outcome = pipeline::handle_inbound(&gateway, &ctx, text.as_str()).await;
                // pongs queued behind a slow frame must not count as missed
                pong_received.store(true, Ordering::Release);
                if let FrameOutcome::Close(refusal) = outcome {
                    return Some(refusal);
                }
            }
            Message::Binary(data) => match ctx.mode.frame_policy(&gateway.config) {
                FramePolicy::Close => {
                    debug!(
                        "{} sent a {} byte binary frame, closing",
                        ctx.identity.username,
                        data.len()
                    );
                    return Some(Refusal::ProcessingError);
                }
                FramePolicy::Drop => {
                    debug!("{} sent a {} byte binary frame, dropped", ctx.identity.username, data.len());
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    None
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

fn close_message(refusal: Refusal) -> Message {
    Message::Close(Some(CloseFrame {
        code: refusal.code(),
        reason: Utf8Bytes::from_static(refusal.reason()),
    }))
}
