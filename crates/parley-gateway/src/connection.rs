use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;
use crate::router::MessageRouter;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The bearer token was
/// validated at the HTTP upgrade layer, so the socket goes straight to Ready
/// and the event loop — no event handler exists before authentication.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    router: MessageRouter,
    db: Arc<Database>,
    user_id: Uuid,
    username: String,
) {
    let (mut sender, receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Register the connection's channel; commands and targeted pushes for this
    // user flow through it from here on.
    let (tx, mut user_rx) = mpsc::unbounded_channel();
    let conn_id = dispatcher.register(user_id, tx.clone()).await;

    // Presence bookkeeping in the store is best-effort: a failed write is
    // logged and the session carries on.
    {
        let db = db.clone();
        let uid = user_id.to_string();
        let result = tokio::task::spawn_blocking(move || db.set_user_online(&uid)).await;
        if let Ok(Err(e)) = result {
            warn!("Failed to mark {} online: {}", user_id, e);
        }
    }
    dispatcher.broadcast(GatewayEvent::PeerOnline {
        user_id,
        username: username.clone(),
    });

    let mut broadcast_rx = dispatcher.subscribe();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events to the client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client. Commands are handled one at a time, so a
    // single sender's messages are persisted in submission order.
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut receiver = receiver;
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&router, &tx, user_id, &username_recv, cmd).await;
                    }
                    Err(e) => {
                        let preview: String = text.chars().take(200).collect();
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv, user_id, e, preview
                        );
                        let _ = tx.send(GatewayEvent::OperationFailed {
                            message: "unrecognized command".into(),
                        });
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Only the connection that still owns the registry entry marks the user
    // offline; a stale teardown after a reconnect leaves presence alone.
    if dispatcher.unregister(user_id, conn_id).await {
        let last_seen = Utc::now();
        let db = db.clone();
        let uid = user_id.to_string();
        let stamp = last_seen.to_rfc3339();
        let result = tokio::task::spawn_blocking(move || db.set_user_offline(&uid, &stamp)).await;
        if let Ok(Err(e)) = result {
            warn!("Failed to mark {} offline: {}", user_id, e);
        }

        dispatcher.broadcast(GatewayEvent::PeerOffline {
            user_id,
            last_seen: Some(last_seen),
        });
    }

    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn handle_command(
    router: &MessageRouter,
    reply: &mpsc::UnboundedSender<GatewayEvent>,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Send {
            receiver_id,
            content,
        } => match router.send_message(user_id, username, receiver_id, &content).await {
            Ok(message) => {
                let _ = reply.send(GatewayEvent::MessageAccepted(message));
            }
            Err(e) => {
                warn!("{} ({}) send failed: {}", username, user_id, e);
                let _ = reply.send(GatewayEvent::OperationFailed {
                    message: e.user_message(),
                });
            }
        },

        GatewayCommand::Typing { receiver_id } => {
            router.notify_typing(user_id, username, receiver_id).await;
        }

        GatewayCommand::StopTyping { receiver_id } => {
            router.notify_stop_typing(user_id, receiver_id).await;
        }

        GatewayCommand::MarkRead { conversation_id } => {
            if let Err(e) = router.mark_conversation_read(conversation_id, user_id).await {
                warn!("{} ({}) mark-read failed: {}", username, user_id, e);
                let _ = reply.send(GatewayEvent::OperationFailed {
                    message: e.user_message(),
                });
            }
        }
    }
}
