use anyhow::Result;
use dashmap::DashSet;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use crate::server::{GeoChatServer, SessionConn};

/// 处理新连接 / Handle new connection
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    server: GeoChatServer,
) -> Result<()> {
    tracing::info!("📨 New connection from: {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session_id = Uuid::new_v4().to_string();

    let session_id_clone = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(&msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                tracing::error!("Failed to send message to {}: {}", session_id_clone, e);
                break;
            }
            if is_close {
                let _ = ws_sender.close().await;
                break;
            }
        }
    });

    let connection = SessionConn {
        session_id: session_id.clone(),
        user_id: None,
        device_id: None,
        addr: peer_addr,
        sender: tx,
        subscriptions: Arc::new(DashSet::new()),
        last_heartbeat: Arc::new(parking_lot::Mutex::new(Instant::now())),
    };
    server.connections.insert(session_id.clone(), connection);
    tracing::info!("✅ Session {} connected from {}", session_id, peer_addr);

    // 鉴权看门狗:期限内未鉴权的连接被关闭 / Auth watchdog: a connection
    // that has not authenticated within the deadline is closed
    {
        let watchdog_session = session_id.clone();
        let watchdog_server = server.clone();
        let deadline_ms = server.settings.server.auth_deadline_ms;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(deadline_ms)).await;
            let unauthed = watchdog_server
                .connections
                .get(&watchdog_session)
                .map_or(false, |c| c.user_id.is_none());
            if unauthed {
                let _ = watchdog_server.send_close(&watchdog_session).await;
                watchdog_server.connections.remove(&watchdog_session);
                tracing::warn!("disconnecting unauthenticated session={}", watchdog_session);
            }
        });
    }

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(message) => {
                if let Err(e) = server.handle_incoming_frame(message, &session_id).await {
                    tracing::error!("Error handling message from {}: {}", session_id, e);
                }
            }
            Err(e) => {
                tracing::error!("WebSocket error from {}: {}", session_id, e);
                break;
            }
        }
    }

    // 传输断开:解除索引并启动在线状态宽限期 / Transport loss: unwind
    // indexes and start the presence grace window
    server.drop_session(&session_id);
    send_task.abort();
    tracing::info!("👋 Session {} disconnected", session_id);
    Ok(())
}
