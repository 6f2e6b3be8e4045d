// src/io/server.rs
//
// WebSocket accept loop. Every client gets its own relay task; a failing
// client never affects the others or the serial port.

use std::sync::Arc;

use tokio::net::TcpListener;

use super::relay::Relay;
use super::IoError;

/// Accept clients forever, spawning one relay per WebSocket connection.
/// Accept and handshake failures are logged and the loop carries on.
pub async fn serve(listener: TcpListener, relay: Arc<Relay>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tlog!("[server] {}", IoError::connection("listener", e.to_string()));
                continue;
            }
        };

        let relay = relay.clone();
        tokio::spawn(async move {
            let peer = addr.to_string();
            let ws = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    tlog!(
                        "[server] {}",
                        IoError::protocol(&peer, format!("WebSocket handshake failed: {}", e))
                    );
                    return;
                }
            };

            tlog!("[server] Client connected: {}", peer);
            let summary = relay.run(ws, &peer).await;
            tlog!(
                "[server] Client disconnected: {} ({}; {} bytes to client, {} bytes to device, {} readings)",
                peer,
                summary.exit,
                summary.bytes_to_socket,
                summary.bytes_to_serial,
                summary.readings
            );
        });
    }
}
