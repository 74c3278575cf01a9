//! Client demo: connect over ws or tcp, hand over the user id, send a
//! handful of messages and read the echoes back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use hermod_core::{Client, ClientError, ClientOptions, DialContext, Dialer, FramedConn, Protocol};
use hermod_proto::OpCode;

pub struct ClientDemo;

impl ClientDemo {
    /// Send `count` messages and wait for as many echoes.
    pub async fn start(
        user_id: &str,
        protocol: Protocol,
        addr: &str,
        count: usize,
    ) -> Result<(), ClientError> {
        let client = Arc::new(Client::new(user_id, "client", ClientOptions::default()));
        let dialer: Arc<dyn Dialer> = match protocol {
            Protocol::Ws => Arc::new(WebsocketDialer { user_id: user_id.to_owned() }),
            Protocol::Tcp => Arc::new(TcpUserDialer { user_id: user_id.to_owned() }),
        };
        client.set_dialer(dialer);
        client.connect(addr).await?;

        {
            let client = client.clone();
            tokio::spawn(async move {
                for _ in 0..count {
                    if let Err(e) = client.send(b"hello").await {
                        warn!(error = %e, "send failed");
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            });
        }

        let mut received = 0;
        while received < count {
            let frame = match client.read().await {
                Ok(frame) => frame,
                Err(e) => {
                    info!(error = %e, "read ended");
                    break;
                }
            };
            if frame.opcode != OpCode::Binary {
                continue;
            }
            received += 1;
            info!(
                user = user_id,
                message = %String::from_utf8_lossy(&frame.payload),
                "receive"
            );
        }

        client.close().await;
        Ok(())
    }
}

/// WebSocket edge handshake: upgrade, then one Binary frame with the user
/// id.
pub struct WebsocketDialer {
    pub user_id: String,
}

#[async_trait]
impl Dialer for WebsocketDialer {
    async fn dial_and_handshake(&self, ctx: DialContext) -> Result<FramedConn, ClientError> {
        let (stream, _) = tokio_tungstenite::connect_async(&ctx.address)
            .await
            .map_err(|e| ClientError::Dial(ctx.address.clone(), e.to_string()))?;
        let mut conn = FramedConn::ws(stream);
        conn.write_frame(OpCode::Binary, self.user_id.as_bytes()).await?;
        conn.flush().await?;
        Ok(conn)
    }
}

/// Same handshake over the raw length-prefixed stream.
pub struct TcpUserDialer {
    pub user_id: String,
}

#[async_trait]
impl Dialer for TcpUserDialer {
    async fn dial_and_handshake(&self, ctx: DialContext) -> Result<FramedConn, ClientError> {
        info!(address = %ctx.address, "start dial");
        let stream = tokio::net::TcpStream::connect(&ctx.address)
            .await
            .map_err(|e| ClientError::Dial(ctx.address.clone(), e.to_string()))?;
        let mut conn = FramedConn::stream(stream);
        conn.write_frame(OpCode::Binary, self.user_id.as_bytes()).await?;
        conn.flush().await?;
        Ok(conn)
    }
}
