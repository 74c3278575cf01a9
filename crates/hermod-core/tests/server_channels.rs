// End-to-end exercises of the server/channel stack over both transports:
// handshake, echo, duplicate-id rejection, push ordering, heartbeat
// liveness and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use hermod_core::{
    Acceptor, Agent, Client, ClientError, ClientOptions, DialContext, Dialer, FramedConn,
    MessageListener, Protocol, Server, ServiceDescriptor, StateListener,
};
use hermod_proto::OpCode;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Accepts the first frame's payload as the channel id and echoes every
/// message back with a ` from server` suffix.
struct EchoHandler {
    disconnects: std::sync::Mutex<Vec<String>>,
}

impl EchoHandler {
    fn new() -> Arc<Self> {
        Arc::new(EchoHandler { disconnects: std::sync::Mutex::new(Vec::new()) })
    }

    async fn wait_for_disconnect(&self) -> Vec<String> {
        for _ in 0..200 {
            let seen = self.disconnects.lock().unwrap().clone();
            if !seen.is_empty() {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no disconnect observed");
    }
}

#[async_trait]
impl Acceptor for EchoHandler {
    async fn accept(
        &self,
        conn: &mut FramedConn,
        login_wait: Duration,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let frame = timeout(login_wait, conn.read_frame()).await??;
        let user_id = String::from_utf8(frame.payload)?;
        if user_id.is_empty() {
            return Err("user id is invalid".into());
        }
        Ok(user_id)
    }
}

#[async_trait]
impl MessageListener for EchoHandler {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Vec<u8>) {
        let mut ack = payload;
        ack.extend_from_slice(b" from server");
        let _ = agent.push(ack).await;
    }
}

#[async_trait]
impl StateListener for EchoHandler {
    async fn disconnect(&self, channel_id: &str) {
        self.disconnects.lock().unwrap().push(channel_id.to_owned());
    }
}

/// Client-side dialer for the WebSocket edge: upgrade, then send the user
/// id as the handshake frame.
struct WsUserDialer {
    user_id: String,
}

#[async_trait]
impl Dialer for WsUserDialer {
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

/// Same handshake over the raw length-prefixed TCP stream.
struct TcpUserDialer {
    user_id: String,
}

#[async_trait]
impl Dialer for TcpUserDialer {
    async fn dial_and_handshake(&self, ctx: DialContext) -> Result<FramedConn, ClientError> {
        let stream = tokio::net::TcpStream::connect(&ctx.address)
            .await
            .map_err(|e| ClientError::Dial(ctx.address.clone(), e.to_string()))?;
        let mut conn = FramedConn::stream(stream);
        conn.write_frame(OpCode::Binary, self.user_id.as_bytes()).await?;
        conn.flush().await?;
        Ok(conn)
    }
}

async fn start_server(protocol: Protocol, handler: Arc<EchoHandler>) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(
        "127.0.0.1:0",
        protocol,
        ServiceDescriptor::new("srv_1", "demo"),
    ));
    server.set_acceptor(handler.clone());
    server.set_message_listener(handler.clone());
    server.set_state_listener(handler);

    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.start().await;
    });

    let addr = wait_for_addr(&server).await;
    (server, addr)
}

async fn wait_for_addr(server: &Arc<Server>) -> SocketAddr {
    for _ in 0..100 {
        if let Some(addr) = server.local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never bound");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ws_client_round_trip_echoes_every_message() {
    let handler = EchoHandler::new();
    let (_server, addr) = start_server(Protocol::Ws, handler).await;

    let client = Arc::new(Client::new("test1", "client", ClientOptions::default()));
    client.set_dialer(Arc::new(WsUserDialer { user_id: "test1".to_owned() }));
    client.connect(&format!("ws://{addr}")).await.unwrap();

    for _ in 0..5 {
        client.send(b"hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut received = 0;
    while received < 5 {
        let frame = timeout(Duration::from_secs(5), client.read()).await.unwrap().unwrap();
        if frame.opcode != OpCode::Binary {
            continue;
        }
        assert_eq!(frame.payload, b"hello from server");
        received += 1;
    }
    client.close().await;
}

#[tokio::test]
async fn duplicate_channel_id_is_rejected_with_reason() {
    let handler = EchoHandler::new();
    let (server, addr) = start_server(Protocol::Ws, handler).await;

    let first = Arc::new(Client::new("test1", "client", ClientOptions::default()));
    first.set_dialer(Arc::new(WsUserDialer { user_id: "test1".to_owned() }));
    first.connect(&format!("ws://{addr}")).await.unwrap();

    // Wait until the first channel is registered before racing the second.
    for _ in 0..100 {
        if server.channels().get("test1").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    let mut second = FramedConn::ws(stream);
    second.write_frame(OpCode::Binary, b"test1").await.unwrap();
    second.flush().await.unwrap();

    let frame = timeout(Duration::from_secs(5), second.read_frame())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.opcode, OpCode::Close);
    assert_eq!(frame.payload, b"channelId is repeated");

    // The first channel stayed registered.
    assert!(server.channels().get("test1").is_some());
    first.close().await;
}

#[tokio::test]
async fn pushes_arrive_in_order_over_tcp() {
    let handler = EchoHandler::new();
    let (server, addr) = start_server(Protocol::Tcp, handler).await;

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut conn = FramedConn::stream(stream);
    conn.write_frame(OpCode::Binary, b"c1").await.unwrap();
    conn.flush().await.unwrap();

    for _ in 0..100 {
        if server.channels().get("c1").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for i in 0..20u32 {
        server.push("c1", format!("p{i}").into_bytes()).await.unwrap();
    }

    for i in 0..20u32 {
        let frame = timeout(Duration::from_secs(5), conn.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload, format!("p{i}").into_bytes());
    }
}

#[tokio::test]
async fn heartbeats_keep_an_idle_client_alive() {
    let handler = EchoHandler::new();
    let (server, addr) = start_server(Protocol::Tcp, handler.clone()).await;
    server.set_read_wait(Duration::from_millis(200));

    let client = Arc::new(Client::new("hb", "client", ClientOptions {
        heartbeat: Duration::from_millis(50),
        read_wait: Duration::from_secs(1),
        write_wait: Duration::from_secs(1),
    }));
    client.set_dialer(Arc::new(TcpUserDialer { user_id: "hb".to_owned() }));
    client.connect(&addr.to_string()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(handler.disconnects.lock().unwrap().is_empty());

    // Still functional after the idle stretch. Pong replies to our pings
    // may be queued ahead of the echo.
    client.send(b"ping-me").await.unwrap();
    loop {
        let frame = timeout(Duration::from_secs(5), client.read()).await.unwrap().unwrap();
        if frame.opcode == OpCode::Binary {
            assert_eq!(frame.payload, b"ping-me from server");
            break;
        }
    }
    client.close().await;
}

#[tokio::test]
async fn a_silent_client_is_reaped_after_the_read_wait() {
    let handler = EchoHandler::new();
    let (server, addr) = start_server(Protocol::Tcp, handler.clone()).await;
    server.set_read_wait(Duration::from_millis(150));

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut conn = FramedConn::stream(stream);
    conn.write_frame(OpCode::Binary, b"silent").await.unwrap();
    conn.flush().await.unwrap();

    let seen = handler.wait_for_disconnect().await;
    assert_eq!(seen, vec!["silent".to_owned()]);
}

#[tokio::test]
async fn shutdown_closes_every_channel_and_stops_accepting() {
    let handler = EchoHandler::new();
    let (server, addr) = start_server(Protocol::Tcp, handler).await;

    let mut conns = Vec::new();
    for i in 0..2 {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut conn = FramedConn::stream(stream);
        conn.write_frame(OpCode::Binary, format!("c{i}").as_bytes()).await.unwrap();
        conn.flush().await.unwrap();
        conns.push(conn);
    }
    for i in 0..2 {
        let id = format!("c{i}");
        for _ in 0..100 {
            if server.channels().get(&id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    server.shutdown(Duration::from_secs(10)).await.unwrap();

    for conn in &mut conns {
        let frame = timeout(Duration::from_secs(5), conn.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
    }

    assert!(matches!(
        server.push("c0", b"late".to_vec()).await,
        Err(hermod_core::ServerError::ChannelNotFound)
    ));

    // Idempotent.
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn empty_handshake_is_rejected_with_the_error_text() {
    let handler = EchoHandler::new();
    let (_server, addr) = start_server(Protocol::Tcp, handler).await;

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut conn = FramedConn::stream(stream);
    conn.write_frame(OpCode::Binary, b"").await.unwrap();
    conn.flush().await.unwrap();

    let frame = timeout(Duration::from_secs(5), conn.read_frame())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.opcode, OpCode::Close);
    assert_eq!(frame.payload, b"user id is invalid");
}
