// Login flow against the real router and the memory session store: the
// re-login kick-out (one success response to the new channel, one kick-out
// push to the old one) and sign-out eviction.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use hermod_core::{ContainerError, Dispatcher, MemoryStorage, SessionStorage};
use hermod_proto::messages::{ErrorResp, KickoutNotify, LoginReq, LoginResp, Session};
use hermod_proto::{command, Flag, Packet, Status};

struct RecordingDispatcher {
    pushes: Mutex<Vec<(String, Vec<String>, Packet)>>,
}

impl RecordingDispatcher {
    fn new() -> Arc<Self> {
        Arc::new(RecordingDispatcher { pushes: Mutex::new(Vec::new()) })
    }

    fn take(&self) -> Vec<(String, Vec<String>, Packet)> {
        std::mem::take(&mut self.pushes.lock().unwrap())
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn push(
        &self,
        gateway: &str,
        channels: &[String],
        packet: Packet,
    ) -> Result<(), ContainerError> {
        self.pushes
            .lock()
            .unwrap()
            .push((gateway.to_owned(), channels.to_vec(), packet));
        Ok(())
    }
}

fn session(account: &str, channel: &str, gateway: &str) -> Session {
    Session {
        channel_id: channel.to_owned(),
        gate_id: gateway.to_owned(),
        account: account.to_owned(),
        device: String::new(),
        login_at: 0,
    }
}

fn signin_packet(account: &str, channel: &str) -> Packet {
    let mut packet = Packet::new(command::LOGIN_SIGN_IN);
    packet.header.channel_id = channel.to_owned();
    packet.write_body(&LoginReq { account: account.to_owned(), device: String::new() });
    packet
}

#[tokio::test]
async fn relogin_kicks_the_previous_channel_out() {
    let router = Arc::new(server::build_router());
    let storage = Arc::new(MemoryStorage::new());
    let dispatcher = RecordingDispatcher::new();

    // acc1 is already logged in on ch2.
    storage.add(&session("acc1", "ch2", "gateway_1")).await.unwrap();

    router
        .serve(
            signin_packet("acc1", "ch1"),
            dispatcher.clone(),
            storage.clone(),
            session("acc1", "ch1", "gateway_1"),
        )
        .await
        .unwrap();

    let pushes = dispatcher.take();
    assert_eq!(pushes.len(), 2, "expected a kick-out push and a login response");

    let (kick_gateway, kick_channels, kick) = pushes
        .iter()
        .find(|(_, _, p)| p.flag == Flag::Push)
        .expect("kick-out push missing");
    assert_eq!(kick_gateway, "gateway_1");
    assert_eq!(kick_channels, &vec!["ch2".to_owned()]);
    let notify: KickoutNotify = kick.read_body().unwrap();
    assert_eq!(notify.channel_id, "ch2");

    let (resp_gateway, resp_channels, resp) = pushes
        .iter()
        .find(|(_, _, p)| p.flag == Flag::Response)
        .expect("login response missing");
    assert_eq!(resp_gateway, "gateway_1");
    assert_eq!(resp_channels, &vec!["ch1".to_owned()]);
    assert_eq!(resp.status(), Status::Success);
    let body: LoginResp = resp.read_body().unwrap();
    assert_eq!(body.channel_id, "ch1");
    assert_eq!(body.account, "acc1");

    // The store now holds the ch1 session.
    let stored = storage.get("ch1").await.unwrap().expect("new session stored");
    assert_eq!(stored.account, "acc1");
    let location = storage.get_location("acc1", "").await.unwrap().unwrap();
    assert_eq!(location.channel_id, "ch1");
}

#[tokio::test]
async fn first_login_gets_only_the_success_response() {
    let router = Arc::new(server::build_router());
    let storage = Arc::new(MemoryStorage::new());
    let dispatcher = RecordingDispatcher::new();

    router
        .serve(
            signin_packet("acc2", "ch9"),
            dispatcher.clone(),
            storage.clone(),
            session("acc2", "ch9", "gateway_1"),
        )
        .await
        .unwrap();

    let pushes = dispatcher.take();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].2.status(), Status::Success);
}

#[tokio::test]
async fn signout_deletes_the_session() {
    let router = Arc::new(server::build_router());
    let storage = Arc::new(MemoryStorage::new());
    let dispatcher = RecordingDispatcher::new();

    storage.add(&session("acc1", "ch1", "gateway_1")).await.unwrap();

    let mut packet = Packet::new(command::LOGIN_SIGN_OUT);
    packet.header.channel_id = "ch1".to_owned();
    router
        .serve(
            packet,
            dispatcher.clone(),
            storage.clone(),
            session("acc1", "ch1", "gateway_1"),
        )
        .await
        .unwrap();

    assert!(storage.get("ch1").await.unwrap().is_none());
    assert!(dispatcher.take().is_empty(), "signout answers nobody");
}

#[tokio::test]
async fn unknown_command_answers_not_implemented() {
    let router = Arc::new(server::build_router());
    let storage = Arc::new(MemoryStorage::new());
    let dispatcher = RecordingDispatcher::new();

    let mut packet = Packet::new("group.join");
    packet.header.channel_id = "ch1".to_owned();
    router
        .serve(
            packet,
            dispatcher.clone(),
            storage,
            session("acc1", "ch1", "gateway_1"),
        )
        .await
        .unwrap();

    let pushes = dispatcher.take();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].2.status(), Status::NotImplemented);
    let body: ErrorResp = pushes[0].2.read_body().unwrap();
    assert_eq!(body.message, "NotImplemented");
}
