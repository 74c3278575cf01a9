//! Protobuf body messages carried inside logic packets.
//!
//! The messages are hand-derived [`prost::Message`] structs; there is no
//! build-time code generation. Field tags are frozen; never renumber.

/// Inter-service handshake: written by the dialing side as the payload of a
/// single Binary frame right after the TCP connect. No reply is sent; the
/// peer identifies the connection by this id from then on.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InnerHandshakeReq {
    #[prost(string, tag = "1")]
    pub service_id: String,
}

/// A logged-in terminal. Keyed in session storage by account and by channel
/// id.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Session {
    #[prost(string, tag = "1")]
    pub channel_id: String,
    #[prost(string, tag = "2")]
    pub gate_id: String,
    #[prost(string, tag = "3")]
    pub account: String,
    #[prost(string, tag = "4")]
    pub device: String,
    #[prost(int64, tag = "5")]
    pub login_at: i64,
}

/// Where an account currently lives: the channel and the gateway that owns
/// it. Logic nodes use this to address responses.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Location {
    #[prost(string, tag = "1")]
    pub channel_id: String,
    #[prost(string, tag = "2")]
    pub gate_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoginReq {
    #[prost(string, tag = "1")]
    pub account: String,
    #[prost(string, tag = "2")]
    pub device: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoginResp {
    #[prost(string, tag = "1")]
    pub channel_id: String,
    #[prost(string, tag = "2")]
    pub account: String,
}

/// Pushed to the previous channel when an account signs in elsewhere.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KickoutNotify {
    #[prost(string, tag = "1")]
    pub channel_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LogoutReq {
    #[prost(string, tag = "1")]
    pub account: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorResp {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MessageReq {
    /// Destination account.
    #[prost(string, tag = "1")]
    pub dest: String,
    #[prost(string, tag = "2")]
    pub body: String,
    #[prost(string, tag = "3")]
    pub extra: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MessageResp {
    #[prost(int64, tag = "1")]
    pub message_id: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MessagePush {
    #[prost(int64, tag = "1")]
    pub message_id: i64,
    #[prost(string, tag = "2")]
    pub sender: String,
    #[prost(string, tag = "3")]
    pub body: String,
    #[prost(string, tag = "4")]
    pub extra: String,
}
