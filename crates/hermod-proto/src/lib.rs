// hermod-proto: Wire-level types shared by every node.
//
// Two layers live here:
// - the transport frame (1-byte opcode, 4-byte big-endian length, payload)
//   carried on inter-service TCP links and mirrored onto WebSocket frames;
// - the logic packet envelope (magic / flags / version / protobuf header /
//   body) carried as the payload of Binary frames between gateway and logic
//   nodes.

pub mod frame;
pub mod messages;
pub mod packet;

pub use frame::{read_frame, write_frame, Frame, OpCode, WireError};
pub use packet::{Flag, Header, Packet, Status};

/// Command namespace. The prefix before the first `.` names the logic
/// service responsible for the command.
pub mod command {
    pub const LOGIN_SIGN_IN: &str = "login.signin";
    pub const LOGIN_SIGN_OUT: &str = "login.signout";
    /// Pushed to a channel that just lost its session to a newer login.
    pub const LOGIN_KICK_OUT: &str = "login.kickout";
    pub const CHAT_TALK: &str = "chat.talk";
}

/// Well-known service names.
pub mod service {
    pub const GATEWAY: &str = "gateway";
    pub const LOGIN: &str = "login";
    pub const CHAT: &str = "chat";
}

/// Metadata keys reserved by the routing fabric.
pub mod metakey {
    /// Service id of the node the packet is destined for.
    pub const DEST_SERVER: &str = "dest_server";
    /// Comma-separated channel ids the payload fans out to.
    pub const DEST_CHANNELS: &str = "dest_channels";
}
