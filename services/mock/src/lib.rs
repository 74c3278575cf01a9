// mock: hand-driven client and echo server for poking at the fabric
// without a naming backend or logic nodes.

pub mod client;
pub mod server;

pub use client::ClientDemo;
pub use server::ServerDemo;
