// hermod-naming: service-registry backends behind the core Naming contract.
//
// The memory backend runs inside one process and notifies watchers
// synchronously with registry changes; the consul backend speaks the Consul
// HTTP API with long-poll watches.

pub mod consul;
pub mod memory;

pub use consul::ConsulNaming;
pub use memory::MemoryNaming;
