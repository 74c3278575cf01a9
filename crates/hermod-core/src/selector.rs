//! Picks the logic peer responsible for a routing header.

use hermod_proto::Header;

use crate::naming::ServiceDescriptor;

pub trait Selector: Send + Sync {
    /// Pick one of `services` for the packet described by `header`. Returns
    /// `None` when the set is empty.
    fn lookup(&self, header: &Header, services: &[ServiceDescriptor]) -> Option<String>;
}

/// CRC32 (IEEE) of the channel id over the sorted id set. For a fixed member
/// set this pins every channel to one peer, which is what keeps per-session
/// ordering intact across the fan-in.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashSelector;

impl Selector for HashSelector {
    fn lookup(&self, header: &Header, services: &[ServiceDescriptor]) -> Option<String> {
        if services.is_empty() {
            return None;
        }
        let mut ids: Vec<&str> = services.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        let code = crc32fast::hash(header.channel_id.as_bytes()) as usize;
        Some(ids[code % ids.len()].to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors(ids: &[&str]) -> Vec<ServiceDescriptor> {
        ids.iter().map(|id| ServiceDescriptor::new(id, "chat")).collect()
    }

    fn header(channel_id: &str) -> Header {
        Header {
            channel_id: channel_id.to_owned(),
            ..Header::default()
        }
    }

    #[test]
    fn lookup_is_deterministic_and_order_independent() {
        let selector = HashSelector;
        let forward = descriptors(&["chat_1", "chat_2", "chat_3"]);
        let backward = descriptors(&["chat_3", "chat_1", "chat_2"]);

        for channel in ["c1", "c2", "user-42", ""] {
            let a = selector.lookup(&header(channel), &forward);
            let b = selector.lookup(&header(channel), &backward);
            assert_eq!(a, b, "channel {channel} routed differently after permutation");
            assert_eq!(a, selector.lookup(&header(channel), &forward));
        }
    }

    #[test]
    fn lookup_spreads_channels_across_members() {
        let selector = HashSelector;
        let services = descriptors(&["chat_1", "chat_2", "chat_3", "chat_4"]);
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            if let Some(s) = selector.lookup(&header(&format!("c{i}")), &services) {
                seen.insert(s);
            }
        }
        assert!(seen.len() > 1, "hash selector never spread the load");
    }

    #[test]
    fn empty_set_yields_none() {
        assert_eq!(HashSelector.lookup(&header("c1"), &[]), None);
    }
}
