//! Peer address resolution.
//!
//! Specs may name other nodes as peers. Before any backend sets up a node the
//! manager builds an [`AddressBook`] from the specs being set up plus the
//! nodes already registered, and rewrites every symbolic peer to an address.

use std::collections::HashMap;

use crate::error::{HarnessError, Result};
use crate::node::{Address, NodeName, Peer};

/// Peer addresses by node name.
#[derive(Debug, Default, Clone)]
pub struct AddressBook {
    addresses: HashMap<NodeName, Address>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the predicted address of a node that is about to be set up.
    pub fn add_pending(&mut self, name: NodeName, address: Address) {
        self.addresses.entry(name).or_insert(address);
    }

    /// Record the address of a node that is already registered.
    ///
    /// Registered nodes win over pending specs with the same name.
    pub fn add_registered(&mut self, name: NodeName, address: Address) {
        self.addresses.insert(name, address);
    }

    pub fn get(&self, name: &NodeName) -> Option<&Address> {
        self.addresses.get(name)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Resolve the peers of `node` into concrete addresses, in order.
    pub fn resolve(&self, node: &NodeName, peers: &[Peer]) -> Result<Vec<Address>> {
        peers
            .iter()
            .map(|peer| match peer {
                Peer::Literal { address } => Ok(address.clone()),
                Peer::Node(name) => {
                    self.get(name)
                        .cloned()
                        .ok_or_else(|| HarnessError::PeerNotFound {
                            node: node.clone(),
                            peer: name.clone(),
                        })
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_mixed_peers() {
        let mut book = AddressBook::new();
        book.add_pending("node1".into(), "addr1".into());

        let peers = vec![Peer::node("node1"), Peer::literal("literal-addr")];
        let resolved = book.resolve(&"node2".into(), &peers).unwrap();

        assert_eq!(resolved, vec![Address::new("addr1"), Address::new("literal-addr")]);
    }

    #[test]
    fn test_registered_wins_over_pending() {
        let mut book = AddressBook::new();
        book.add_pending("node1".into(), "new-addr".into());
        book.add_registered("node1".into(), "old-addr".into());
        book.add_pending("node1".into(), "newer-addr".into());

        assert_eq!(book.get(&"node1".into()), Some(&Address::new("old-addr")));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_unknown_peer() {
        let book = AddressBook::new();
        let err = book
            .resolve(&"node2".into(), &[Peer::node("ghost")])
            .unwrap_err();

        match err {
            HarnessError::PeerNotFound { node, peer } => {
                assert_eq!(node.as_str(), "node2");
                assert_eq!(peer.as_str(), "ghost");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_peers() {
        let book = AddressBook::new();
        assert!(book.is_empty());
        assert!(book.resolve(&"solo".into(), &[]).unwrap().is_empty());
    }
}
