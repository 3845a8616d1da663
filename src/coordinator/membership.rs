//! Join-phase membership.

use crate::protocol::Identity;

/// One joined participant and whatever connection state the owner keeps.
#[derive(Debug)]
pub struct Member<C> {
    /// Declared listening identity from the JOIN line.
    pub identity: Identity,
    /// Transport-level source port of the joining connection.
    pub source_port: u16,
    pub conn: C,
}

/// Ordered set of joined participants.
///
/// Entries are keyed by source port: a second join arriving from the same
/// source port replaces the earlier entry in place.
#[derive(Debug)]
pub struct PeerSet<C> {
    members: Vec<Member<C>>,
}

impl<C> Default for PeerSet<C> {
    fn default() -> Self {
        Self {
            members: Vec::new(),
        }
    }
}

impl<C> PeerSet<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, or replace the one that joined from the same source port.
    ///
    /// Returns the replaced member, if any.
    pub fn add_or_replace(&mut self, member: Member<C>) -> Option<Member<C>> {
        match self
            .members
            .iter_mut()
            .find(|m| m.source_port == member.source_port)
        {
            Some(existing) => Some(std::mem::replace(existing, member)),
            None => {
                self.members.push(member);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Identities in join order.
    pub fn identities(&self) -> Vec<Identity> {
        self.members.iter().map(|m| m.identity).collect()
    }

    /// Every identity except the member at `index`, for its DETAILS line.
    pub fn others(&self, index: usize) -> Vec<Identity> {
        self.members
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, m)| m.identity)
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Member<C>> {
        self.members.iter_mut()
    }

    pub fn into_members(self) -> Vec<Member<C>> {
        self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(identity: Identity, source_port: u16) -> Member<()> {
        Member {
            identity,
            source_port,
            conn: (),
        }
    }

    #[test]
    fn test_rejoin_from_same_source_port_replaces() {
        let mut peers = PeerSet::new();
        assert!(peers.add_or_replace(member(6001, 5000)).is_none());
        assert_eq!(peers.len(), 1);

        let replaced = peers.add_or_replace(member(6002, 5000)).unwrap();
        assert_eq!(replaced.identity, 6001);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers.identities(), vec![6002]);
    }

    #[test]
    fn test_distinct_source_ports_accumulate_in_order() {
        let mut peers = PeerSet::new();
        peers.add_or_replace(member(6003, 5003));
        peers.add_or_replace(member(6001, 5001));
        peers.add_or_replace(member(6002, 5002));
        assert_eq!(peers.identities(), vec![6003, 6001, 6002]);
    }

    #[test]
    fn test_replacement_keeps_position() {
        let mut peers = PeerSet::new();
        peers.add_or_replace(member(6001, 5001));
        peers.add_or_replace(member(6002, 5002));
        peers.add_or_replace(member(6009, 5001));
        assert_eq!(peers.identities(), vec![6009, 6002]);
    }

    #[test]
    fn test_others_excludes_self() {
        let mut peers = PeerSet::new();
        peers.add_or_replace(member(6001, 5001));
        peers.add_or_replace(member(6002, 5002));
        peers.add_or_replace(member(6003, 5003));
        assert_eq!(peers.others(0), vec![6002, 6003]);
        assert_eq!(peers.others(1), vec![6001, 6003]);
        assert_eq!(peers.others(2), vec![6001, 6002]);
    }
}
