// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Mesh graph from gossip TLVs, shortest-path source routes, and relay
//! planning.
//!
//! Edges are directed `(announcer -> neighbor)` pairs stamped with the
//! announcement time; anything older than `GRAPH_TTL_MS` is purged. Routes
//! are breadth-first shortest paths over fresh edges.

use crate::core::protocol::packet::Packet;
use crate::core::types::{PeerId, GRAPH_TTL_MS};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// How to move a locally originated unicast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EgressPlan {
    /// Recipient is on one of our own links.
    Direct(PeerId),
    /// A multi-hop path exists; attach `route` and hand to `first_hop`.
    SourceRoute {
        /// First hop (one of our direct peers).
        first_hop: PeerId,
        /// Intermediates between us and the recipient, endpoints excluded.
        route: Vec<PeerId>,
    },
    /// No usable path; controlled flood.
    Flood,
}

/// How to relay a third-party packet onward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayPlan {
    /// Do not relay.
    None,
    /// Flood to all direct peers except `skip`.
    Flood {
        /// Peers that must not receive the copy (inbound peer, the
        /// sender, and the sender's own neighborhood).
        skip: BTreeSet<PeerId>,
    },
    /// Source-routed: hand to `hop`, the entry after ours in the route.
    /// The wire route is left untouched so the signature stays valid; the
    /// "pop" is positional.
    NextHop {
        /// The next intermediate or the recipient itself.
        hop: PeerId,
    },
}

/// Directed neighbor graph with edge freshness.
#[derive(Default)]
pub struct MeshGraph {
    edges: BTreeMap<(PeerId, PeerId), u64>,
}

impl MeshGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the neighbor list a peer gossiped.
    pub fn update_gossip(&mut self, announcer: PeerId, neighbors: &[PeerId], now_ms: u64) {
        for n in neighbors {
            if *n != announcer {
                self.edges.insert((announcer, *n), now_ms);
            }
        }
    }

    /// Forget one peer entirely (LEAVE or prune).
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.edges.retain(|(a, b), _| a != peer && b != peer);
    }

    /// Purge edges older than `GRAPH_TTL_MS`. Returns how many were dropped.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.edges.len();
        self.edges
            .retain(|_, ts| now_ms.saturating_sub(*ts) < GRAPH_TTL_MS);
        before - self.edges.len()
    }

    /// Number of fresh edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Drop every edge (panic reset).
    pub fn clear(&mut self) {
        self.edges.clear();
    }

    /// Neighbors a peer has announced (fresh edges only).
    pub fn neighbors_of(&self, peer: &PeerId, now_ms: u64) -> BTreeSet<PeerId> {
        self.edges
            .range((*peer, PeerId::from_bytes([0; 8]))..=(*peer, PeerId::from_bytes([0xFF; 8])))
            .filter(|(_, ts)| now_ms.saturating_sub(**ts) < GRAPH_TTL_MS)
            .map(|((_, b), _)| *b)
            .collect()
    }

    /// Breadth-first shortest path `from -> ... -> to` over fresh edges,
    /// seeded with our own direct links. Returns the full path including
    /// both endpoints.
    pub fn find_route(
        &self,
        from: PeerId,
        to: PeerId,
        direct: &[PeerId],
        now_ms: u64,
    ) -> Option<Vec<PeerId>> {
        if from == to {
            return None;
        }

        let mut adjacency: HashMap<PeerId, BTreeSet<PeerId>> = HashMap::new();
        for ((a, b), ts) in &self.edges {
            if now_ms.saturating_sub(*ts) < GRAPH_TTL_MS {
                adjacency.entry(*a).or_default().insert(*b);
            }
        }
        adjacency
            .entry(from)
            .or_default()
            .extend(direct.iter().copied());

        let mut prev: HashMap<PeerId, PeerId> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(cur) = queue.pop_front() {
            if cur == to {
                let mut path = vec![to];
                let mut at = to;
                while let Some(p) = prev.get(&at) {
                    path.push(*p);
                    at = *p;
                }
                path.reverse();
                return Some(path);
            }
            if let Some(next) = adjacency.get(&cur) {
                for n in next {
                    if *n != from && !prev.contains_key(n) {
                        prev.insert(*n, cur);
                        queue.push_back(*n);
                    }
                }
            }
        }
        None
    }

    /// Plan transport for a locally originated unicast to `recipient`.
    pub fn plan_egress(
        &self,
        local: PeerId,
        recipient: PeerId,
        direct: &[PeerId],
        now_ms: u64,
    ) -> EgressPlan {
        if direct.contains(&recipient) {
            return EgressPlan::Direct(recipient);
        }
        match self.find_route(local, recipient, direct, now_ms) {
            // A path of length >= 3 has at least one intermediate worth
            // pinning down; shorter paths degenerate to a direct send.
            Some(path) if path.len() >= 3 => EgressPlan::SourceRoute {
                first_hop: path[1],
                route: path[1..path.len() - 1].to_vec(),
            },
            _ => EgressPlan::Flood,
        }
    }

    /// Plan the relay of a third-party packet. The caller has already
    /// enforced TTL, signature, and dedup invariants.
    pub fn plan_relay(
        &self,
        packet: &Packet,
        inbound_peer: Option<PeerId>,
        local: PeerId,
        now_ms: u64,
    ) -> RelayPlan {
        if packet.is_broadcast() {
            let mut skip = BTreeSet::new();
            skip.insert(packet.sender_id);
            if let Some(p) = inbound_peer {
                skip.insert(p);
            }
            return RelayPlan::Flood { skip };
        }

        let recipient = match packet.recipient_id {
            Some(r) => r,
            None => return RelayPlan::None,
        };
        if recipient == local {
            return RelayPlan::None;
        }

        if let Some(route) = &packet.route {
            // Routed packets travel only along the listed hops; we forward
            // exactly when we are the next listed intermediate.
            return match route.iter().position(|p| *p == local) {
                Some(idx) => {
                    let hop = route.get(idx + 1).copied().unwrap_or(recipient);
                    RelayPlan::NextHop { hop }
                }
                None => RelayPlan::None,
            };
        }

        // Unrouted unicast: controlled flood, skipping the inbound peer,
        // the sender, and everyone the sender already reaches directly.
        let mut skip = self.neighbors_of(&packet.sender_id, now_ms);
        skip.insert(packet.sender_id);
        if let Some(p) = inbound_peer {
            skip.insert(p);
        }
        RelayPlan::Flood { skip }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MessageType;

    fn pid(n: u8) -> PeerId {
        PeerId::from_bytes([n; 8])
    }

    #[test]
    fn gossip_edges_expire() {
        let mut g = MeshGraph::new();
        g.update_gossip(pid(1), &[pid(2), pid(3)], 0);
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.sweep(GRAPH_TTL_MS), 2);
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn bfs_finds_shortest_path() {
        let mut g = MeshGraph::new();
        // local(1) -> 2 -> 3 -> 5, and a longer detour via 4.
        g.update_gossip(pid(2), &[pid(3)], 0);
        g.update_gossip(pid(3), &[pid(5)], 0);
        g.update_gossip(pid(2), &[pid(4)], 0);
        g.update_gossip(pid(4), &[pid(3)], 0);

        let path = g.find_route(pid(1), pid(5), &[pid(2)], 1).unwrap();
        assert_eq!(path, vec![pid(1), pid(2), pid(3), pid(5)]);
    }

    #[test]
    fn egress_prefers_direct_link() {
        let g = MeshGraph::new();
        assert_eq!(
            g.plan_egress(pid(1), pid(2), &[pid(2)], 0),
            EgressPlan::Direct(pid(2))
        );
    }

    #[test]
    fn egress_attaches_intermediates_only() {
        let mut g = MeshGraph::new();
        g.update_gossip(pid(2), &[pid(3)], 0);
        g.update_gossip(pid(3), &[pid(5)], 0);
        let plan = g.plan_egress(pid(1), pid(5), &[pid(2)], 1);
        assert_eq!(
            plan,
            EgressPlan::SourceRoute {
                first_hop: pid(2),
                route: vec![pid(2), pid(3)],
            }
        );
    }

    #[test]
    fn egress_falls_back_to_flood() {
        let g = MeshGraph::new();
        assert_eq!(g.plan_egress(pid(1), pid(9), &[pid(2)], 0), EgressPlan::Flood);
    }

    #[test]
    fn relay_floods_broadcast_skipping_inbound() {
        let g = MeshGraph::new();
        let p = Packet::new(MessageType::Message, pid(7), None, 0, vec![]);
        match g.plan_relay(&p, Some(pid(3)), pid(1), 0) {
            RelayPlan::Flood { skip } => {
                assert!(skip.contains(&pid(3)));
                assert!(skip.contains(&pid(7)));
            }
            other => panic!("expected flood, got {other:?}"),
        }
    }

    #[test]
    fn routed_relay_pops_self() {
        let g = MeshGraph::new();
        let mut p = Packet::new(MessageType::Message, pid(7), Some(pid(9)), 0, vec![]);
        p.route = Some(vec![pid(1), pid(2)]);
        match g.plan_relay(&p, Some(pid(7)), pid(1), 0) {
            RelayPlan::NextHop { hop } => assert_eq!(hop, pid(2)),
            other => panic!("expected next hop, got {other:?}"),
        }

        // The last intermediate hands straight to the recipient.
        let mut p = Packet::new(MessageType::Message, pid(7), Some(pid(9)), 0, vec![]);
        p.route = Some(vec![pid(1)]);
        match g.plan_relay(&p, Some(pid(7)), pid(1), 0) {
            RelayPlan::NextHop { hop } => assert_eq!(hop, pid(9)),
            other => panic!("expected next hop, got {other:?}"),
        }
    }

    #[test]
    fn off_route_node_does_not_relay() {
        let g = MeshGraph::new();
        let mut p = Packet::new(MessageType::Message, pid(7), Some(pid(9)), 0, vec![]);
        p.route = Some(vec![pid(2), pid(3)]);
        assert_eq!(g.plan_relay(&p, Some(pid(7)), pid(1), 0), RelayPlan::None);
    }

    #[test]
    fn unrouted_unicast_skips_sender_neighborhood() {
        let mut g = MeshGraph::new();
        g.update_gossip(pid(7), &[pid(4), pid(5)], 0);
        let p = Packet::new(MessageType::Message, pid(7), Some(pid(9)), 0, vec![]);
        match g.plan_relay(&p, Some(pid(7)), pid(1), 1) {
            RelayPlan::Flood { skip } => {
                assert!(skip.contains(&pid(4)));
                assert!(skip.contains(&pid(5)));
                assert!(skip.contains(&pid(7)));
            }
            other => panic!("expected flood, got {other:?}"),
        }
    }
}
