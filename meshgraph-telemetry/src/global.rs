// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Passes over the combined graph of all requested namespaces

use meshgraph_core::metadata as md;
use meshgraph_core::protocol::{add_outgoing_edge_to_metadata, merge_edge_rates, reset_outgoing_metadata};
use meshgraph_core::{Edge, Node, NodeType, TelemetryOptions, TrafficMap, UNKNOWN};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Merge a namespace map into the combined map
///
/// A node present in both keeps the copy owned by `namespace`, since only that
/// namespace's queries saw its full traffic. Edges of the other copy with a new
/// (destination, protocol) are appended.
pub fn merge_traffic_maps(combined: &mut TrafficMap, namespace: &str, namespace_map: TrafficMap) {
    for (id, node) in namespace_map {
        let Some(existing) = combined.remove(&id) else {
            combined.insert(node);
            continue;
        };
        let (mut kept, other) = if node.namespace == namespace {
            (node, existing)
        } else {
            (existing, node)
        };
        for edge in other.edges {
            let duplicate = kept
                .edges
                .iter()
                .any(|e| e.dest == edge.dest && e.protocol() == edge.protocol());
            if !duplicate {
                add_outgoing_edge_to_metadata(&mut kept.metadata, &edge.metadata);
                kept.edges.push(edge);
            }
        }
        combined.insert(kept);
    }
}

fn is_outside(namespace: &str, options: &TelemetryOptions) -> bool {
    namespace != UNKNOWN && !namespace.is_empty() && !options.is_requested(namespace)
}

fn mark_outside(node: &mut Node, options: &TelemetryOptions) {
    if is_outside(&node.namespace, options) {
        node.metadata.set_flag(md::IS_OUTSIDE);
        if !options.is_accessible(&node.namespace) {
            node.metadata.set_flag(md::IS_INACCESSIBLE);
        }
    }
}

/// Flag nodes outside the requested namespaces, and nodes the caller cannot
/// inspect further
pub fn mark_outside_or_inaccessible(map: &mut TrafficMap, options: &TelemetryOptions) {
    for node in map.nodes_mut() {
        match node.node_type {
            NodeType::Unknown => node.metadata.set_flag(md::IS_INACCESSIBLE),
            NodeType::Service => {
                if node.namespace == UNKNOWN || node.metadata.flag(md::IS_EGRESS_CLUSTER) {
                    node.metadata.set_flag(md::IS_INACCESSIBLE);
                } else {
                    mark_outside(node, options);
                }
            }
            _ => mark_outside(node, options),
        }
    }
}

/// Nodes that only send traffic are roots
pub fn mark_traffic_generators(map: &mut TrafficMap) {
    let destinations: HashSet<String> = map.edges().map(|e| e.dest.clone()).collect();
    for node in map.nodes_mut() {
        if !node.edges.is_empty() && !destinations.contains(&node.id) {
            node.metadata.set_flag(md::IS_ROOT);
        }
    }
}

fn recompute_outgoing(node: &mut Node) {
    reset_outgoing_metadata(&mut node.metadata);
    for edge in &node.edges {
        add_outgoing_edge_to_metadata(&mut node.metadata, &edge.metadata);
    }
}

/// Collapse an injected workload graph into a service graph
///
/// Service to workload to service paths become direct service to service
/// edges. Root workloads survive with their edges into services so the
/// origin of traffic stays visible.
pub fn reduce_to_service_graph(map: TrafficMap) -> TrafficMap {
    let mut reduced = TrafficMap::new();
    let is_service = |id: &str| map.node_type(id) == Some(NodeType::Service);

    for node in map.nodes() {
        if node.node_type != NodeType::Service {
            if !node.metadata.flag(md::IS_ROOT) {
                continue;
            }
            let edges: Vec<Edge> = node
                .edges
                .iter()
                .filter(|e| is_service(&e.dest))
                .cloned()
                .collect();
            if edges.is_empty() {
                trace!(node = %node.id, "Service graph ignoring root without service edges");
                continue;
            }
            let mut root = node.clone();
            root.edges = edges;
            recompute_outgoing(&mut root);
            reduced.insert(root);
            continue;
        }

        let mut service = node.clone();
        service.edges = Vec::new();
        for workload_edge in &node.edges {
            let Some(workload) = map.get(&workload_edge.dest) else {
                continue;
            };
            if workload.node_type != NodeType::Workload {
                debug!(
                    service = %node.id,
                    dest = %workload.id,
                    node_type = %workload.node_type,
                    "Service graph skipping non-workload destination"
                );
                continue;
            }
            for child in workload.edges.iter().filter(|e| is_service(&e.dest)) {
                match service
                    .edges
                    .iter_mut()
                    .find(|e| e.dest == child.dest && e.protocol() == child.protocol())
                {
                    Some(edge) => merge_edge_rates(&mut edge.metadata, &child.metadata),
                    None => {
                        let mut edge = child.clone();
                        edge.source = service.id.clone();
                        service.edges.push(edge);
                    }
                }
            }
        }
        recompute_outgoing(&mut service);
        reduced.insert(service);
    }
    reduced
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgraph_core::{GraphType, IdentityResolver, NodeLabels, Protocol, Traffic};

    fn node(map: &mut TrafficMap, namespace: &str, workload: &str, service: &str) -> String {
        let labels = NodeLabels {
            cluster: "east".to_string(),
            service_namespace: namespace.to_string(),
            service: service.to_string(),
            workload_namespace: if workload.is_empty() { String::new() } else { namespace.to_string() },
            workload: workload.to_string(),
            ..Default::default()
        };
        let id = IdentityResolver::new(GraphType::Workload).resolve(&labels).unwrap();
        let node = Node::new(id, &labels, GraphType::Workload, "ingress-nginx");
        let id = node.id.clone();
        map.insert(node);
        id
    }

    fn http(map: &mut TrafficMap, source: &str, dest: &str, value: f64) {
        let traffic = Traffic {
            protocol: Protocol::Http,
            value,
            code: "200",
            flags: "-",
            host: "",
        };
        let node = map.get_mut(source).unwrap();
        let edge = node.edge_for(dest, "http");
        meshgraph_core::protocol::add_edge_rates(&mut edge.metadata, &traffic);
        meshgraph_core::protocol::add_outgoing_rates(&mut node.metadata, &traffic);
    }

    #[test]
    fn test_merge_prefers_owning_namespace() {
        let mut combined = TrafficMap::new();
        let reviews = node(&mut combined, "bookinfo", "reviews-v1", "");
        let mongo = node(&mut combined, "db", "mongodb-v1", "");
        http(&mut combined, &reviews, &mongo, 1.0);
        combined.get_mut(&mongo).unwrap().metadata.set_flag("seenByBookinfo");

        let mut db = TrafficMap::new();
        node(&mut db, "db", "mongodb-v1", "");
        let backup = node(&mut db, "db", "backup-v1", "");
        http(&mut db, &mongo, &backup, 2.0);

        merge_traffic_maps(&mut combined, "db", db);

        let merged = combined.get(&mongo).unwrap();
        assert!(!merged.metadata.flag("seenByBookinfo"));
        assert_eq!(merged.edges.len(), 1);
        assert_eq!(combined.len(), 3);
        assert_eq!(combined.edge_count(), 2);
    }

    #[test]
    fn test_merge_appends_new_edges_once() {
        let mut combined = TrafficMap::new();
        let a = node(&mut combined, "ns1", "a-v1", "");
        let b = node(&mut combined, "ns2", "b-v1", "");
        let c = node(&mut combined, "ns2", "c-v1", "");
        http(&mut combined, &a, &b, 1.0);

        let mut other = TrafficMap::new();
        node(&mut other, "ns1", "a-v1", "");
        node(&mut other, "ns2", "b-v1", "");
        node(&mut other, "ns2", "c-v1", "");
        http(&mut other, &a, &b, 1.0);
        http(&mut other, &a, &c, 3.0);

        merge_traffic_maps(&mut combined, "ns2", other);

        let merged = combined.get(&a).unwrap();
        assert_eq!(merged.edges.len(), 2);
        assert_eq!(merged.metadata.rate(md::HTTP_OUT), 4.0);
    }

    #[test]
    fn test_outside_and_inaccessible() {
        let mut map = TrafficMap::new();
        let inside = node(&mut map, "bookinfo", "reviews-v1", "");
        let outside = node(&mut map, "istio-system", "istiod", "");
        let hidden = node(&mut map, "secret", "vault", "");
        let unknown = NodeLabels {
            cluster: "east".to_string(),
            service_namespace: UNKNOWN.to_string(),
            service: UNKNOWN.to_string(),
            workload_namespace: UNKNOWN.to_string(),
            workload: UNKNOWN.to_string(),
            app: UNKNOWN.to_string(),
            version: UNKNOWN.to_string(),
            pod: String::new(),
        };
        let resolver = IdentityResolver::new(GraphType::Workload);
        let lost = resolver.resolve(&unknown).unwrap();
        assert_eq!(lost.node_type, NodeType::Service);
        let lost_id = lost.id.clone();
        map.insert(Node::new(lost, &unknown, GraphType::Workload, "ingress-nginx"));

        let mut options = TelemetryOptions::new(GraphType::Workload, &["bookinfo"]);
        options.accessible_namespaces = Some(
            ["bookinfo", "istio-system"].iter().map(|s| s.to_string()).collect(),
        );
        mark_outside_or_inaccessible(&mut map, &options);

        assert!(!map.get(&inside).unwrap().metadata.flag(md::IS_OUTSIDE));
        let outside = &map.get(&outside).unwrap().metadata;
        assert!(outside.flag(md::IS_OUTSIDE));
        assert!(!outside.flag(md::IS_INACCESSIBLE));
        let hidden = &map.get(&hidden).unwrap().metadata;
        assert!(hidden.flag(md::IS_OUTSIDE) && hidden.flag(md::IS_INACCESSIBLE));
        let lost = &map.get(&lost_id).unwrap().metadata;
        assert!(lost.flag(md::IS_INACCESSIBLE));
        assert!(!lost.flag(md::IS_OUTSIDE));
    }

    #[test]
    fn test_traffic_generators() {
        let mut map = TrafficMap::new();
        let a = node(&mut map, "bookinfo", "a-v1", "");
        let b = node(&mut map, "bookinfo", "b-v1", "");
        let c = node(&mut map, "bookinfo", "c-v1", "");
        http(&mut map, &a, &b, 1.0);
        http(&mut map, &b, &c, 1.0);
        mark_traffic_generators(&mut map);

        assert!(map.get(&a).unwrap().metadata.flag(md::IS_ROOT));
        assert!(!map.get(&b).unwrap().metadata.flag(md::IS_ROOT));
        assert!(!map.get(&c).unwrap().metadata.flag(md::IS_ROOT));
    }

    #[test]
    fn test_reduce_to_service_graph() {
        let mut map = TrafficMap::new();
        let client = node(&mut map, "bookinfo", "productpage-v1", "");
        let reviews = node(&mut map, "bookinfo", "", "reviews");
        let reviews_v1 = node(&mut map, "bookinfo", "reviews-v1", "");
        let reviews_v2 = node(&mut map, "bookinfo", "reviews-v2", "");
        let ratings = node(&mut map, "bookinfo", "", "ratings");
        let ratings_v1 = node(&mut map, "bookinfo", "ratings-v1", "");

        http(&mut map, &client, &reviews, 10.0);
        http(&mut map, &client, &reviews_v1, 1.0);
        http(&mut map, &reviews, &reviews_v1, 6.0);
        http(&mut map, &reviews, &reviews_v2, 4.0);
        http(&mut map, &reviews_v1, &ratings, 2.0);
        http(&mut map, &reviews_v2, &ratings, 3.0);
        http(&mut map, &ratings, &ratings_v1, 5.0);
        mark_traffic_generators(&mut map);

        let reduced = reduce_to_service_graph(map);
        assert_eq!(reduced.len(), 3);

        let client = reduced.get(&client).unwrap();
        assert_eq!(client.edges.len(), 1);
        assert_eq!(client.metadata.rate(md::HTTP_OUT), 10.0);

        let reviews = reduced.get(&reviews).unwrap();
        assert_eq!(reviews.edges.len(), 1);
        assert_eq!(reviews.edges[0].source, reviews.id);
        assert_eq!(reviews.edges[0].dest, ratings);
        assert_eq!(reviews.edges[0].metadata.rate(md::HTTP), 5.0);
        assert_eq!(reviews.metadata.rate(md::HTTP_OUT), 5.0);

        assert!(reduced.get(&ratings).unwrap().edges.is_empty());
    }

    #[test]
    fn test_reduce_skips_non_workload_hops() {
        let mut map = TrafficMap::new();
        let a = node(&mut map, "bookinfo", "", "a");
        let b = node(&mut map, "bookinfo", "", "b");
        http(&mut map, &a, &b, 1.0);
        let reduced = reduce_to_service_graph(map);
        assert_eq!(reduced.len(), 2);
        assert!(reduced.get(&a).unwrap().edges.is_empty());
    }
}
