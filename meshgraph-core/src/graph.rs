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

//! Traffic graph model
//!
//! A [`TrafficMap`] owns every [`Node`] of one graph keyed by node id. Nodes own
//! their outgoing [`Edge`]s; an edge names its endpoints by id, and both
//! endpoints live in the same map.

use crate::error::{GraphError, Result};
use crate::identity::{NodeId, NodeLabels};
use crate::metadata::{self, Metadata};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Istio label value for an unknown attribute
pub const UNKNOWN: &str = "unknown";

/// Destination service name used for traffic to unregistered hosts
pub const PASSTHROUGH_CLUSTER: &str = "PassthroughCluster";

/// Destination service name used for traffic blocked by the outbound policy
pub const BLACK_HOLE_CLUSTER: &str = "BlackHoleCluster";

/// Aggregation granularity of a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphType {
    #[serde(rename = "app")]
    App,
    #[serde(rename = "versionedApp")]
    VersionedApp,
    #[serde(rename = "workload")]
    Workload,
    /// Built as a workload graph with service injection, then reduced
    #[serde(rename = "service")]
    Service,
    #[serde(rename = "pod")]
    Pod,
}

impl GraphType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphType::App => "app",
            GraphType::VersionedApp => "versionedApp",
            GraphType::Workload => "workload",
            GraphType::Service => "service",
            GraphType::Pod => "pod",
        }
    }
}

impl fmt::Display for GraphType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GraphType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "app" => Ok(GraphType::App),
            "versionedApp" => Ok(GraphType::VersionedApp),
            "workload" => Ok(GraphType::Workload),
            "service" => Ok(GraphType::Service),
            "pod" => Ok(GraphType::Pod),
            other => Err(GraphError::InvalidOption(format!(
                "graphType [{other}] must be one of app, versionedApp, workload, service, pod"
            ))),
        }
    }
}

/// Classification of a graph node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    App,
    Workload,
    Service,
    Pod,
    /// Injected node representing one value of a request attribute
    Aggregate,
    /// Unattributed traffic source
    Unknown,
    Box,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::App => "app",
            NodeType::Workload => "workload",
            NodeType::Service => "service",
            NodeType::Pod => "pod",
            NodeType::Aggregate => "aggregate",
            NodeType::Unknown => "unknown",
            NodeType::Box => "box",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified service name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceName {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
}

impl ServiceName {
    pub fn new(cluster: &str, namespace: &str, name: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn key(&self) -> String {
        format!("{} {} {}", self.cluster, self.namespace, self.name)
    }
}

/// A graph node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    pub cluster: String,
    pub namespace: String,
    pub workload: String,
    pub app: String,
    pub version: String,
    pub service: String,
    pub pod: String,
    /// Outgoing edges, in insertion order
    pub edges: Vec<Edge>,
    pub metadata: Metadata,
    /// Fingerprint of the label tuple last registered for this node
    #[serde(skip)]
    pub ts_hash: String,
}

impl Node {
    /// Create a node for an already resolved identity, trimming the coordinates
    /// that do not apply to its node type.
    pub fn new(
        node_id: NodeId,
        labels: &NodeLabels,
        graph_type: GraphType,
        ingress_namespace: &str,
    ) -> Self {
        let mut metadata = Metadata::new();
        let namespace = labels.namespace().to_string();
        let mut workload = labels.workload.clone();
        let mut app = labels.app.clone();
        let mut version = labels.version.clone();
        let mut service = labels.service.clone();

        match node_id.node_type {
            NodeType::App => {
                // a versioned app is backed by a single workload, keep its name
                if graph_type != GraphType::VersionedApp {
                    workload.clear();
                    version.clear();
                }
                service.clear();
            }
            NodeType::Service => {
                app.clear();
                workload.clear();
                version.clear();
                if service == PASSTHROUGH_CLUSTER || service == BLACK_HOLE_CLUSTER {
                    metadata.set_flag(metadata::IS_EGRESS_CLUSTER);
                }
            }
            NodeType::Workload => {
                if app == UNKNOWN {
                    app.clear();
                }
                if version == UNKNOWN {
                    version.clear();
                }
                service.clear();
            }
            NodeType::Pod => {
                service.clear();
                if graph_type == GraphType::Pod {
                    if namespace != ingress_namespace {
                        workload.clear();
                    }
                    version.clear();
                }
            }
            NodeType::Aggregate | NodeType::Unknown | NodeType::Box => {}
        }

        Self {
            id: node_id.id,
            node_type: node_id.node_type,
            cluster: labels.cluster.clone(),
            namespace,
            workload,
            app,
            version,
            service,
            pod: labels.pod.clone(),
            edges: Vec::new(),
            metadata,
            ts_hash: String::new(),
        }
    }

    /// Create an aggregate node. `service` and `app` are empty unless the
    /// aggregate is specific to one service.
    pub fn aggregate(
        cluster: &str,
        namespace: &str,
        aggregate: &str,
        aggregate_value: &str,
        service: &str,
        app: &str,
    ) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(metadata::AGGREGATE, aggregate.into());
        metadata.insert(metadata::AGGREGATE_VALUE, aggregate_value.into());

        Self {
            id: crate::identity::aggregate_id(cluster, namespace, aggregate, aggregate_value, service),
            node_type: NodeType::Aggregate,
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            workload: String::new(),
            app: app.to_string(),
            version: String::new(),
            service: service.to_string(),
            pod: String::new(),
            edges: Vec::new(),
            metadata,
            ts_hash: String::new(),
        }
    }

    /// Append a new edge to `dest` and return it
    pub fn add_edge(&mut self, dest: &str) -> &mut Edge {
        self.edges.push(Edge::new(&self.id, dest));
        let last = self.edges.len() - 1;
        &mut self.edges[last]
    }

    /// Find the edge to `dest` carrying `protocol`
    pub fn find_edge(&self, dest: &str, protocol: &str) -> Option<usize> {
        self.edges
            .iter()
            .position(|e| e.dest == dest && e.protocol() == Some(protocol))
    }

    /// Edge to `dest` carrying `protocol`, created when missing
    pub fn edge_for(&mut self, dest: &str, protocol: &str) -> &mut Edge {
        match self.find_edge(dest, protocol) {
            Some(idx) => &mut self.edges[idx],
            None => {
                let edge = self.add_edge(dest);
                edge.metadata.insert(metadata::PROTOCOL, protocol.into());
                edge
            }
        }
    }
}

/// A directed edge between two nodes of the same map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub dest: String,
    pub metadata: Metadata,
    /// Time-series fingerprints already applied to this edge
    #[serde(skip)]
    pub ts_hashes: HashSet<String>,
}

impl Edge {
    pub fn new(source: &str, dest: &str) -> Self {
        Self {
            source: source.to_string(),
            dest: dest.to_string(),
            metadata: Metadata::new(),
            ts_hashes: HashSet::new(),
        }
    }

    pub fn protocol(&self) -> Option<&str> {
        self.metadata.get_str(metadata::PROTOCOL)
    }
}

/// One graph: node id to node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrafficMap {
    nodes: BTreeMap<String, Node>,
}

impl TrafficMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Insert a node, returning the node previously stored under its id
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.id.clone(), node)
    }

    pub fn remove(&mut self, id: &str) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Every edge of the graph
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.nodes.values().flat_map(|n| n.edges.iter())
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.edges.len()).sum()
    }

    /// Node type of `id`, if present
    pub fn node_type(&self, id: &str) -> Option<NodeType> {
        self.nodes.get(id).map(|n| n.node_type)
    }

    /// Mutable access to two distinct nodes at once
    pub fn pair_mut(&mut self, a: &str, b: &str) -> Option<(&mut Node, &mut Node)> {
        if a == b {
            return None;
        }
        let mut first = None;
        let mut second = None;
        for (id, node) in self.nodes.iter_mut() {
            if id == a {
                first = Some(node);
            } else if id == b {
                second = Some(node);
            }
        }
        match (first, second) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        }
    }
}

impl IntoIterator for TrafficMap {
    type Item = (String, Node);
    type IntoIter = std::collections::btree_map::IntoIter<String, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl FromIterator<Node> for TrafficMap {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        let mut map = TrafficMap::new();
        for node in iter {
            map.insert(node);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityResolver;

    fn labels(service: &str, workload: &str, app: &str, version: &str) -> NodeLabels {
        NodeLabels {
            cluster: "east".to_string(),
            service_namespace: "bookinfo".to_string(),
            service: service.to_string(),
            workload_namespace: "bookinfo".to_string(),
            workload: workload.to_string(),
            app: app.to_string(),
            version: version.to_string(),
            pod: String::new(),
        }
    }

    #[test]
    fn test_graph_type_round_trip() {
        for s in ["app", "versionedApp", "workload", "service", "pod"] {
            assert_eq!(s.parse::<GraphType>().unwrap().as_str(), s);
        }
        assert!("cluster".parse::<GraphType>().is_err());
    }

    #[test]
    fn test_service_node_trims_workload_fields() {
        let l = labels("ratings", "unknown", "unknown", "unknown");
        let id = IdentityResolver::new(GraphType::Workload).resolve(&l).unwrap();
        let node = Node::new(id, &l, GraphType::Workload, "ingress-nginx");
        assert_eq!(node.node_type, NodeType::Service);
        assert_eq!(node.service, "ratings");
        assert!(node.workload.is_empty());
        assert!(node.app.is_empty());
        assert!(node.version.is_empty());
    }

    #[test]
    fn test_app_node_keeps_workload_only_when_versioned() {
        let l = labels("", "reviews-v1", "reviews", "v1");

        let id = IdentityResolver::new(GraphType::App).resolve(&l).unwrap();
        let node = Node::new(id, &l, GraphType::App, "ingress-nginx");
        assert!(node.workload.is_empty());
        assert!(node.version.is_empty());

        let id = IdentityResolver::new(GraphType::VersionedApp).resolve(&l).unwrap();
        let node = Node::new(id, &l, GraphType::VersionedApp, "ingress-nginx");
        assert_eq!(node.workload, "reviews-v1");
        assert_eq!(node.version, "v1");
    }

    #[test]
    fn test_egress_cluster_flag() {
        let l = labels(PASSTHROUGH_CLUSTER, "", "", "");
        let id = IdentityResolver::new(GraphType::Workload).resolve(&l).unwrap();
        let node = Node::new(id, &l, GraphType::Workload, "ingress-nginx");
        assert!(node.metadata.flag(metadata::IS_EGRESS_CLUSTER));
    }

    #[test]
    fn test_edge_for_separates_protocols() {
        let mut node = Node::aggregate("east", "bookinfo", "request_operation", "GET", "", "");
        node.edge_for("svc_a", "http");
        node.edge_for("svc_a", "http");
        node.edge_for("svc_a", "grpc");
        assert_eq!(node.edges.len(), 2);
        assert_eq!(node.find_edge("svc_a", "grpc"), Some(1));
    }

    #[test]
    fn test_pair_mut_requires_distinct_ids() {
        let mut map = TrafficMap::new();
        map.insert(Node::aggregate("c", "ns", "op", "a", "", ""));
        map.insert(Node::aggregate("c", "ns", "op", "b", "", ""));
        assert!(map.pair_mut("agg_c_ns_op_a", "agg_c_ns_op_a").is_none());
        let (a, b) = map.pair_mut("agg_c_ns_op_a", "agg_c_ns_op_b").unwrap();
        assert_eq!(a.id, "agg_c_ns_op_a");
        assert_eq!(b.id, "agg_c_ns_op_b");
    }
}
