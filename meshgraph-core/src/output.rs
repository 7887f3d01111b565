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

//! Serialized graph form handed to the visualization layer

use crate::error::Result;
use crate::graph::{NodeType, TrafficMap};
use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub id: String,
    #[serde(rename = "nodeType")]
    pub node_type: NodeType,
    pub cluster: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workload: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeOutput {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// A traffic map flattened into sorted node and edge lists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphOutput {
    pub nodes: Vec<NodeOutput>,
    pub edges: Vec<EdgeOutput>,
}

impl GraphOutput {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl From<&TrafficMap> for GraphOutput {
    fn from(map: &TrafficMap) -> Self {
        // TrafficMap iterates in id order
        let nodes = map
            .nodes()
            .map(|n| NodeOutput {
                id: n.id.clone(),
                node_type: n.node_type,
                cluster: n.cluster.clone(),
                namespace: n.namespace.clone(),
                workload: n.workload.clone(),
                app: n.app.clone(),
                version: n.version.clone(),
                service: n.service.clone(),
                pod: n.pod.clone(),
                metadata: n.metadata.clone(),
            })
            .collect();

        let mut edges: Vec<EdgeOutput> = map
            .edges()
            .map(|e| EdgeOutput {
                source: e.source.clone(),
                target: e.dest.clone(),
                metadata: e.metadata.clone(),
            })
            .collect();
        edges.sort_by(|a, b| {
            (&a.source, &a.target, a.metadata.get_str(crate::metadata::PROTOCOL)).cmp(&(
                &b.source,
                &b.target,
                b.metadata.get_str(crate::metadata::PROTOCOL),
            ))
        });

        Self { nodes, edges }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    #[test]
    fn test_output_is_sorted() {
        let mut map = TrafficMap::new();
        let mut b = Node::aggregate("c", "ns", "op", "b", "", "");
        b.edge_for("agg_c_ns_op_a", "tcp");
        b.edge_for("agg_c_ns_op_a", "http");
        map.insert(b);
        map.insert(Node::aggregate("c", "ns", "op", "a", "", ""));

        let out = GraphOutput::from(&map);
        assert_eq!(out.nodes[0].id, "agg_c_ns_op_a");
        assert_eq!(out.nodes[1].id, "agg_c_ns_op_b");
        assert_eq!(out.edges.len(), 2);
        assert_eq!(out.edges[0].metadata.get_str("protocol"), Some("http"));

        let json: serde_json::Value = serde_json::from_str(&out.to_json().unwrap()).unwrap();
        assert_eq!(json["nodes"][0]["nodeType"], "aggregate");
        assert_eq!(json["edges"][1]["target"], "agg_c_ns_op_a");
        assert!(json["nodes"][0].get("workload").is_none());
    }
}
