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

//! Node identity resolution
//!
//! Maps a telemetry label tuple to a stable node id and node type. The same
//! tuple always resolves to the same identity for a given graph type.

use crate::error::{GraphError, Result};
use crate::graph::{GraphType, NodeType, UNKNOWN};
use crate::options::DEFAULT_INGRESS_NAMESPACE;
use serde::{Deserialize, Serialize};

/// A label value is usable when it is neither empty nor `unknown`
pub fn is_ok(value: &str) -> bool {
    !value.is_empty() && value != UNKNOWN
}

/// Versions additionally reject the `latest` placeholder
pub fn is_ok_version(value: &str) -> bool {
    is_ok(value) && value != "latest"
}

/// Coordinates of one side of a telemetry sample
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeLabels {
    pub cluster: String,
    pub service_namespace: String,
    pub service: String,
    pub workload_namespace: String,
    pub workload: String,
    pub app: String,
    pub version: String,
    pub pod: String,
}

impl NodeLabels {
    /// Workload namespace when usable, otherwise the service namespace
    pub fn namespace(&self) -> &str {
        if is_ok(&self.workload_namespace) {
            &self.workload_namespace
        } else {
            &self.service_namespace
        }
    }
}

/// Resolved node identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub id: String,
    pub node_type: NodeType,
}

impl NodeId {
    fn new(id: String, node_type: NodeType) -> Self {
        Self { id, node_type }
    }
}

/// Resolves node identities for one graph type
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    graph_type: GraphType,
    ingress_namespace: String,
}

impl IdentityResolver {
    pub fn new(graph_type: GraphType) -> Self {
        Self {
            graph_type,
            ingress_namespace: DEFAULT_INGRESS_NAMESPACE.to_string(),
        }
    }

    pub fn with_ingress_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.ingress_namespace = namespace.into();
        self
    }

    pub fn graph_type(&self) -> GraphType {
        self.graph_type
    }

    pub fn ingress_namespace(&self) -> &str {
        &self.ingress_namespace
    }

    pub fn resolve(&self, labels: &NodeLabels) -> Result<NodeId> {
        let cluster = labels.cluster.as_str();
        let namespace = labels.namespace();
        let workload = labels.workload.as_str();
        let app = labels.app.as_str();
        let service = labels.service.as_str();

        if namespace == UNKNOWN && workload == UNKNOWN && app == UNKNOWN && service.is_empty() {
            return Ok(NodeId::new(
                format!("{cluster}_unknown_source"),
                NodeType::Unknown,
            ));
        }

        // one unknown destination service per namespace
        if workload == UNKNOWN && app == UNKNOWN && service == UNKNOWN {
            return Ok(NodeId::new(
                format!("svc_{cluster}_{namespace}_unknown"),
                NodeType::Service,
            ));
        }

        let workload_ok = is_ok(workload);
        let app_ok = is_ok(app);
        let service_ok = is_ok(service);

        if self.graph_type == GraphType::Pod {
            if is_ok(&labels.pod) {
                return Ok(NodeId::new(
                    format!("pod_{cluster}_{namespace}_{}", labels.pod),
                    NodeType::Pod,
                ));
            }
            if labels.workload_namespace == self.ingress_namespace {
                if workload_ok {
                    return Ok(NodeId::new(
                        format!("vapp_{cluster}_{namespace}_{workload}"),
                        NodeType::App,
                    ));
                }
            } else {
                return Ok(NodeId::new(
                    format!("svc_{cluster}_{namespace}_{service}"),
                    NodeType::Service,
                ));
            }
        }

        if !workload_ok && !app_ok && !service_ok {
            return Err(self.failure(labels));
        }

        let workload_id = || {
            NodeId::new(
                format!("wl_{cluster}_{namespace}_{workload}"),
                NodeType::Workload,
            )
        };
        let service_id = || {
            NodeId::new(
                format!("svc_{cluster}_{namespace}_{service}"),
                NodeType::Service,
            )
        };

        match self.graph_type {
            // service graphs are built as workload graphs first
            GraphType::Workload | GraphType::Service => {
                if workload_ok {
                    Ok(workload_id())
                } else if service_ok {
                    Ok(service_id())
                } else {
                    Err(self.failure(labels))
                }
            }
            GraphType::App | GraphType::VersionedApp | GraphType::Pod => {
                if app_ok {
                    if self.graph_type == GraphType::VersionedApp {
                        if workload_ok {
                            return Ok(NodeId::new(
                                format!("vapp_{cluster}_{namespace}_{workload}"),
                                NodeType::App,
                            ));
                        }
                        if is_ok_version(&labels.version) {
                            return Ok(NodeId::new(
                                format!("vapp_{cluster}_{namespace}_{app}_{}", labels.version),
                                NodeType::App,
                            ));
                        }
                    }
                    return Ok(NodeId::new(
                        format!("app_{cluster}_{namespace}_{app}"),
                        NodeType::App,
                    ));
                }
                if workload_ok {
                    Ok(workload_id())
                } else {
                    Ok(service_id())
                }
            }
        }
    }

    fn failure(&self, labels: &NodeLabels) -> GraphError {
        GraphError::IdentityResolution {
            cluster: labels.cluster.clone(),
            namespace: labels.namespace().to_string(),
            workload: labels.workload.clone(),
            app: labels.app.clone(),
            version: labels.version.clone(),
            service: labels.service.clone(),
            graph_type: self.graph_type.to_string(),
        }
    }
}

/// Id of an aggregate node; `service` is empty for namespace-wide aggregates
pub fn aggregate_id(
    cluster: &str,
    namespace: &str,
    aggregate: &str,
    aggregate_value: &str,
    service: &str,
) -> String {
    if service.is_empty() {
        format!("agg_{cluster}_{namespace}_{aggregate}_{aggregate_value}")
    } else {
        format!("agg_{cluster}_{namespace}_{aggregate}_{aggregate_value}_{service}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labels(
        svc_ns: &str,
        svc: &str,
        wl_ns: &str,
        wl: &str,
        app: &str,
        version: &str,
    ) -> NodeLabels {
        NodeLabels {
            cluster: "east".to_string(),
            service_namespace: svc_ns.to_string(),
            service: svc.to_string(),
            workload_namespace: wl_ns.to_string(),
            workload: wl.to_string(),
            app: app.to_string(),
            version: version.to_string(),
            pod: String::new(),
        }
    }

    #[test]
    fn test_unknown_source() {
        let l = labels("", "", "unknown", "unknown", "unknown", "unknown");
        let id = IdentityResolver::new(GraphType::App).resolve(&l).unwrap();
        assert_eq!(id.id, "east_unknown_source");
        assert_eq!(id.node_type, NodeType::Unknown);
    }

    #[test]
    fn test_unknown_destination_service() {
        let l = labels("bookinfo", "unknown", "unknown", "unknown", "unknown", "unknown");
        let id = IdentityResolver::new(GraphType::Workload).resolve(&l).unwrap();
        assert_eq!(id.id, "svc_east_bookinfo_unknown");
        assert_eq!(id.node_type, NodeType::Service);
    }

    #[test]
    fn test_workload_graph_prefers_workload() {
        let r = IdentityResolver::new(GraphType::Workload);
        let l = labels("bookinfo", "reviews", "bookinfo", "reviews-v1", "reviews", "v1");
        assert_eq!(r.resolve(&l).unwrap().id, "wl_east_bookinfo_reviews-v1");

        let l = labels("bookinfo", "ratings", "unknown", "unknown", "unknown", "unknown");
        let id = r.resolve(&l).unwrap();
        assert_eq!(id.id, "svc_east_bookinfo_ratings");
        assert_eq!(id.node_type, NodeType::Service);
    }

    #[test]
    fn test_app_graph_identities() {
        let l = labels("bookinfo", "reviews", "bookinfo", "reviews-v1", "reviews", "v1");
        let app = IdentityResolver::new(GraphType::App).resolve(&l).unwrap();
        assert_eq!(app.id, "app_east_bookinfo_reviews");

        let vapp = IdentityResolver::new(GraphType::VersionedApp).resolve(&l).unwrap();
        assert_eq!(vapp.id, "vapp_east_bookinfo_reviews-v1");

        let l = labels("bookinfo", "reviews", "bookinfo", "", "reviews", "v2");
        let vapp = IdentityResolver::new(GraphType::VersionedApp).resolve(&l).unwrap();
        assert_eq!(vapp.id, "vapp_east_bookinfo_reviews_v2");

        let l = labels("bookinfo", "reviews", "bookinfo", "", "reviews", "latest");
        let vapp = IdentityResolver::new(GraphType::VersionedApp).resolve(&l).unwrap();
        assert_eq!(vapp.id, "app_east_bookinfo_reviews");
    }

    #[test]
    fn test_app_graph_falls_back_to_workload_then_service() {
        let r = IdentityResolver::new(GraphType::App);
        let l = labels("bookinfo", "", "bookinfo", "details-v1", "", "");
        assert_eq!(r.resolve(&l).unwrap().node_type, NodeType::Workload);

        let l = labels("bookinfo", "details", "bookinfo", "", "", "");
        assert_eq!(r.resolve(&l).unwrap().id, "svc_east_bookinfo_details");
    }

    #[test]
    fn test_pod_graph_identities() {
        let r = IdentityResolver::new(GraphType::Pod);
        let mut l = labels("bookinfo", "reviews", "bookinfo", "reviews-v1", "reviews", "v1");
        l.pod = "reviews-v1-abc".to_string();
        let id = r.resolve(&l).unwrap();
        assert_eq!(id.id, "pod_east_bookinfo_reviews-v1-abc");
        assert_eq!(id.node_type, NodeType::Pod);

        l.pod.clear();
        assert_eq!(r.resolve(&l).unwrap().id, "svc_east_bookinfo_reviews");

        let l = labels("", "", "ingress-nginx", "controller", "", "");
        let id = r.resolve(&l).unwrap();
        assert_eq!(id.id, "vapp_east_ingress-nginx_controller");
        assert_eq!(id.node_type, NodeType::App);
    }

    #[test]
    fn test_unresolvable_labels_are_an_error() {
        let l = labels("bookinfo", "", "bookinfo", "", "", "");
        let err = IdentityResolver::new(GraphType::Workload).resolve(&l).unwrap_err();
        assert!(matches!(err, GraphError::IdentityResolution { .. }));
    }

    #[test]
    fn test_aggregate_id() {
        assert_eq!(
            aggregate_id("east", "bookinfo", "request_operation", "GET", ""),
            "agg_east_bookinfo_request_operation_GET"
        );
        assert_eq!(
            aggregate_id("east", "bookinfo", "request_operation", "GET", "ratings"),
            "agg_east_bookinfo_request_operation_GET_ratings"
        );
    }

    fn label_value() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            Just("unknown".to_string()),
            Just("latest".to_string()),
            "[a-z]{1,8}",
        ]
    }

    fn graph_type() -> impl Strategy<Value = GraphType> {
        prop_oneof![
            Just(GraphType::App),
            Just(GraphType::VersionedApp),
            Just(GraphType::Workload),
            Just(GraphType::Service),
            Just(GraphType::Pod),
        ]
    }

    proptest! {
        #[test]
        fn prop_resolution_is_deterministic(
            gt in graph_type(),
            fields in proptest::collection::vec(label_value(), 8),
        ) {
            let l = NodeLabels {
                cluster: fields[0].clone(),
                service_namespace: fields[1].clone(),
                service: fields[2].clone(),
                workload_namespace: fields[3].clone(),
                workload: fields[4].clone(),
                app: fields[5].clone(),
                version: fields[6].clone(),
                pod: fields[7].clone(),
            };
            let r = IdentityResolver::new(gt);
            let first = r.resolve(&l);
            let second = r.resolve(&l.clone());
            match (first, second) {
                (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
                (Err(_), Err(_)) => {}
                _ => prop_assert!(false, "resolution outcome changed between calls"),
            }
        }
    }
}
