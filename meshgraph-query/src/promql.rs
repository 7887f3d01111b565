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

//! PromQL construction for traffic queries
//!
//! Every query is a range-rate sum grouped by the labels the graph builder
//! needs. Namespace graphs issue three passes per metric, node graphs issue
//! incoming and outgoing queries around one node.

use meshgraph_core::{
    is_ok, GraphError, GraphType, Node, NodeType, Protocol, Rate, RequestedRates, ResponseTimeQuantile,
    Result, ThroughputType, UNKNOWN,
};
use std::time::Duration;

pub const REQUESTS_METRIC: &str = "istio_requests_total";
pub const GRPC_SENT_METRIC: &str = "istio_request_messages_total";
pub const GRPC_RECEIVED_METRIC: &str = "istio_response_messages_total";
pub const TCP_SENT_METRIC: &str = "istio_tcp_sent_bytes_total";
pub const TCP_RECEIVED_METRIC: &str = "istio_tcp_received_bytes_total";
pub const REQUEST_DURATION_METRIC: &str = "istio_request_duration_milliseconds";

const IDENTITY_LABELS: &str = "source_cluster,source_workload_namespace,source_workload,\
source_canonical_service,source_canonical_revision,destination_cluster,\
destination_service_namespace,destination_service,destination_service_name,\
destination_workload_namespace,destination_workload,destination_canonical_service,\
destination_canonical_revision";

/// Per proxy labels, only kept when pods are graphed. Other graph types let
/// the backend sum across replicas.
const REPORTER_LABELS: &str = "pod,reporter";

/// Metric families the builder understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricFamily {
    /// HTTP and gRPC request counts
    Requests,
    GrpcMessages,
    TcpBytes,
}

impl MetricFamily {
    /// Protocol fixed by the family; requests carry it in `request_protocol`
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            MetricFamily::Requests => None,
            MetricFamily::GrpcMessages => Some(Protocol::Grpc),
            MetricFamily::TcpBytes => Some(Protocol::Tcp),
        }
    }

    /// Whether rows carry `response_flags`
    pub fn has_flags(&self) -> bool {
        !matches!(self, MetricFamily::GrpcMessages)
    }

    fn extra_labels(&self) -> &'static str {
        match self {
            MetricFamily::Requests => {
                ",request_protocol,response_code,grpc_response_status,response_flags"
            }
            MetricFamily::GrpcMessages => "",
            MetricFamily::TcpBytes => ",response_flags",
        }
    }

    /// Group-by for namespace graphs. Pod graphs keep one row per proxy.
    pub fn namespace_group_by(&self, graph_type: GraphType) -> String {
        if graph_type == GraphType::Pod {
            format!(
                "{IDENTITY_LABELS}{},{REPORTER_LABELS},source_service_name",
                self.extra_labels()
            )
        } else {
            format!("{IDENTITY_LABELS}{},source_service_name", self.extra_labels())
        }
    }

    /// Group-by for node and aggregate graphs
    pub fn node_group_by(&self) -> String {
        format!("{IDENTITY_LABELS}{}", self.extra_labels())
    }
}

/// A metric to query together with its family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficMetric {
    pub family: MetricFamily,
    pub name: &'static str,
}

impl TrafficMetric {
    const fn new(family: MetricFamily, name: &'static str) -> Self {
        Self { family, name }
    }
}

fn grpc_message_metrics(rate: Rate) -> &'static [&'static str] {
    match rate {
        Rate::Sent => &[GRPC_SENT_METRIC],
        Rate::Received => &[GRPC_RECEIVED_METRIC],
        Rate::Total => &[GRPC_SENT_METRIC, GRPC_RECEIVED_METRIC],
        Rate::None | Rate::Requests => &[],
    }
}

fn tcp_metrics(rate: Rate) -> &'static [&'static str] {
    match rate {
        Rate::Sent => &[TCP_SENT_METRIC],
        Rate::Received => &[TCP_RECEIVED_METRIC],
        // tcp has no request count, use total bytes
        Rate::Total | Rate::Requests => &[TCP_SENT_METRIC, TCP_RECEIVED_METRIC],
        Rate::None => &[],
    }
}

/// Metrics needed for the requested rates, in query order
pub fn traffic_metrics(rates: &RequestedRates) -> Vec<TrafficMetric> {
    let mut metrics = Vec::new();
    if rates.wants_requests() {
        metrics.push(TrafficMetric::new(MetricFamily::Requests, REQUESTS_METRIC));
    }
    if rates.wants_grpc_messages() {
        for name in grpc_message_metrics(rates.grpc) {
            metrics.push(TrafficMetric::new(MetricFamily::GrpcMessages, name));
        }
    }
    if rates.wants_tcp() {
        for name in tcp_metrics(rates.tcp) {
            metrics.push(TrafficMetric::new(MetricFamily::TcpBytes, name));
        }
    }
    metrics
}

fn idle_condition(include_idle_edges: bool) -> &'static str {
    if include_idle_edges {
        ""
    } else {
        "> 0"
    }
}

fn range(duration: Duration) -> u64 {
    duration.as_secs()
}

fn rate_sum(metric: &str, selector: &str, duration: Duration, group_by: &str, idle: &str) -> String {
    format!(
        "sum(rate({metric}{{{selector}}} [{}s])) by ({group_by}) {idle}",
        range(duration)
    )
}

/// The three namespace passes for one metric: unserviced incoming traffic via
/// source telemetry, serviced incoming via destination telemetry and outgoing
/// via source telemetry.
pub fn namespace_queries(
    metric: &TrafficMetric,
    namespace: &str,
    duration: Duration,
    include_idle_edges: bool,
    graph_type: GraphType,
) -> [String; 3] {
    let group_by = metric.family.namespace_group_by(graph_type);
    let idle = idle_condition(include_idle_edges);
    [
        rate_sum(
            metric.name,
            &format!(
                r#"reporter="source",source_workload_namespace!="{namespace}",destination_workload_namespace="unknown",destination_workload="unknown",destination_service=~"^.+\\.{namespace}\\..+$""#
            ),
            duration,
            &group_by,
            idle,
        ),
        rate_sum(
            metric.name,
            &format!(r#"reporter="destination",destination_workload_namespace="{namespace}""#),
            duration,
            &group_by,
            idle,
        ),
        rate_sum(
            metric.name,
            &format!(r#"reporter="source",source_workload_namespace="{namespace}""#),
            duration,
            &group_by,
            idle,
        ),
    ]
}

/// Queries around a single node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeQueries {
    pub incoming: Vec<String>,
    /// Empty when the node has no outgoing traffic to query
    pub outgoing: String,
}

/// Incoming (destination telemetry) and outgoing (source telemetry) queries for
/// a workload, app or service node.
pub fn node_queries(
    node: &Node,
    metric: &TrafficMetric,
    duration: Duration,
    include_idle_edges: bool,
) -> Result<NodeQueries> {
    let group_by = metric.family.node_group_by();
    let idle = idle_condition(include_idle_edges);
    let ns = &node.namespace;

    let (source_cluster, dest_cluster) = if node.cluster != UNKNOWN && !node.cluster.is_empty() {
        (
            format!(r#",source_cluster="{}""#, node.cluster),
            format!(r#",destination_cluster="{}""#, node.cluster),
        )
    } else {
        (String::new(), String::new())
    };

    let query = |selector: String| rate_sum(metric.name, &selector, duration, &group_by, idle);

    match node.node_type {
        NodeType::Workload => Ok(NodeQueries {
            incoming: vec![query(format!(
                r#"reporter="destination"{dest_cluster},destination_workload_namespace="{ns}",destination_workload="{}""#,
                node.workload
            ))],
            outgoing: query(format!(
                r#"reporter="source"{source_cluster},source_workload_namespace="{ns}",source_workload="{}""#,
                node.workload
            )),
        }),
        NodeType::App => {
            let (dest_version, source_version) = if is_ok(&node.version) {
                (
                    format!(r#",destination_canonical_revision="{}""#, node.version),
                    format!(r#",source_canonical_revision="{}""#, node.version),
                )
            } else {
                (String::new(), String::new())
            };
            Ok(NodeQueries {
                incoming: vec![query(format!(
                    r#"reporter="destination"{dest_cluster},destination_service_namespace="{ns}",destination_canonical_service="{}"{dest_version}"#,
                    node.app
                ))],
                outgoing: query(format!(
                    r#"reporter="source"{source_cluster},source_workload_namespace="{ns}",source_canonical_service="{}"{source_version}"#,
                    node.app
                )),
            })
        }
        NodeType::Service => {
            let svc = &node.service;
            let serviced = query(format!(
                r#"reporter="destination"{dest_cluster},destination_service_namespace="{ns}",destination_service=~"^{svc}\\.{ns}\\..*$""#
            ));
            // requests that never reached a workload are only seen by the source proxy
            let incoming = if metric.family == MetricFamily::Requests {
                vec![
                    query(format!(
                        r#"reporter="source"{dest_cluster},destination_workload="unknown",destination_service=~"^{svc}\\.{ns}\\..*$""#
                    )),
                    serviced,
                ]
            } else {
                vec![serviced]
            };
            Ok(NodeQueries {
                incoming,
                outgoing: String::new(),
            })
        }
        other => Err(GraphError::UnsupportedNodeType(other.to_string())),
    }
}

/// The destination telemetry query for an aggregate node
pub fn aggregate_query(
    namespace: &str,
    aggregate: &str,
    aggregate_value: &str,
    service: &str,
    duration: Duration,
) -> String {
    let service_fragment = if service.is_empty() {
        String::new()
    } else {
        format!(r#",destination_service_name="{service}""#)
    };
    format!(
        r#"sum(rate({REQUESTS_METRIC}{{reporter="destination",destination_service_namespace="{namespace}",{aggregate}="{aggregate_value}"{service_fragment}}}[{}s])) by ({}) > 0"#,
        range(duration),
        MetricFamily::Requests.node_group_by()
    )
}

/// Group-by for the aggregate node appender
pub fn aggregate_group_by(aggregate: &str) -> String {
    format!("{},{aggregate}", MetricFamily::Requests.node_group_by())
}

/// Namespace-wide requests split by an aggregate label
pub fn aggregate_namespace_query(
    namespace: &str,
    aggregate: &str,
    aggregate_value: Option<&str>,
    duration: Duration,
) -> String {
    let selector = match aggregate_value {
        Some(value) => format!(
            r#"reporter="destination",destination_service_namespace="{namespace}",{aggregate}="{value}""#
        ),
        None => format!(
            r#"reporter="destination",destination_service_namespace="{namespace}",{aggregate}!="unknown""#
        ),
    };
    format!(
        "sum(rate({REQUESTS_METRIC}{{{selector}}}[{}s])) by ({}) > 0",
        range(duration),
        aggregate_group_by(aggregate)
    )
}

const SECURITY_GROUP_BY: &str = "source_cluster,source_workload_namespace,source_workload,\
source_canonical_service,source_canonical_revision,source_principal,destination_cluster,\
destination_service_namespace,destination_service_name,destination_workload_namespace,\
destination_workload,destination_canonical_service,destination_canonical_revision,\
destination_principal,connection_security_policy,pod,reporter";

fn security_metrics(rates: &RequestedRates) -> Vec<&'static str> {
    let mut metrics = Vec::new();
    if rates.wants_requests() {
        metrics.push(REQUESTS_METRIC);
    }
    if matches!(rates.grpc, Rate::Sent | Rate::Total) {
        metrics.push(GRPC_SENT_METRIC);
    }
    if matches!(rates.grpc, Rate::Received | Rate::Total) {
        metrics.push(GRPC_RECEIVED_METRIC);
    }
    if matches!(rates.tcp, Rate::Sent | Rate::Total | Rate::Requests) {
        metrics.push(TCP_SENT_METRIC);
    }
    if matches!(rates.tcp, Rate::Received | Rate::Total | Rate::Requests) {
        metrics.push(TCP_RECEIVED_METRIC);
    }
    metrics
}

fn or_join(parts: Vec<String>) -> String {
    parts
        .into_iter()
        .map(|p| format!("({p})"))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Destination telemetry reporting the connection security policy:
/// traffic entering the namespace from outside, then traffic from inside it.
pub fn security_policy_queries(
    rates: &RequestedRates,
    namespace: &str,
    duration: Duration,
) -> (String, String) {
    let metrics = security_metrics(rates);
    let secs = range(duration);
    let outside = metrics
        .iter()
        .map(|m| {
            format!(
                r#"sum(rate({m}{{reporter="destination",source_workload_namespace!="{namespace}",destination_service_namespace="{namespace}"}}[{secs}s])) by ({SECURITY_GROUP_BY}) > 0"#
            )
        })
        .collect();
    let inside = metrics
        .iter()
        .map(|m| {
            format!(
                r#"sum(rate({m}{{reporter="destination",source_workload_namespace="{namespace}"}}[{secs}s])) by ({SECURITY_GROUP_BY}) > 0"#
            )
        })
        .collect();
    (or_join(outside), or_join(inside))
}

/// Response time per edge for the two destination telemetry namespace passes
pub fn response_time_queries(
    quantile: ResponseTimeQuantile,
    namespace: &str,
    duration: Duration,
) -> [String; 2] {
    let secs = range(duration);
    let selectors = [
        format!(
            r#"reporter="destination",source_workload_namespace!="{namespace}",destination_service_namespace="{namespace}",request_protocol=~"http|grpc""#
        ),
        format!(
            r#"reporter="destination",source_workload_namespace="{namespace}",request_protocol=~"http|grpc""#
        ),
    ];
    selectors.map(|selector| match quantile.quantile() {
        Some(q) => format!(
            "histogram_quantile({q}, sum(rate({REQUEST_DURATION_METRIC}_bucket{{{selector}}}[{secs}s])) by (le,{IDENTITY_LABELS},request_protocol)) > 0"
        ),
        None => format!(
            "sum(rate({REQUEST_DURATION_METRIC}_sum{{{selector}}}[{secs}s])) by ({IDENTITY_LABELS},request_protocol) / sum(rate({REQUEST_DURATION_METRIC}_count{{{selector}}}[{secs}s])) by ({IDENTITY_LABELS},request_protocol) > 0"
        ),
    })
}

/// Bytes per second per http edge for the two destination telemetry passes
pub fn throughput_queries(
    throughput: ThroughputType,
    namespace: &str,
    duration: Duration,
) -> [String; 2] {
    let secs = range(duration);
    let metric = throughput.metric();
    [
        format!(
            r#"sum(rate({metric}{{reporter="destination",source_workload_namespace!="{namespace}",destination_service_namespace="{namespace}",request_protocol="http"}}[{secs}s])) by ({IDENTITY_LABELS}) > 0"#
        ),
        format!(
            r#"sum(rate({metric}{{reporter="destination",source_workload_namespace="{namespace}",request_protocol="http"}}[{secs}s])) by ({IDENTITY_LABELS}) > 0"#
        ),
    ]
}
