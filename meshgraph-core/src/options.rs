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

//! Graph request options

use crate::error::{GraphError, Result};
use crate::graph::GraphType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_INGRESS_NAMESPACE: &str = "ingress-nginx";
pub const DEFAULT_INGRESS_APP: &str = "ingress-nginx";
pub const DEFAULT_DURATION: Duration = Duration::from_secs(600);

/// Appender selection value meaning every applicable appender
pub const ALL_APPENDERS: &str = "all";

/// Which traffic measure to graph for a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rate {
    None,
    Sent,
    Received,
    Total,
    Requests,
}

impl Rate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rate::None => "none",
            Rate::Sent => "sent",
            Rate::Received => "received",
            Rate::Total => "total",
            Rate::Requests => "requests",
        }
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rate {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Rate::None),
            "sent" => Ok(Rate::Sent),
            "received" => Ok(Rate::Received),
            "total" => Ok(Rate::Total),
            "requests" => Ok(Rate::Requests),
            other => Err(GraphError::InvalidOption(format!(
                "rate [{other}] must be one of none, sent, received, total, requests"
            ))),
        }
    }
}

/// Per protocol rate selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedRates {
    pub grpc: Rate,
    pub http: Rate,
    pub tcp: Rate,
}

impl Default for RequestedRates {
    fn default() -> Self {
        Self {
            grpc: Rate::Requests,
            http: Rate::Requests,
            tcp: Rate::Sent,
        }
    }
}

impl RequestedRates {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.http, Rate::None | Rate::Requests) {
            return Err(GraphError::InvalidOption(format!(
                "http rate [{}] must be one of none, requests",
                self.http
            )));
        }
        Ok(())
    }

    /// Request counts are needed for http or grpc
    pub fn wants_requests(&self) -> bool {
        self.http == Rate::Requests || self.grpc == Rate::Requests
    }

    /// gRPC message counts are needed
    pub fn wants_grpc_messages(&self) -> bool {
        matches!(self.grpc, Rate::Sent | Rate::Received | Rate::Total)
    }

    pub fn wants_tcp(&self) -> bool {
        self.tcp != Rate::None
    }
}

/// One requested namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub name: String,
    pub duration: Duration,
}

impl NamespaceInfo {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
        }
    }
}

/// The node a node graph is built around
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOptions {
    #[serde(default)]
    pub aggregate: String,
    #[serde(default)]
    pub aggregate_value: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub cluster: String,
    pub namespace: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub workload: String,
}

impl NodeOptions {
    pub fn is_aggregate(&self) -> bool {
        !self.aggregate.is_empty()
    }
}

/// Appender selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestedAppenders {
    #[default]
    All,
    Named(Vec<String>),
}

impl RequestedAppenders {
    pub fn includes(&self, name: &str) -> bool {
        match self {
            RequestedAppenders::All => true,
            RequestedAppenders::Named(names) => names.iter().any(|n| n == name),
        }
    }
}

impl FromStr for RequestedAppenders {
    type Err = GraphError;

    /// `all`, or a comma separated list of appender names (possibly empty)
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == ALL_APPENDERS {
            return Ok(RequestedAppenders::All);
        }
        Ok(RequestedAppenders::Named(
            s.split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect(),
        ))
    }
}

/// The ingress controller whose duplicate telemetry accumulates.
///
/// Rows whose source app is `app` skip series deduplication in every graph
/// type, pod graphs included, and on both hops of an injected service node.
/// `namespace` marks where the controller runs, so pod graphs can record
/// its unattributed rows on the source to service hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_ingress_namespace")]
    pub namespace: String,
    #[serde(default = "default_ingress_app")]
    pub app: String,
}

fn default_ingress_namespace() -> String {
    DEFAULT_INGRESS_NAMESPACE.to_string()
}

fn default_ingress_app() -> String {
    DEFAULT_INGRESS_APP.to_string()
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            namespace: default_ingress_namespace(),
            app: default_ingress_app(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseTimeQuantile {
    #[serde(rename = "avg")]
    Avg,
    #[serde(rename = "50")]
    P50,
    #[default]
    #[serde(rename = "95")]
    P95,
    #[serde(rename = "99")]
    P99,
}

impl ResponseTimeQuantile {
    /// Quantile for `histogram_quantile`, `None` for the average
    pub fn quantile(&self) -> Option<f64> {
        match self {
            ResponseTimeQuantile::Avg => None,
            ResponseTimeQuantile::P50 => Some(0.5),
            ResponseTimeQuantile::P95 => Some(0.95),
            ResponseTimeQuantile::P99 => Some(0.99),
        }
    }
}

impl FromStr for ResponseTimeQuantile {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "avg" => Ok(ResponseTimeQuantile::Avg),
            "50" => Ok(ResponseTimeQuantile::P50),
            "95" => Ok(ResponseTimeQuantile::P95),
            "99" => Ok(ResponseTimeQuantile::P99),
            other => Err(GraphError::InvalidOption(format!(
                "responseTime [{other}] must be one of avg, 50, 95, 99"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThroughputType {
    Request,
    #[default]
    Response,
}

impl ThroughputType {
    pub fn metric(&self) -> &'static str {
        match self {
            ThroughputType::Request => "istio_request_bytes_sum",
            ThroughputType::Response => "istio_response_bytes_sum",
        }
    }
}

impl FromStr for ThroughputType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "request" => Ok(ThroughputType::Request),
            "response" => Ok(ThroughputType::Response),
            other => Err(GraphError::InvalidOption(format!(
                "throughput [{other}] must be one of request, response"
            ))),
        }
    }
}

/// Everything a graph build needs to know about the request
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub graph_type: GraphType,
    /// Requested namespaces, in merge order
    pub namespaces: Vec<NamespaceInfo>,
    /// Namespaces the caller may see; `None` means no restriction
    pub accessible_namespaces: Option<HashSet<String>>,
    pub duration: Duration,
    pub query_time: DateTime<Utc>,
    pub rates: RequestedRates,
    pub include_idle_edges: bool,
    pub inject_service_nodes: bool,
    pub appenders: RequestedAppenders,
    pub node: Option<NodeOptions>,
    pub ingress: IngressConfig,
    pub response_time_quantile: ResponseTimeQuantile,
    pub throughput_type: ThroughputType,
}

impl TelemetryOptions {
    /// Options for a namespace graph with default settings
    pub fn new(graph_type: GraphType, namespaces: &[&str]) -> Self {
        Self {
            graph_type,
            namespaces: namespaces
                .iter()
                .map(|ns| NamespaceInfo::new(*ns, DEFAULT_DURATION))
                .collect(),
            accessible_namespaces: None,
            duration: DEFAULT_DURATION,
            query_time: Utc::now(),
            rates: RequestedRates::default(),
            include_idle_edges: false,
            inject_service_nodes: graph_type == GraphType::Service,
            appenders: RequestedAppenders::All,
            node: None,
            ingress: IngressConfig::default(),
            response_time_quantile: ResponseTimeQuantile::default(),
            throughput_type: ThroughputType::default(),
        }
    }

    /// Options for a node graph
    pub fn for_node(graph_type: GraphType, node: NodeOptions) -> Self {
        let namespace = node.namespace.clone();
        let mut options = Self::new(graph_type, &[namespace.as_str()]);
        options.node = Some(node);
        options
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        for ns in &mut self.namespaces {
            ns.duration = duration;
        }
        self
    }

    pub fn is_node_graph(&self) -> bool {
        self.node.is_some()
    }

    pub fn is_aggregate_node_graph(&self) -> bool {
        self.node.as_ref().map(NodeOptions::is_aggregate).unwrap_or(false)
    }

    /// Check option combinations and apply implied settings
    pub fn validate(&mut self) -> Result<()> {
        self.rates.validate()?;

        if self.namespaces.is_empty() && self.node.is_none() {
            return Err(GraphError::InvalidOption(
                "at least one namespace must be requested".to_string(),
            ));
        }
        if let Some(node) = &self.node {
            if node.namespace.is_empty() {
                return Err(GraphError::InvalidOption(
                    "node graph requires a namespace".to_string(),
                ));
            }
            if node.is_aggregate() && node.aggregate_value.is_empty() {
                return Err(GraphError::InvalidOption(
                    "aggregate node requires an aggregate value".to_string(),
                ));
            }
        }
        if self.duration.is_zero() {
            return Err(GraphError::InvalidOption(
                "duration must be positive".to_string(),
            ));
        }

        // the service view is reduced from an injected workload graph
        if self.graph_type == GraphType::Service {
            self.inject_service_nodes = true;
        }
        Ok(())
    }

    /// Rate window for `namespace`, falling back to the request duration
    pub fn duration_for(&self, namespace: &str) -> Duration {
        self.namespaces
            .iter()
            .find(|ns| ns.name == namespace)
            .map(|ns| ns.duration)
            .unwrap_or(self.duration)
    }

    /// Whether `namespace` was explicitly requested
    pub fn is_requested(&self, namespace: &str) -> bool {
        self.namespaces.iter().any(|ns| ns.name == namespace)
    }

    pub fn is_accessible(&self, namespace: &str) -> bool {
        self.accessible_namespaces
            .as_ref()
            .map(|set| set.contains(namespace))
            .unwrap_or(true)
    }
}
