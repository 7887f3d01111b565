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

//! Telemetry label extraction and clean-up
//!
//! Istio telemetry has a few known defects and unusual destinations. Rows are
//! normalized here before they reach node resolution.

use meshgraph_core::protocol::NO_RESPONSE;
use meshgraph_core::{
    is_ok, IdentityResolver, NodeLabels, NodeType, Protocol, Result, TelemetryOptions, BLACK_HOLE_CLUSTER,
    PASSTHROUGH_CLUSTER, UNKNOWN,
};
use meshgraph_query::Sample;
use std::hash::Hasher;
use twox_hash::XxHash64;

pub const SOURCE_CLUSTER: &str = "source_cluster";
pub const SOURCE_WORKLOAD_NAMESPACE: &str = "source_workload_namespace";
pub const SOURCE_WORKLOAD: &str = "source_workload";
pub const SOURCE_APP: &str = "source_canonical_service";
pub const SOURCE_VERSION: &str = "source_canonical_revision";
pub const SOURCE_SERVICE_NAME: &str = "source_service_name";
pub const SOURCE_PRINCIPAL: &str = "source_principal";
pub const DEST_CLUSTER: &str = "destination_cluster";
pub const DEST_SERVICE_NAMESPACE: &str = "destination_service_namespace";
pub const DEST_SERVICE: &str = "destination_service";
pub const DEST_SERVICE_NAME: &str = "destination_service_name";
pub const DEST_WORKLOAD_NAMESPACE: &str = "destination_workload_namespace";
pub const DEST_WORKLOAD: &str = "destination_workload";
pub const DEST_APP: &str = "destination_canonical_service";
pub const DEST_VERSION: &str = "destination_canonical_revision";
pub const DEST_PRINCIPAL: &str = "destination_principal";
pub const REQUEST_PROTOCOL: &str = "request_protocol";
pub const RESPONSE_CODE: &str = "response_code";
pub const GRPC_RESPONSE_STATUS: &str = "grpc_response_status";
pub const RESPONSE_FLAGS: &str = "response_flags";
pub const CONNECTION_SECURITY_POLICY: &str = "connection_security_policy";
pub const POD: &str = "pod";
pub const REPORTER: &str = "reporter";

/// Labels every row must carry to be attributed to an edge
const REQUIRED_LABELS: [&str; 10] = [
    SOURCE_WORKLOAD_NAMESPACE,
    SOURCE_WORKLOAD,
    SOURCE_APP,
    SOURCE_VERSION,
    DEST_SERVICE_NAMESPACE,
    DEST_SERVICE_NAME,
    DEST_WORKLOAD_NAMESPACE,
    DEST_WORKLOAD,
    DEST_APP,
    DEST_VERSION,
];

/// Both endpoints of one telemetry row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeLabels {
    pub source_cluster: String,
    pub source_namespace: String,
    pub source_workload: String,
    pub source_app: String,
    pub source_version: String,
    /// `source_service_name`, empty when not reported
    pub source_service: String,
    pub source_pod: String,
    pub dest_cluster: String,
    pub dest_service_namespace: String,
    /// `destination_service`: the service host, request host or `unknown`
    pub dest_service: String,
    pub dest_service_name: String,
    pub dest_workload_namespace: String,
    pub dest_workload: String,
    pub dest_app: String,
    pub dest_version: String,
    pub dest_pod: String,
}

impl EdgeLabels {
    /// Extract endpoint labels, `None` when a required label is missing.
    /// `with_host` additionally requires `destination_service`.
    pub fn from_sample(sample: &Sample, with_host: bool) -> Option<Self> {
        if REQUIRED_LABELS.iter().any(|l| sample.label(l).is_none()) {
            return None;
        }
        if with_host && sample.label(DEST_SERVICE).is_none() {
            return None;
        }
        let get = |name: &str| sample.label(name).unwrap_or_default().to_string();

        let (source_cluster, dest_cluster) =
            handle_clusters(sample.label(SOURCE_CLUSTER), sample.label(DEST_CLUSTER));

        let pod = get(POD);
        let (source_pod, dest_pod) = match sample.label(REPORTER) {
            Some("source") => (pod, String::new()),
            Some("destination") => (String::new(), pod),
            _ => (String::new(), String::new()),
        };

        Some(Self {
            source_cluster,
            source_namespace: get(SOURCE_WORKLOAD_NAMESPACE),
            source_workload: get(SOURCE_WORKLOAD),
            source_app: get(SOURCE_APP),
            source_version: get(SOURCE_VERSION),
            source_service: get(SOURCE_SERVICE_NAME),
            source_pod,
            dest_cluster,
            dest_service_namespace: get(DEST_SERVICE_NAMESPACE),
            dest_service: get(DEST_SERVICE),
            dest_service_name: get(DEST_SERVICE_NAME),
            dest_workload_namespace: get(DEST_WORKLOAD_NAMESPACE),
            dest_workload: get(DEST_WORKLOAD),
            dest_app: get(DEST_APP),
            dest_version: get(DEST_VERSION),
            dest_pod,
        })
    }

    /// Apply the known telemetry fixes. `None` means the row must be dropped.
    pub fn clean(mut self) -> Option<Self> {
        if is_bad_source_telemetry(&self.source_namespace, &self.source_workload) {
            return None;
        }
        handle_destination(&mut self);
        if is_bad_dest_telemetry(
            &self.dest_service_namespace,
            &self.dest_service_name,
            &self.dest_workload,
        ) {
            return None;
        }
        Some(self)
    }

    pub fn source(&self) -> NodeLabels {
        NodeLabels {
            cluster: self.source_cluster.clone(),
            service_namespace: self.source_namespace.clone(),
            service: self.source_service.clone(),
            workload_namespace: self.source_namespace.clone(),
            workload: self.source_workload.clone(),
            app: self.source_app.clone(),
            version: self.source_version.clone(),
            pod: self.source_pod.clone(),
        }
    }

    pub fn dest(&self) -> NodeLabels {
        NodeLabels {
            cluster: self.dest_cluster.clone(),
            service_namespace: self.dest_service_namespace.clone(),
            service: self.dest_service_name.clone(),
            workload_namespace: self.dest_workload_namespace.clone(),
            workload: self.dest_workload.clone(),
            app: self.dest_app.clone(),
            version: self.dest_version.clone(),
            pod: self.dest_pod.clone(),
        }
    }

    /// The destination service alone, for injected service nodes
    pub fn dest_service_node(&self) -> NodeLabels {
        NodeLabels {
            cluster: self.dest_cluster.clone(),
            service_namespace: self.dest_service_namespace.clone(),
            service: self.dest_service_name.clone(),
            ..Default::default()
        }
    }

    /// Whether a service node belongs between source and destination
    pub fn should_inject(
        &self,
        resolver: &IdentityResolver,
        options: &TelemetryOptions,
    ) -> Result<bool> {
        if !options.inject_service_nodes
            || !is_ok(&self.dest_service_name)
            || self.dest_service_name == PASSTHROUGH_CLUSTER
        {
            return Ok(false);
        }
        Ok(resolver.resolve(&self.dest())?.node_type != NodeType::Service)
    }

    /// Whether pod graphs record this row on the source to service hop
    pub fn records_source_hop(&self, ingress_namespace: &str) -> bool {
        (!self.source_pod.is_empty()
            || self.source_namespace == ingress_namespace
            || self.source_namespace == UNKNOWN)
            && self.dest_service_namespace != UNKNOWN
    }
}

/// Missing or empty cluster labels become `unknown`
pub fn handle_clusters(source: Option<&str>, dest: Option<&str>) -> (String, String) {
    let cluster = |c: Option<&str>| match c {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => UNKNOWN.to_string(),
    };
    (cluster(source), cluster(dest))
}

/// A source with a namespace but no workload is a reporting artifact
pub fn is_bad_source_telemetry(namespace: &str, workload: &str) -> bool {
    is_ok(namespace) && !is_ok(workload)
}

/// Attribute egress placeholders to the sending side when they lack a location
pub fn handle_destination(labels: &mut EdgeLabels) {
    if labels.dest_service_name == PASSTHROUGH_CLUSTER
        || labels.dest_service_name == BLACK_HOLE_CLUSTER
    {
        if labels.dest_cluster == UNKNOWN {
            labels.dest_cluster = labels.source_cluster.clone();
        }
        if labels.dest_service_namespace == UNKNOWN {
            labels.dest_service_namespace = labels.source_namespace.clone();
        }
    }
}

/// A known workload with no service information at all cannot be placed
pub fn is_bad_dest_telemetry(service_namespace: &str, service_name: &str, workload: &str) -> bool {
    !is_ok(service_namespace) && !is_ok(service_name) && is_ok(workload)
}

/// Normalize the response code for a protocol. gRPC uses the gRPC status
/// when reported, otherwise HTTP 200 maps to status `0`.
pub fn handle_response_code(protocol: &str, http_code: &str, grpc_status: Option<&str>) -> String {
    let http_code = if http_code == "0" { NO_RESPONSE } else { http_code };
    if protocol != "grpc" {
        return http_code.to_string();
    }
    match grpc_status {
        Some(status) if !status.is_empty() => status.to_string(),
        _ if http_code == "200" => "0".to_string(),
        _ => NO_RESPONSE.to_string(),
    }
}

/// Protocol and normalized response code of a request row
pub fn request_protocol_and_code(sample: &Sample) -> Option<(Protocol, String)> {
    let protocol = sample.label(REQUEST_PROTOCOL)?.parse::<Protocol>().ok()?;
    let code = sample.label(RESPONSE_CODE)?;
    let code = handle_response_code(protocol.as_str(), code, sample.label(GRPC_RESPONSE_STATUS));
    Some((protocol, code))
}

/// Hex encoded XxHash64 of the parts joined by `:`
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(parts.join(":").as_bytes());
    hex::encode(hasher.finish().to_be_bytes())
}
