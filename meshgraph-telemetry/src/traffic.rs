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

//! Traffic map construction from metric rows

use crate::util::{fingerprint, request_protocol_and_code, EdgeLabels, RESPONSE_FLAGS};
use meshgraph_core::protocol::{add_edge_rates, add_incoming_rates, add_outgoing_rates, NO_RESPONSE};
use meshgraph_core::{
    is_ok, GraphType, IdentityResolver, Node, NodeLabels, Protocol, Rate, Result, ServiceName,
    TelemetryOptions, TrafficMap, Traffic, UNKNOWN,
};
use meshgraph_query::{Sample, TrafficMetric};
use tracing::{debug, warn};

/// Accumulates metric rows into a [`TrafficMap`]
///
/// Istio reports most requests from both proxies. Every edge remembers the
/// fingerprints of the time series already applied to it so the same series
/// seen by two queries is counted once.
pub struct TrafficMapBuilder<'a> {
    options: &'a TelemetryOptions,
    resolver: IdentityResolver,
    map: TrafficMap,
}

impl<'a> TrafficMapBuilder<'a> {
    pub fn new(options: &'a TelemetryOptions) -> Self {
        Self::with_map(options, TrafficMap::new())
    }

    /// Continue building on top of an existing map
    pub fn with_map(options: &'a TelemetryOptions, map: TrafficMap) -> Self {
        let resolver = IdentityResolver::new(options.graph_type)
            .with_ingress_namespace(options.ingress.namespace.clone());
        Self {
            options,
            resolver,
            map,
        }
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn map(&self) -> &TrafficMap {
        &self.map
    }

    pub fn build(self) -> TrafficMap {
        self.map
    }

    /// Add the rows of one query result for `metric`
    pub fn populate(&mut self, samples: &[Sample], metric: &TrafficMetric) -> Result<()> {
        for sample in samples {
            let Some(labels) = EdgeLabels::from_sample(sample, true) else {
                warn!(metric = metric.name, labels = ?sample.labels, "Skipping row, missing expected labels");
                continue;
            };

            let flags = if metric.family.has_flags() {
                match sample.label(RESPONSE_FLAGS) {
                    Some(flags) => flags,
                    None => {
                        warn!(metric = metric.name, labels = ?sample.labels, "Skipping row, missing response flags");
                        continue;
                    }
                }
            } else {
                ""
            };

            let Some(labels) = labels.clean() else {
                debug!(metric = metric.name, labels = ?sample.labels, "Skipping row with unusable telemetry");
                continue;
            };

            let (protocol, code) = match metric.family.protocol() {
                None => {
                    let Some((protocol, code)) = request_protocol_and_code(sample) else {
                        warn!(labels = ?sample.labels, "Skipping row, missing expected HTTP/GRPC labels");
                        continue;
                    };
                    if !self.wants_requests(protocol) {
                        continue;
                    }
                    (protocol, code)
                }
                Some(Protocol::Tcp) => (Protocol::Tcp, NO_RESPONSE.to_string()),
                // message counts carry no response code
                Some(protocol) => (protocol, String::new()),
            };

            let inject = self.options.graph_type != GraphType::Pod
                && labels.should_inject(&self.resolver, self.options)?;

            let traffic = Traffic {
                protocol,
                value: sample.value,
                code: &code,
                flags,
                host: &labels.dest_service,
            };
            self.add_traffic(metric.name, &labels, inject, &traffic)?;
        }
        Ok(())
    }

    fn wants_requests(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Http => self.options.rates.http == Rate::Requests,
            Protocol::Grpc => self.options.rates.grpc == Rate::Requests,
            Protocol::Tcp => false,
        }
    }

    fn add_traffic(
        &mut self,
        metric: &str,
        labels: &EdgeLabels,
        inject: bool,
        traffic: &Traffic<'_>,
    ) -> Result<()> {
        let Some(source) = self.add_node(&labels.source())? else {
            return Ok(());
        };
        let Some(dest) = self.add_node(&labels.dest())? else {
            return Ok(());
        };
        let service = ServiceName::new(
            &labels.dest_cluster,
            &labels.dest_service_namespace,
            &labels.dest_service_name,
        );
        // decided once per row so every hop of the row agrees
        let from_ingress = labels.source_app == self.options.ingress.app;

        if self.options.graph_type == GraphType::Pod {
            if !labels.dest_pod.is_empty() {
                if let Some(injected) = self.add_node(&labels.dest_service_node())? {
                    let hash = self.edge_hash(metric, &injected, &dest, traffic);
                    self.add_edge_traffic(&injected, &dest, &hash, from_ingress, traffic);
                    self.add_to_dest_services(&dest, &service);
                }
            }
            if labels.records_source_hop(self.resolver.ingress_namespace()) {
                if let Some(injected) = self.add_node(&labels.dest_service_node())? {
                    let hash = self.edge_hash(metric, &source, &injected, traffic);
                    self.add_edge_traffic(&source, &injected, &hash, from_ingress, traffic);
                    self.add_to_dest_services(&injected, &service);
                }
            }
            return Ok(());
        }

        let hash = self.edge_hash(metric, &source, &dest, traffic);
        if inject {
            if let Some(injected) = self.add_node(&labels.dest_service_node())? {
                if self.add_edge_traffic(&source, &injected, &hash, from_ingress, traffic) {
                    self.add_to_dest_services(&injected, &service);
                    self.add_edge_traffic(&injected, &dest, &hash, from_ingress, traffic);
                    self.add_to_dest_services(&dest, &service);
                }
            }
        } else if self.add_edge_traffic(&source, &dest, &hash, from_ingress, traffic) {
            self.add_to_dest_services(&dest, &service);
        }
        Ok(())
    }

    /// Register a node for `labels` and return its id. Rows whose endpoint has
    /// neither namespace but claims a service are not attributable.
    fn add_node(&mut self, labels: &NodeLabels) -> Result<Option<String>> {
        if labels.service_namespace == UNKNOWN
            && labels.workload_namespace == UNKNOWN
            && !labels.service.is_empty()
        {
            return Ok(None);
        }

        let mut labels = labels.clone();
        if self.options.graph_type != GraphType::Pod {
            labels.pod.clear();
        }

        let node_id = self.resolver.resolve(&labels)?;
        let id = node_id.id.clone();
        let ts_hash = node_fingerprint(&labels, self.options.graph_type);
        match self.map.get_mut(&id) {
            Some(node) => node.ts_hash = ts_hash,
            None => {
                let mut node = Node::new(
                    node_id,
                    &labels,
                    self.options.graph_type,
                    self.resolver.ingress_namespace(),
                );
                node.ts_hash = ts_hash;
                self.map.insert(node);
            }
        }
        Ok(Some(id))
    }

    fn edge_hash(&self, metric: &str, source: &str, dest: &str, traffic: &Traffic<'_>) -> String {
        fingerprint(&[
            metric,
            self.ts_hash(source),
            self.ts_hash(dest),
            traffic.code,
            traffic.flags,
            traffic.host,
        ])
    }

    fn ts_hash(&self, id: &str) -> &str {
        self.map.get(id).map(|n| n.ts_hash.as_str()).unwrap_or_default()
    }

    /// Apply `traffic` to the `source` to `dest` edge unless the series was
    /// already applied. Series sent by the ingress app always accumulate.
    /// Returns whether anything was recorded.
    fn add_edge_traffic(
        &mut self,
        source: &str,
        dest: &str,
        hash: &str,
        from_ingress: bool,
        traffic: &Traffic<'_>,
    ) -> bool {
        let Some(source_node) = self.map.get_mut(source) else {
            return false;
        };

        let edge = source_node.edge_for(dest, traffic.protocol.as_str());
        // the ingress proxy legitimately repeats identical series
        if !edge.ts_hashes.insert(hash.to_string()) && !from_ingress {
            return false;
        }
        add_edge_rates(&mut edge.metadata, traffic);
        add_outgoing_rates(&mut source_node.metadata, traffic);

        if let Some(dest_node) = self.map.get_mut(dest) {
            add_incoming_rates(&mut dest_node.metadata, traffic);
        }
        true
    }

    fn add_to_dest_services(&mut self, id: &str, service: &ServiceName) {
        if !is_ok(&service.name) {
            return;
        }
        if let Some(node) = self.map.get_mut(id) {
            node.metadata.add_dest_service(service);
        }
    }
}

/// Fingerprint of the label tuple that registered a node. Pods are only part
/// of the identity in pod graphs.
pub fn node_fingerprint(labels: &NodeLabels, graph_type: GraphType) -> String {
    let mut parts = vec![
        labels.cluster.as_str(),
        labels.service_namespace.as_str(),
        labels.service.as_str(),
        labels.workload_namespace.as_str(),
        labels.workload.as_str(),
        labels.app.as_str(),
        labels.version.as_str(),
    ];
    if graph_type == GraphType::Pod {
        parts.push(labels.pod.as_str());
    }
    fingerprint(&parts)
}
