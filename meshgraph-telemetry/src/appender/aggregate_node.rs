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

//! Aggregate node insertion for aggregate node graphs
//!
//! An aggregate groups requests by a request attribute (for example
//! `request_operation`). The matching traffic of every source to destination
//! edge is rerouted through a single aggregate node.

use super::{edge_keys, resolver, Appender, AppenderGlobalInfo, AppenderNamespaceInfo};
use crate::util::{request_protocol_and_code, EdgeLabels, RESPONSE_FLAGS};
use async_trait::async_trait;
use meshgraph_core::protocol::{add_edge_rates, add_incoming_rates, add_outgoing_rates};
use meshgraph_core::{is_ok, Node, Protocol, Result, TelemetryOptions, TrafficMap, Traffic};
use meshgraph_query::promql::aggregate_namespace_query;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub const NAME: &str = "aggregateNode";

pub struct AggregateNodeAppender {
    options: Arc<TelemetryOptions>,
}

impl AggregateNodeAppender {
    pub fn new(options: Arc<TelemetryOptions>) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Appender for AggregateNodeAppender {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn append_graph(
        &self,
        map: &mut TrafficMap,
        global: &AppenderGlobalInfo,
        namespace: &mut AppenderNamespaceInfo,
    ) -> Result<()> {
        let Some(node) = self.options.node.as_ref().filter(|n| n.is_aggregate()) else {
            return Ok(());
        };
        if map.is_empty() {
            return Ok(());
        }

        let duration = self.options.duration_for(&namespace.namespace);
        let query = aggregate_namespace_query(
            &namespace.namespace,
            &node.aggregate,
            Some(&node.aggregate_value),
            duration,
        );
        let samples = global
            .engine()
            .await?
            .query_vector(&query, self.options.query_time)
            .await?;

        let resolver = resolver(&self.options);
        let mut rerouted: BTreeSet<(String, String, Protocol)> = BTreeSet::new();
        for sample in &samples {
            let (Some(labels), Some(flags), Some((protocol, code))) = (
                EdgeLabels::from_sample(sample, true).and_then(EdgeLabels::clean),
                sample.label(RESPONSE_FLAGS),
                request_protocol_and_code(sample),
            ) else {
                warn!(labels = ?sample.labels, "Skipping aggregate row, missing expected labels");
                continue;
            };
            if !node.service.is_empty() && labels.dest_service_name != node.service {
                continue;
            }

            let (source, target) = match edge_keys(&resolver, &self.options, &labels) {
                Ok(keys) => match keys.into_iter().next() {
                    Some(key) => key,
                    None => continue,
                },
                Err(err) => {
                    warn!(error = %err, "Skipping aggregate row");
                    continue;
                }
            };
            let has_edge = map
                .get(&source)
                .and_then(|n| n.find_edge(&target, protocol.as_str()))
                .is_some();
            if !has_edge {
                debug!(%source, %target, "No edge for aggregate row");
                continue;
            }

            let cluster = if is_ok(&node.cluster) {
                node.cluster.as_str()
            } else {
                labels.dest_cluster.as_str()
            };
            let aggregate = Node::aggregate(
                cluster,
                &node.namespace,
                &node.aggregate,
                &node.aggregate_value,
                &node.service,
                &node.app,
            );
            let aggregate_id = aggregate.id.clone();
            if !map.contains(&aggregate_id) {
                map.insert(aggregate);
            }

            let traffic = Traffic {
                protocol,
                value: sample.value,
                code: &code,
                flags,
                host: &labels.dest_service,
            };
            if let Some(source_node) = map.get_mut(&source) {
                let edge = source_node.edge_for(&aggregate_id, protocol.as_str());
                add_edge_rates(&mut edge.metadata, &traffic);
            }
            if let Some(aggregate_node) = map.get_mut(&aggregate_id) {
                add_incoming_rates(&mut aggregate_node.metadata, &traffic);
                add_outgoing_rates(&mut aggregate_node.metadata, &traffic);
                let edge = aggregate_node.edge_for(&target, protocol.as_str());
                add_edge_rates(&mut edge.metadata, &traffic);
            }
            rerouted.insert((source, target, protocol));
        }

        for (source, target, protocol) in rerouted {
            if let Some(source_node) = map.get_mut(&source) {
                source_node
                    .edges
                    .retain(|e| !(e.dest == target && e.protocol() == Some(protocol.as_str())));
            }
        }
        Ok(())
    }
}
