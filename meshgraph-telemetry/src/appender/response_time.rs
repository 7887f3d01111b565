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

//! Edge response times

use super::{edge_keys, resolver, Appender, AppenderGlobalInfo, AppenderNamespaceInfo};
use crate::util::{EdgeLabels, REQUEST_PROTOCOL};
use async_trait::async_trait;
use meshgraph_core::metadata as md;
use meshgraph_core::{GraphType, Protocol, Result, TelemetryOptions, TrafficMap};
use meshgraph_query::promql::response_time_queries;
use meshgraph_query::Sample;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const NAME: &str = "responseTime";

/// `(source id, dest id, protocol)`
type EdgeKey = (String, String, Protocol);

/// Sets `responseTime` (ms) on http and grpc edges, using the configured
/// quantile or the average
pub struct ResponseTimeAppender {
    options: Arc<TelemetryOptions>,
}

impl ResponseTimeAppender {
    pub fn new(options: Arc<TelemetryOptions>) -> Self {
        Self { options }
    }

    fn populate(&self, table: &mut HashMap<EdgeKey, f64>, samples: &[Sample]) {
        let resolver = resolver(&self.options);
        for sample in samples {
            let Some(labels) = EdgeLabels::from_sample(sample, false) else {
                warn!(labels = ?sample.labels, "Skipping response time row, missing expected labels");
                continue;
            };
            let Some(protocol) = sample
                .label(REQUEST_PROTOCOL)
                .and_then(|p| p.parse::<Protocol>().ok())
            else {
                warn!(labels = ?sample.labels, "Skipping response time row, missing request protocol");
                continue;
            };
            let Some(labels) = labels.clean() else {
                continue;
            };
            match edge_keys(&resolver, &self.options, &labels) {
                Ok(keys) => {
                    for (source, dest) in keys {
                        // a service hop fronting several workloads reports the slowest
                        let entry = table.entry((source, dest, protocol)).or_insert(0.0);
                        *entry = entry.max(sample.value);
                    }
                }
                Err(err) => warn!(error = %err, "Skipping response time row"),
            }
        }
    }
}

#[async_trait]
impl Appender for ResponseTimeAppender {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn append_graph(
        &self,
        map: &mut TrafficMap,
        global: &AppenderGlobalInfo,
        namespace: &mut AppenderNamespaceInfo,
    ) -> Result<()> {
        if map.is_empty() {
            return Ok(());
        }
        if self.options.graph_type == GraphType::Pod {
            debug!("Response times are not reported per pod");
            return Ok(());
        }

        let duration = self.options.duration_for(&namespace.namespace);
        let engine = global.engine().await?;
        let mut table = HashMap::new();
        for query in response_time_queries(
            self.options.response_time_quantile,
            &namespace.namespace,
            duration,
        ) {
            let samples = engine.query_vector(&query, self.options.query_time).await?;
            self.populate(&mut table, &samples);
        }

        for node in map.nodes_mut() {
            for edge in &mut node.edges {
                let Some(protocol) = meshgraph_core::protocol::edge_protocol(&edge.metadata) else {
                    continue;
                };
                if protocol == Protocol::Tcp {
                    continue;
                }
                let key = (edge.source.clone(), edge.dest.clone(), protocol);
                if let Some(value) = table.get(&key) {
                    edge.metadata.set_rate(md::RESPONSE_TIME, *value);
                }
            }
        }
        Ok(())
    }
}
