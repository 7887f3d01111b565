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

//! Edge throughput in bytes per second

use super::{edge_keys, resolver, Appender, AppenderGlobalInfo, AppenderNamespaceInfo};
use crate::util::EdgeLabels;
use async_trait::async_trait;
use meshgraph_core::metadata as md;
use meshgraph_core::protocol::edge_protocol;
use meshgraph_core::{GraphType, Protocol, Result, TelemetryOptions, TrafficMap};
use meshgraph_query::promql::throughput_queries;
use meshgraph_query::Sample;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const NAME: &str = "throughput";

pub struct ThroughputAppender {
    options: Arc<TelemetryOptions>,
}

impl ThroughputAppender {
    pub fn new(options: Arc<TelemetryOptions>) -> Self {
        Self { options }
    }

    fn populate(&self, table: &mut HashMap<(String, String), f64>, samples: &[Sample]) {
        let resolver = resolver(&self.options);
        for sample in samples {
            let Some(labels) = EdgeLabels::from_sample(sample, false).and_then(EdgeLabels::clean)
            else {
                warn!(labels = ?sample.labels, "Skipping throughput row");
                continue;
            };
            match edge_keys(&resolver, &self.options, &labels) {
                Ok(keys) => {
                    for key in keys {
                        *table.entry(key).or_insert(0.0) += sample.value;
                    }
                }
                Err(err) => warn!(error = %err, "Skipping throughput row"),
            }
        }
    }
}

#[async_trait]
impl Appender for ThroughputAppender {
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
            debug!("Throughput is not reported per pod");
            return Ok(());
        }

        let duration = self.options.duration_for(&namespace.namespace);
        let engine = global.engine().await?;
        let mut table = HashMap::new();
        for query in throughput_queries(self.options.throughput_type, &namespace.namespace, duration)
        {
            let samples = engine.query_vector(&query, self.options.query_time).await?;
            self.populate(&mut table, &samples);
        }

        for node in map.nodes_mut() {
            for edge in &mut node.edges {
                if edge_protocol(&edge.metadata) != Some(Protocol::Http) {
                    continue;
                }
                let key = (edge.source.clone(), edge.dest.clone());
                if let Some(value) = table.get(&key) {
                    edge.metadata.set_rate(md::THROUGHPUT, *value);
                }
            }
        }
        Ok(())
    }
}
