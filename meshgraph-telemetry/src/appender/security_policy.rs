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

//! Mutual TLS and principal annotation of edges

use super::{edge_keys, resolver, Appender, AppenderGlobalInfo, AppenderNamespaceInfo};
use crate::util::{EdgeLabels, CONNECTION_SECURITY_POLICY, DEST_PRINCIPAL, SOURCE_PRINCIPAL};
use async_trait::async_trait;
use meshgraph_core::metadata as md;
use meshgraph_core::{Result, TelemetryOptions, TrafficMap, UNKNOWN};
use meshgraph_query::promql::security_policy_queries;
use meshgraph_query::Sample;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

pub const NAME: &str = "securityPolicy";

const POLICY_MTLS: &str = "mutual_tls";

type EdgeKey = (String, String);

#[derive(Debug, Default)]
struct PolicyTable {
    /// Rate per connection security policy
    rates: HashMap<EdgeKey, HashMap<String, f64>>,
    /// Source and destination principal, first reported wins
    principals: HashMap<EdgeKey, (String, String)>,
}

impl PolicyTable {
    fn add(&mut self, key: EdgeKey, policy: &str, value: f64, principals: (&str, &str)) {
        self.principals
            .entry(key.clone())
            .or_insert_with(|| (principals.0.to_string(), principals.1.to_string()));
        *self
            .rates
            .entry(key)
            .or_default()
            .entry(policy.to_string())
            .or_insert(0.0) += value;
    }
}

/// Percentage of mTLS traffic, `None` when no traffic used mTLS
pub fn mtls_percentage(policies: &HashMap<String, f64>) -> Option<f64> {
    let mtls = policies.get(POLICY_MTLS).copied().unwrap_or(0.0);
    if mtls <= 0.0 {
        return None;
    }
    let other: f64 = policies
        .iter()
        .filter(|(policy, _)| policy.as_str() != POLICY_MTLS)
        .map(|(_, rate)| rate)
        .sum();
    Some(mtls / (mtls + other) * 100.0)
}

pub struct SecurityPolicyAppender {
    options: Arc<TelemetryOptions>,
}

impl SecurityPolicyAppender {
    pub fn new(options: Arc<TelemetryOptions>) -> Self {
        Self { options }
    }

    fn populate(&self, table: &mut PolicyTable, samples: &[Sample]) {
        let resolver = resolver(&self.options);
        for sample in samples {
            let (Some(labels), Some(source_principal), Some(dest_principal)) = (
                EdgeLabels::from_sample(sample, false),
                sample.label(SOURCE_PRINCIPAL),
                sample.label(DEST_PRINCIPAL),
            ) else {
                warn!(labels = ?sample.labels, "Skipping security policy row, missing expected labels");
                continue;
            };
            let Some(labels) = labels.clean() else {
                continue;
            };
            let policy = sample.label(CONNECTION_SECURITY_POLICY).unwrap_or(UNKNOWN);

            match edge_keys(&resolver, &self.options, &labels) {
                Ok(keys) => {
                    for key in keys {
                        table.add(key, policy, sample.value, (source_principal, dest_principal));
                    }
                }
                Err(err) => warn!(error = %err, "Skipping security policy row"),
            }
        }
    }
}

fn apply(map: &mut TrafficMap, table: &PolicyTable) {
    for node in map.nodes_mut() {
        for edge in &mut node.edges {
            let key = (edge.source.clone(), edge.dest.clone());
            if let Some(percentage) = table.rates.get(&key).and_then(mtls_percentage) {
                edge.metadata.set_rate(md::IS_MTLS, percentage);
            }
            if let Some((source, dest)) = table.principals.get(&key) {
                edge.metadata.insert(md::SOURCE_PRINCIPAL, source.as_str().into());
                edge.metadata.insert(md::DEST_PRINCIPAL, dest.as_str().into());
            }
        }
    }
}

#[async_trait]
impl Appender for SecurityPolicyAppender {
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
        trace!(namespace = %namespace.namespace, rates = ?self.options.rates, "Resolving security policy");

        let duration = self.options.duration_for(&namespace.namespace);
        let (outside, inside) =
            security_policy_queries(&self.options.rates, &namespace.namespace, duration);
        let engine = global.engine().await?;
        let outside = engine.query_vector(&outside, self.options.query_time).await?;
        let inside = engine.query_vector(&inside, self.options.query_time).await?;

        let mut table = PolicyTable::default();
        self.populate(&mut table, &outside);
        self.populate(&mut table, &inside);
        apply(map, &table);
        Ok(())
    }
}
