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

//! Graph assembly for namespace and node requests

use crate::appender::{
    parse_appenders, run_pipeline, Appender, AppenderGlobalInfo, AppenderNamespaceInfo,
};
use crate::global::{
    mark_outside_or_inaccessible, mark_traffic_generators, merge_traffic_maps,
    reduce_to_service_graph,
};
use crate::traffic::TrafficMapBuilder;
use futures::future::try_join_all;
use meshgraph_core::{
    GraphError, GraphType, IdentityResolver, Node, NodeLabels, NodeOptions, Result,
    TelemetryOptions, TrafficMap, UNKNOWN,
};
use meshgraph_query::promql::{
    aggregate_query, namespace_queries, node_queries, traffic_metrics, REQUESTS_METRIC,
};
use meshgraph_query::{MetricFamily, TrafficMetric};
use std::iter;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds the traffic graph for one request
pub struct GraphAssembler {
    options: Arc<TelemetryOptions>,
    global: AppenderGlobalInfo,
}

impl GraphAssembler {
    /// Validates `options` before anything is queried
    pub fn new(mut options: TelemetryOptions, global: AppenderGlobalInfo) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options: Arc::new(options),
            global,
        })
    }

    pub fn options(&self) -> &TelemetryOptions {
        &self.options
    }

    pub async fn build(&self) -> Result<TrafficMap> {
        if self.options.is_node_graph() {
            self.build_node_graph().await
        } else {
            self.build_namespaces_graph().await
        }
    }

    /// Graph of every requested namespace. Namespaces are built concurrently
    /// and merged in the order they were requested.
    pub async fn build_namespaces_graph(&self) -> Result<TrafficMap> {
        let names: Vec<&str> = self.options.namespaces.iter().map(|ns| ns.name.as_str()).collect();
        info!(
            graph_type = %self.options.graph_type,
            namespaces = ?names,
            "Building namespaces graph"
        );

        let appenders = parse_appenders(&self.options)?;
        let maps = try_join_all(names.iter().map(|ns| self.build_namespace(ns, &appenders))).await?;

        let mut combined = TrafficMap::new();
        for (namespace, map) in names.iter().zip(maps) {
            merge_traffic_maps(&mut combined, namespace, map);
        }
        mark_outside_or_inaccessible(&mut combined, &self.options);
        mark_traffic_generators(&mut combined);

        if self.options.graph_type == GraphType::Service {
            combined = reduce_to_service_graph(combined);
        }
        debug!(
            nodes = combined.len(),
            edges = combined.edge_count(),
            "Namespaces graph complete"
        );
        Ok(combined)
    }

    async fn build_namespace(
        &self,
        namespace: &str,
        appenders: &[Box<dyn Appender>],
    ) -> Result<TrafficMap> {
        let engine = self.global.engine().await?;
        let duration = self.options.duration_for(namespace);
        let mut builder = TrafficMapBuilder::new(&self.options);

        for metric in traffic_metrics(&self.options.rates) {
            for query in
                namespace_queries(
                    &metric,
                    namespace,
                    duration,
                    self.options.include_idle_edges,
                    self.options.graph_type,
                )
            {
                let samples = engine.query_vector(&query, self.options.query_time).await?;
                builder.populate(&samples, &metric)?;
            }
        }

        let mut map = builder.build();
        debug!(namespace, nodes = map.len(), "Namespace traffic map built");
        let mut info = AppenderNamespaceInfo::new(namespace);
        run_pipeline(appenders, &mut map, &self.global, &mut info).await?;
        Ok(map)
    }

    /// Graph of the traffic into and out of one node. Node graphs are not
    /// reduced to services.
    pub async fn build_node_graph(&self) -> Result<TrafficMap> {
        let node = self.options.node.as_ref().ok_or_else(|| {
            GraphError::InvalidOption("node graph requires node options".to_string())
        })?;
        let namespace = node.namespace.as_str();
        info!(
            graph_type = %self.options.graph_type,
            namespace,
            workload = %node.workload,
            app = %node.app,
            service = %node.service,
            aggregate = %node.aggregate,
            "Building node graph"
        );

        let appenders = parse_appenders(&self.options)?;
        let engine = self.global.engine().await?;
        let duration = self.options.duration_for(namespace);
        let time = self.options.query_time;
        let mut builder = TrafficMapBuilder::new(&self.options);

        if node.is_aggregate() {
            let query = aggregate_query(
                namespace,
                &node.aggregate,
                &node.aggregate_value,
                &node.service,
                duration,
            );
            let metric = TrafficMetric {
                family: MetricFamily::Requests,
                name: REQUESTS_METRIC,
            };
            let samples = engine.query_vector(&query, time).await?;
            builder.populate(&samples, &metric)?;
        } else {
            let focus = focus_node(builder.resolver(), node)?;
            for metric in traffic_metrics(&self.options.rates) {
                let queries =
                    node_queries(&focus, &metric, duration, self.options.include_idle_edges)?;
                for query in queries.incoming.iter().chain(iter::once(&queries.outgoing)) {
                    let samples = engine.query_vector(query, time).await?;
                    builder.populate(&samples, &metric)?;
                }
            }
        }

        let mut map = builder.build();
        let mut info = AppenderNamespaceInfo::new(namespace);
        run_pipeline(&appenders, &mut map, &self.global, &mut info).await?;
        mark_outside_or_inaccessible(&mut map, &self.options);
        mark_traffic_generators(&mut map);
        Ok(map)
    }
}

/// The node a node graph is centered on
pub fn focus_node(resolver: &IdentityResolver, node: &NodeOptions) -> Result<Node> {
    let cluster = if node.cluster.is_empty() {
        UNKNOWN
    } else {
        node.cluster.as_str()
    };
    let labels = NodeLabels {
        cluster: cluster.to_string(),
        service_namespace: node.namespace.clone(),
        service: node.service.clone(),
        workload_namespace: node.namespace.clone(),
        workload: node.workload.clone(),
        app: node.app.clone(),
        version: node.version.clone(),
        pod: String::new(),
    };
    let id = resolver.resolve(&labels)?;
    Ok(Node::new(
        id,
        &labels,
        resolver.graph_type(),
        resolver.ingress_namespace(),
    ))
}
