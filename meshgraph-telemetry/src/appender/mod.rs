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

//! # Appenders
//!
//! Post-processing passes run over a namespace traffic map once it is built.
//! Each appender either annotates existing nodes and edges (security policy,
//! response times, throughput) or reshapes the graph (aggregate nodes).
//!
//! Appenders run sequentially in a fixed order:
//!
//! 1. `aggregateNode`, only for aggregate node graphs
//! 2. `responseTime`
//! 3. `securityPolicy`
//! 4. `throughput`

use crate::metrics::appender_timer;
use crate::util::EdgeLabels;
use async_trait::async_trait;
use meshgraph_core::{
    GraphError, GraphType, IdentityResolver, RequestedAppenders, Result, TelemetryOptions,
    TrafficMap,
};
use meshgraph_query::QueryEngine;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

pub mod aggregate_node;
pub mod response_time;
pub mod security_policy;
pub mod throughput;

pub use aggregate_node::AggregateNodeAppender;
pub use response_time::ResponseTimeAppender;
pub use security_policy::SecurityPolicyAppender;
pub use throughput::ThroughputAppender;

pub const APPENDER_NAMES: [&str; 4] = [
    aggregate_node::NAME,
    response_time::NAME,
    security_policy::NAME,
    throughput::NAME,
];

/// Creates the query engine on first use
pub type EngineFactory = Arc<dyn Fn() -> Result<QueryEngine> + Send + Sync>;

/// State shared by every appender of one graph request
pub struct AppenderGlobalInfo {
    engine: OnceCell<QueryEngine>,
    factory: Option<EngineFactory>,
}

impl AppenderGlobalInfo {
    /// Engine is created by `factory` the first time it is needed
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<QueryEngine> + Send + Sync + 'static,
    {
        Self {
            engine: OnceCell::new(),
            factory: Some(Arc::new(factory)),
        }
    }

    pub fn with_engine(engine: QueryEngine) -> Self {
        Self {
            engine: OnceCell::new_with(Some(engine)),
            factory: None,
        }
    }

    /// The shared engine, created at most once
    pub async fn engine(&self) -> Result<&QueryEngine> {
        self.engine
            .get_or_try_init(|| async {
                match &self.factory {
                    Some(factory) => factory(),
                    None => Err(GraphError::Config(
                        "no metrics backend configured".to_string(),
                    )),
                }
            })
            .await
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.initialized()
    }
}

/// Per namespace scratch space
#[derive(Debug, Clone, Default)]
pub struct AppenderNamespaceInfo {
    pub namespace: String,
    /// Data one appender leaves for later ones
    pub vendor: HashMap<String, Value>,
}

impl AppenderNamespaceInfo {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            vendor: HashMap::new(),
        }
    }
}

#[async_trait]
pub trait Appender: Send + Sync {
    fn name(&self) -> &'static str;

    async fn append_graph(
        &self,
        map: &mut TrafficMap,
        global: &AppenderGlobalInfo,
        namespace: &mut AppenderNamespaceInfo,
    ) -> Result<()>;
}

/// Appenders selected by `options`, in execution order
pub fn parse_appenders(options: &Arc<TelemetryOptions>) -> Result<Vec<Box<dyn Appender>>> {
    if let RequestedAppenders::Named(names) = &options.appenders {
        if let Some(unknown) = names
            .iter()
            .find(|n| !APPENDER_NAMES.contains(&n.as_str()))
        {
            return Err(GraphError::InvalidOption(format!(
                "appender [{unknown}] is not supported"
            )));
        }
    }

    let mut appenders: Vec<Box<dyn Appender>> = Vec::new();
    if options.is_aggregate_node_graph() {
        appenders.push(Box::new(AggregateNodeAppender::new(options.clone())));
    }
    if options.appenders.includes(response_time::NAME) {
        appenders.push(Box::new(ResponseTimeAppender::new(options.clone())));
    }
    if options.appenders.includes(security_policy::NAME) {
        appenders.push(Box::new(SecurityPolicyAppender::new(options.clone())));
    }
    if options.appenders.includes(throughput::NAME) {
        appenders.push(Box::new(ThroughputAppender::new(options.clone())));
    }
    Ok(appenders)
}

/// Run `appenders` over `map` in order, timing each one
pub async fn run_pipeline(
    appenders: &[Box<dyn Appender>],
    map: &mut TrafficMap,
    global: &AppenderGlobalInfo,
    namespace: &mut AppenderNamespaceInfo,
) -> Result<()> {
    for appender in appenders {
        let timer = appender_timer(appender.name());
        appender.append_graph(map, global, namespace).await?;
        let elapsed = timer.stop_and_record();
        debug!(
            appender = appender.name(),
            namespace = %namespace.namespace,
            elapsed_secs = elapsed,
            "Appender finished"
        );
    }
    Ok(())
}

/// Resolver configured like the builder for `options`
pub(crate) fn resolver(options: &TelemetryOptions) -> IdentityResolver {
    IdentityResolver::new(options.graph_type)
        .with_ingress_namespace(options.ingress.namespace.clone())
}

/// `(source id, dest id)` of every edge the builder attributes a row to
pub(crate) fn edge_keys(
    resolver: &IdentityResolver,
    options: &TelemetryOptions,
    labels: &EdgeLabels,
) -> Result<Vec<(String, String)>> {
    let mut source = labels.source();
    let mut dest = labels.dest();
    if options.graph_type != GraphType::Pod {
        source.pod.clear();
        dest.pod.clear();
    }
    if [&source, &dest].iter().any(|l| {
        l.service_namespace == meshgraph_core::UNKNOWN
            && l.workload_namespace == meshgraph_core::UNKNOWN
            && !l.service.is_empty()
    }) {
        return Ok(Vec::new());
    }

    let source_id = resolver.resolve(&source)?.id;
    let dest_id = resolver.resolve(&dest)?.id;

    let mut keys = Vec::new();
    if options.graph_type == GraphType::Pod {
        let service_id = resolver.resolve(&labels.dest_service_node())?.id;
        if !labels.dest_pod.is_empty() {
            keys.push((service_id.clone(), dest_id));
        }
        if labels.records_source_hop(resolver.ingress_namespace()) {
            keys.push((source_id, service_id));
        }
    } else if labels.should_inject(resolver, options)? {
        let service_id = resolver.resolve(&labels.dest_service_node())?.id;
        keys.push((source_id, service_id.clone()));
        keys.push((service_id, dest_id));
    } else {
        keys.push((source_id, dest_id));
    }
    Ok(keys)
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::util::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use meshgraph_query::{MetricsApi, QueryEngine, QueryError, QueryResponse, Sample};
    use std::sync::{Arc, Mutex};

    /// An http 200 row from workload `{source}-v1` to `{dest}-v1` in
    /// `bookinfo`, with `extra` labels added or overriding
    pub fn row(source: &str, dest: &str, value: f64, extra: &[(&str, &str)]) -> Sample {
        let mut labels: Vec<(String, String)> = [
            (SOURCE_CLUSTER, "east".to_string()),
            (SOURCE_WORKLOAD_NAMESPACE, "bookinfo".to_string()),
            (SOURCE_WORKLOAD, format!("{source}-v1")),
            (SOURCE_APP, source.to_string()),
            (SOURCE_VERSION, "v1".to_string()),
            (DEST_CLUSTER, "east".to_string()),
            (DEST_SERVICE_NAMESPACE, "bookinfo".to_string()),
            (DEST_SERVICE, format!("{dest}.bookinfo.svc.cluster.local")),
            (DEST_SERVICE_NAME, dest.to_string()),
            (DEST_WORKLOAD_NAMESPACE, "bookinfo".to_string()),
            (DEST_WORKLOAD, format!("{dest}-v1")),
            (DEST_APP, dest.to_string()),
            (DEST_VERSION, "v1".to_string()),
            (REQUEST_PROTOCOL, "http".to_string()),
            (RESPONSE_CODE, "200".to_string()),
            (RESPONSE_FLAGS, "-".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        for (k, v) in extra {
            match labels.iter_mut().find(|(name, _)| name == k) {
                Some(entry) => entry.1 = v.to_string(),
                None => labels.push((k.to_string(), v.to_string())),
            }
        }
        Sample::new(labels, value)
    }

    /// Answers every query with the samples registered for the first
    /// matching query fragment
    #[derive(Default)]
    pub struct ScriptedApi {
        pub answers: Vec<(String, Vec<Sample>)>,
        pub queries: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        pub fn answer(mut self, fragment: &str, samples: Vec<Sample>) -> Self {
            self.answers.push((fragment.to_string(), samples));
            self
        }

        pub fn engine(self: Arc<Self>) -> QueryEngine {
            QueryEngine::new(self)
        }
    }

    #[async_trait]
    impl MetricsApi for ScriptedApi {
        async fn query(
            &self,
            query: &str,
            _time: DateTime<Utc>,
        ) -> Result<QueryResponse, QueryError> {
            self.queries.lock().unwrap().push(query.to_string());
            let samples = self
                .answers
                .iter()
                .find(|(fragment, _)| query.contains(fragment.as_str()))
                .map(|(_, samples)| samples.clone())
                .unwrap_or_default();
            Ok(QueryResponse::vector(samples))
        }
    }
}
