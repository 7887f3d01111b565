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

//! End to end graph builds against an in-memory metrics backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshgraph_core::metadata as md;
use meshgraph_core::output::GraphOutput;
use meshgraph_core::{GraphError, GraphType, NodeOptions, NodeType, RequestedAppenders, TelemetryOptions};
use meshgraph_query::promql::REQUESTS_METRIC;
use meshgraph_query::{MetricFamily, MetricsApi, QueryEngine, QueryError, QueryResponse, Sample, TrafficMetric};
use meshgraph_telemetry::appender::security_policy::mtls_percentage;
use meshgraph_telemetry::util::*;
use meshgraph_telemetry::{AppenderGlobalInfo, GraphAssembler, TrafficMapBuilder};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const REQUESTS: TrafficMetric = TrafficMetric {
    family: MetricFamily::Requests,
    name: REQUESTS_METRIC,
};

/// Serves canned vectors keyed by query fragment; the first fragment
/// contained in a query wins
#[derive(Default)]
struct MeshApi {
    answers: Vec<(String, Vec<Sample>)>,
    fail_on: Option<String>,
    queries: Mutex<Vec<String>>,
}

impl MeshApi {
    fn answer(mut self, fragment: &str, samples: Vec<Sample>) -> Self {
        self.answers.push((fragment.to_string(), samples));
        self
    }

    fn fail_on(mut self, fragment: &str) -> Self {
        self.fail_on = Some(fragment.to_string());
        self
    }

    fn queries_containing(&self, fragment: &str) -> usize {
        self.queries.lock().iter().filter(|q| q.contains(fragment)).count()
    }
}

#[async_trait]
impl MetricsApi for MeshApi {
    async fn query(&self, query: &str, _time: DateTime<Utc>) -> Result<QueryResponse, QueryError> {
        self.queries.lock().push(query.to_string());
        if let Some(fragment) = &self.fail_on {
            if query.contains(fragment.as_str()) {
                return Err(QueryError::Api {
                    error_type: "execution".to_string(),
                    error: "query processing would load too many samples".to_string(),
                });
            }
        }
        let samples = self
            .answers
            .iter()
            .find(|(fragment, _)| query.contains(fragment.as_str()))
            .map(|(_, samples)| samples.clone())
            .unwrap_or_default();
        Ok(QueryResponse::vector(samples))
    }
}

/// Holds raw per proxy series and answers the way the backend aggregates
/// them: matching series are summed over the query's `by (...)` labels
#[derive(Default)]
struct ReplicaApi {
    series: Vec<(String, Vec<Sample>)>,
}

impl ReplicaApi {
    fn series(mut self, fragment: &str, samples: Vec<Sample>) -> Self {
        self.series.push((fragment.to_string(), samples));
        self
    }
}

fn group_by_labels(query: &str) -> Vec<&str> {
    query
        .rsplit_once(" by (")
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(labels, _)| labels.split(',').map(str::trim).collect())
        .unwrap_or_default()
}

#[async_trait]
impl MetricsApi for ReplicaApi {
    async fn query(&self, query: &str, _time: DateTime<Utc>) -> Result<QueryResponse, QueryError> {
        let by = group_by_labels(query);
        let mut sums: BTreeMap<Vec<(String, String)>, f64> = BTreeMap::new();
        let matching = self
            .series
            .iter()
            .filter(|(fragment, _)| query.contains(fragment.as_str()))
            .flat_map(|(_, samples)| samples);
        for sample in matching {
            let key = sample
                .labels
                .iter()
                .filter(|(name, _)| by.contains(&name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            *sums.entry(key).or_default() += sample.value;
        }
        Ok(QueryResponse::vector(
            sums.into_iter().map(|(labels, value)| Sample::new(labels, value)).collect(),
        ))
    }
}

fn serviced_incoming(namespace: &str) -> String {
    format!(r#"istio_requests_total{{reporter="destination",destination_workload_namespace="{namespace}""#)
}

fn outgoing(namespace: &str) -> String {
    format!(r#"istio_requests_total{{reporter="source",source_workload_namespace="{namespace}""#)
}

/// An http row between `{source}-v1` and `{dest}-v1`, reported by `reporter`
fn request(
    source: (&str, &str),
    dest: (&str, &str),
    reporter: &str,
    value: f64,
    extra: &[(&str, &str)],
) -> Sample {
    let (source_ns, source_app) = source;
    let (dest_ns, dest_app) = dest;
    let pod = match reporter {
        "source" => format!("{source_app}-v1-5d8f9c"),
        _ => format!("{dest_app}-v1-7b6c4a"),
    };
    let mut labels: HashMap<&str, String> = HashMap::from([
        (SOURCE_CLUSTER, "east".to_string()),
        (SOURCE_WORKLOAD_NAMESPACE, source_ns.to_string()),
        (SOURCE_WORKLOAD, format!("{source_app}-v1")),
        (SOURCE_APP, source_app.to_string()),
        (SOURCE_VERSION, "v1".to_string()),
        (DEST_CLUSTER, "east".to_string()),
        (DEST_SERVICE_NAMESPACE, dest_ns.to_string()),
        (DEST_SERVICE, format!("{dest_app}.{dest_ns}.svc.cluster.local")),
        (DEST_SERVICE_NAME, dest_app.to_string()),
        (DEST_WORKLOAD_NAMESPACE, dest_ns.to_string()),
        (DEST_WORKLOAD, format!("{dest_app}-v1")),
        (DEST_APP, dest_app.to_string()),
        (DEST_VERSION, "v1".to_string()),
        (REQUEST_PROTOCOL, "http".to_string()),
        (RESPONSE_CODE, "200".to_string()),
        (RESPONSE_FLAGS, "-".to_string()),
        (REPORTER, reporter.to_string()),
        (POD, pod),
    ]);
    for (k, v) in extra {
        labels.insert(*k, v.to_string());
    }
    Sample::new(labels, value)
}

fn bookinfo(source: &str, dest: &str, reporter: &str, value: f64) -> Sample {
    request(("bookinfo", source), ("bookinfo", dest), reporter, value, &[])
}

fn options(graph_type: GraphType, namespaces: &[&str]) -> TelemetryOptions {
    let mut options = TelemetryOptions::new(graph_type, namespaces);
    options.appenders = RequestedAppenders::Named(vec![]);
    options
}

async fn build(options: TelemetryOptions, api: Arc<dyn MetricsApi>) -> meshgraph_core::Result<meshgraph_core::TrafficMap> {
    let global = AppenderGlobalInfo::with_engine(QueryEngine::new(api));
    GraphAssembler::new(options, global)?.build().await
}

#[tokio::test]
async fn test_service_destination_is_not_split() {
    let row = request(
        ("bookinfo", "reviews"),
        ("bookinfo", "ratings"),
        "source",
        5.0,
        &[
            (DEST_WORKLOAD, "unknown"),
            (DEST_APP, "unknown"),
            (DEST_VERSION, "unknown"),
        ],
    );
    let api = Arc::new(MeshApi::default().answer(&outgoing("bookinfo"), vec![row]));
    let mut options = options(GraphType::Workload, &["bookinfo"]);
    options.inject_service_nodes = true;

    let map = build(options, api).await.unwrap();

    assert_eq!(map.len(), 2);
    assert_eq!(map.edge_count(), 1);
    let edge = &map.get("wl_east_bookinfo_reviews-v1").unwrap().edges[0];
    assert_eq!(edge.dest, "svc_east_bookinfo_ratings");
    assert_eq!(edge.metadata.rate(md::HTTP), 5.0);
}

#[tokio::test]
async fn test_injected_hops_carry_the_row_rate() {
    let api = Arc::new(
        MeshApi::default().answer(&outgoing("bookinfo"), vec![bookinfo("reviews", "ratings", "source", 5.0)]),
    );
    let mut options = options(GraphType::Workload, &["bookinfo"]);
    options.inject_service_nodes = true;

    let map = build(options, api).await.unwrap();

    assert_eq!(map.len(), 3);
    assert_eq!(map.edge_count(), 2);
    let service = map.get("svc_east_bookinfo_ratings").unwrap();
    assert_eq!(service.node_type, NodeType::Service);
    assert_eq!(service.metadata.rate(md::HTTP_IN), 5.0);
    assert_eq!(service.metadata.rate(md::HTTP_OUT), 5.0);
    assert_eq!(service.edges[0].dest, "wl_east_bookinfo_ratings-v1");
    let source = map.get("wl_east_bookinfo_reviews-v1").unwrap();
    assert_eq!(source.edges[0].dest, service.id);
    assert_eq!(source.edges[0].metadata.rate(md::HTTP), 5.0);
}

#[tokio::test]
async fn test_both_reporters_count_one_request() {
    let api = Arc::new(
        MeshApi::default()
            .answer(&serviced_incoming("bookinfo"), vec![bookinfo("productpage", "reviews", "destination", 4.0)])
            .answer(&outgoing("bookinfo"), vec![bookinfo("productpage", "reviews", "source", 4.0)]),
    );

    let map = build(options(GraphType::Workload, &["bookinfo"]), api).await.unwrap();

    assert_eq!(map.edge_count(), 1);
    let edge = &map.get("wl_east_bookinfo_productpage-v1").unwrap().edges[0];
    assert_eq!(edge.metadata.rate(md::HTTP), 4.0);
    let dest = map.get("wl_east_bookinfo_reviews-v1").unwrap();
    assert_eq!(dest.metadata.rate(md::HTTP_IN), 4.0);
}

#[tokio::test]
async fn test_ingress_rows_accumulate() {
    let ingress = |value: f64| {
        request(
            ("ingress-nginx", "ingress-nginx"),
            ("bookinfo", "productpage"),
            "destination",
            value,
            &[],
        )
    };
    let api = Arc::new(
        MeshApi::default().answer(&serviced_incoming("bookinfo"), vec![ingress(3.0), ingress(4.0)]),
    );

    let map = build(options(GraphType::Workload, &["bookinfo"]), api).await.unwrap();

    let gateway = map.get("wl_east_ingress-nginx_ingress-nginx-v1").unwrap();
    assert_eq!(gateway.edges[0].metadata.rate(md::HTTP), 7.0);
    assert!(gateway.metadata.flag(md::IS_OUTSIDE));
    assert!(gateway.metadata.flag(md::IS_ROOT));
}

#[tokio::test]
async fn test_namespaces_merge_without_double_counting() {
    let cross = |reporter: &str| request(("bookinfo", "reviews"), ("db", "mongodb"), reporter, 2.0, &[]);
    let backup = request(("db", "mongodb"), ("db", "backup"), "source", 1.0, &[]);
    let api = Arc::new(
        MeshApi::default()
            .answer(&outgoing("bookinfo"), vec![cross("source")])
            .answer(&serviced_incoming("db"), vec![cross("destination")])
            .answer(&outgoing("db"), vec![backup]),
    );

    let map = build(options(GraphType::Workload, &["bookinfo", "db"]), api).await.unwrap();

    assert_eq!(map.len(), 3);
    assert_eq!(map.edge_count(), 2);
    let reviews = map.get("wl_east_bookinfo_reviews-v1").unwrap();
    assert_eq!(reviews.edges.len(), 1);
    assert_eq!(reviews.edges[0].metadata.rate(md::HTTP), 2.0);
    let mongodb = map.get("wl_east_db_mongodb-v1").unwrap();
    assert_eq!(mongodb.metadata.rate(md::HTTP_IN), 2.0);
    assert_eq!(mongodb.edges[0].dest, "wl_east_db_backup-v1");
    assert!(map.nodes().all(|n| !n.metadata.flag(md::IS_OUTSIDE)));
}

#[tokio::test]
async fn test_namespace_failure_fails_the_build() {
    let api = Arc::new(
        MeshApi::default()
            .answer(&outgoing("bookinfo"), vec![bookinfo("productpage", "reviews", "source", 1.0)])
            .fail_on(r#"namespace="broken""#),
    );

    let err = build(options(GraphType::Workload, &["bookinfo", "broken"]), api)
        .await
        .unwrap_err();
    assert!(err.is_backend());
}

#[tokio::test]
async fn test_cancelled_build() {
    let engine = QueryEngine::new(Arc::new(MeshApi::default()));
    engine.cancellation_token().cancel();
    let global = AppenderGlobalInfo::with_engine(engine);

    let err = GraphAssembler::new(options(GraphType::Workload, &["bookinfo"]), global)
        .unwrap()
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Cancelled));
}

#[tokio::test]
async fn test_engine_created_once_across_namespaces() {
    let created = Arc::new(AtomicUsize::new(0));
    let api = Arc::new(MeshApi::default());
    let global = {
        let created = created.clone();
        AppenderGlobalInfo::new(move || {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(QueryEngine::new(api.clone()))
        })
    };

    let assembler = GraphAssembler::new(TelemetryOptions::new(GraphType::App, &["a", "b", "c"]), global).unwrap();
    let map = assembler.build().await.unwrap();

    assert!(map.is_empty());
    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_security_policy_through_pipeline() {
    let secured = request(
        ("bookinfo", "productpage"),
        ("bookinfo", "reviews"),
        "destination",
        4.0,
        &[
            (CONNECTION_SECURITY_POLICY, "mutual_tls"),
            (SOURCE_PRINCIPAL, "spiffe://cluster.local/ns/bookinfo/sa/productpage"),
            (DEST_PRINCIPAL, "spiffe://cluster.local/ns/bookinfo/sa/reviews"),
        ],
    );
    let api = Arc::new(
        MeshApi::default()
            .answer(&serviced_incoming("bookinfo"), vec![bookinfo("productpage", "reviews", "destination", 4.0)])
            .answer(
                r#"istio_requests_total{reporter="destination",source_workload_namespace="bookinfo"}"#,
                vec![secured],
            ),
    );
    let mut options = options(GraphType::Workload, &["bookinfo"]);
    options.appenders = RequestedAppenders::Named(vec!["securityPolicy".to_string()]);

    let map = build(options, api).await.unwrap();

    let edge = &map.get("wl_east_bookinfo_productpage-v1").unwrap().edges[0];
    assert_eq!(edge.metadata.rate(md::IS_MTLS), 100.0);
    assert_eq!(
        edge.metadata.get_str(md::SOURCE_PRINCIPAL),
        Some("spiffe://cluster.local/ns/bookinfo/sa/productpage")
    );
}

#[tokio::test]
async fn test_service_graph_collapses_workloads() {
    let api = Arc::new(MeshApi::default().answer(
        &outgoing("bookinfo"),
        vec![
            bookinfo("productpage", "reviews", "source", 3.0),
            bookinfo("reviews", "ratings", "source", 2.0),
        ],
    ));

    let map = build(options(GraphType::Service, &["bookinfo"]), api).await.unwrap();

    let mut ids = map.ids();
    ids.sort();
    assert_eq!(
        ids,
        vec![
            "svc_east_bookinfo_ratings",
            "svc_east_bookinfo_reviews",
            "wl_east_bookinfo_productpage-v1",
        ]
    );
    let reviews = map.get("svc_east_bookinfo_reviews").unwrap();
    assert_eq!(reviews.edges.len(), 1);
    assert_eq!(reviews.edges[0].dest, "svc_east_bookinfo_ratings");
    assert_eq!(reviews.edges[0].metadata.rate(md::HTTP), 2.0);
    assert!(map.get("svc_east_bookinfo_ratings").unwrap().edges.is_empty());
}

#[tokio::test]
async fn test_workload_node_graph() {
    let node = NodeOptions {
        namespace: "bookinfo".to_string(),
        workload: "reviews-v1".to_string(),
        ..Default::default()
    };
    let api = Arc::new(
        MeshApi::default()
            .answer(
                r#"istio_requests_total{reporter="destination",destination_workload_namespace="bookinfo",destination_workload="reviews-v1""#,
                vec![bookinfo("productpage", "reviews", "destination", 3.0)],
            )
            .answer(
                r#"istio_requests_total{reporter="source",source_workload_namespace="bookinfo",source_workload="reviews-v1""#,
                vec![bookinfo("reviews", "ratings", "source", 2.0)],
            ),
    );
    let mut options = TelemetryOptions::for_node(GraphType::Workload, node);
    options.appenders = RequestedAppenders::Named(vec![]);

    let map = build(options, api.clone()).await.unwrap();

    assert_eq!(map.len(), 3);
    assert_eq!(map.edge_count(), 2);
    let reviews = map.get("wl_east_bookinfo_reviews-v1").unwrap();
    assert_eq!(reviews.metadata.rate(md::HTTP_IN), 3.0);
    assert_eq!(reviews.metadata.rate(md::HTTP_OUT), 2.0);
    assert!(map.get("wl_east_bookinfo_productpage-v1").unwrap().metadata.flag(md::IS_ROOT));
    assert_eq!(api.queries_containing(r#"destination_workload="reviews-v1""#), 2);
}

fn replica(pod: &str, value: f64) -> Sample {
    request(("bookinfo", "productpage"), ("bookinfo", "reviews"), "source", value, &[(POD, pod)])
}

fn two_replicas() -> Arc<ReplicaApi> {
    Arc::new(ReplicaApi::default().series(
        &outgoing("bookinfo"),
        vec![replica("productpage-v1-5d8f9c", 3.0), replica("productpage-v1-8c2e1a", 2.0)],
    ))
}

#[tokio::test]
async fn test_replicas_sum_into_one_workload_edge() {
    let map = build(options(GraphType::Workload, &["bookinfo"]), two_replicas()).await.unwrap();

    assert_eq!(map.edge_count(), 1);
    let source = map.get("wl_east_bookinfo_productpage-v1").unwrap();
    assert_eq!(source.edges[0].dest, "wl_east_bookinfo_reviews-v1");
    assert_eq!(source.edges[0].metadata.rate(md::HTTP), 5.0);
    assert_eq!(source.metadata.rate(md::HTTP_OUT), 5.0);
    assert_eq!(map.get("wl_east_bookinfo_reviews-v1").unwrap().metadata.rate(md::HTTP_IN), 5.0);
}

#[tokio::test]
async fn test_replicas_sum_through_injected_service() {
    let mut options = options(GraphType::App, &["bookinfo"]);
    options.inject_service_nodes = true;

    let map = build(options, two_replicas()).await.unwrap();

    let service = map.get("svc_east_bookinfo_reviews").unwrap();
    assert_eq!(service.metadata.rate(md::HTTP_IN), 5.0);
    assert_eq!(service.edges[0].metadata.rate(md::HTTP), 5.0);
}

#[tokio::test]
async fn test_pod_graph_keeps_a_node_per_replica() {
    let map = build(options(GraphType::Pod, &["bookinfo"]), two_replicas()).await.unwrap();

    let first = map.get("pod_east_bookinfo_productpage-v1-5d8f9c").unwrap();
    assert_eq!(first.edges[0].dest, "svc_east_bookinfo_reviews");
    assert_eq!(first.edges[0].metadata.rate(md::HTTP), 3.0);
    let second = map.get("pod_east_bookinfo_productpage-v1-8c2e1a").unwrap();
    assert_eq!(second.edges[0].metadata.rate(md::HTTP), 2.0);
    assert_eq!(map.get("svc_east_bookinfo_reviews").unwrap().metadata.rate(md::HTTP_IN), 5.0);
}

#[tokio::test]
async fn test_ingress_rows_accumulate_on_injected_hops() {
    let ingress = |value: f64| {
        request(
            ("ingress-nginx", "ingress-nginx"),
            ("bookinfo", "productpage"),
            "destination",
            value,
            &[],
        )
    };
    let api = Arc::new(
        MeshApi::default().answer(&serviced_incoming("bookinfo"), vec![ingress(2.0), ingress(2.0)]),
    );
    let mut options = options(GraphType::Workload, &["bookinfo"]);
    options.inject_service_nodes = true;

    let map = build(options, api).await.unwrap();

    let gateway = map.get("wl_east_ingress-nginx_ingress-nginx-v1").unwrap();
    assert_eq!(gateway.edges[0].dest, "svc_east_bookinfo_productpage");
    assert_eq!(gateway.edges[0].metadata.rate(md::HTTP), 4.0);
    let service = map.get("svc_east_bookinfo_productpage").unwrap();
    assert_eq!(service.edges[0].dest, "wl_east_bookinfo_productpage-v1");
    assert_eq!(service.edges[0].metadata.rate(md::HTTP), 4.0);
    assert_eq!(map.get("wl_east_bookinfo_productpage-v1").unwrap().metadata.rate(md::HTTP_IN), 4.0);
}

fn sample_rows() -> Vec<Sample> {
    vec![
        bookinfo("productpage", "reviews", "source", 3.0),
        bookinfo("productpage", "reviews", "destination", 3.0),
        bookinfo("reviews", "ratings", "source", 2.0),
        request(("bookinfo", "reviews"), ("bookinfo", "ratings"), "source", 1.0, &[(RESPONSE_CODE, "503")]),
        request(("bookinfo", "reviews"), ("bookinfo", "details"), "source", 0.5, &[(RESPONSE_CODE, "0")]),
        request(
            ("ingress-nginx", "ingress-nginx"),
            ("bookinfo", "productpage"),
            "destination",
            4.0,
            &[],
        ),
        request(
            ("ingress-nginx", "ingress-nginx"),
            ("bookinfo", "productpage"),
            "destination",
            4.0,
            &[],
        ),
    ]
}

fn render(options: &TelemetryOptions, rows: &[Sample]) -> String {
    let mut builder = TrafficMapBuilder::new(options);
    builder.populate(rows, &REQUESTS).unwrap();
    GraphOutput::from(&builder.build()).to_json().unwrap()
}

proptest! {
    #[test]
    fn prop_row_order_does_not_change_the_graph(rows in Just(sample_rows()).prop_shuffle()) {
        let mut options = TelemetryOptions::new(GraphType::Workload, &["bookinfo"]);
        options.inject_service_nodes = true;
        prop_assert_eq!(render(&options, &rows), render(&options, &sample_rows()));
    }

    #[test]
    fn prop_repeating_a_pass_is_idempotent(repeats in 1usize..4) {
        let options = TelemetryOptions::new(GraphType::Workload, &["bookinfo"]);
        let rows: Vec<Sample> = vec![bookinfo("productpage", "reviews", "source", 3.0)];
        let mut builder = TrafficMapBuilder::new(&options);
        for _ in 0..repeats {
            builder.populate(&rows, &REQUESTS).unwrap();
        }
        let map = builder.build();
        let edge = &map.get("wl_east_bookinfo_productpage-v1").unwrap().edges[0];
        prop_assert_eq!(edge.metadata.rate(md::HTTP), 3.0);
    }

    #[test]
    fn prop_mtls_percentage_is_bounded(
        mtls in 0.0f64..1000.0,
        others in proptest::collection::hash_map("[a-z]{1,12}", 0.0f64..1000.0, 0..6)
    ) {
        let mut rates = others;
        rates.insert("mutual_tls".to_string(), mtls);
        match mtls_percentage(&rates) {
            Some(pct) => prop_assert!((0.0..=100.0).contains(&pct)),
            None => prop_assert_eq!(mtls, 0.0),
        }
    }
}
