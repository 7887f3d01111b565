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

//! File and environment configuration

use crate::error::{GraphError, Result};
use crate::graph::GraphType;
use crate::options::{
    IngressConfig, NamespaceInfo, RequestedAppenders, RequestedRates, ResponseTimeQuantile,
    TelemetryOptions, ThroughputType,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Meshgraph configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MeshGraphConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub graph: GraphDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrometheusConfig {
    /// Base URL of the Prometheus HTTP API
    #[serde(default = "default_prometheus_url")]
    pub url: String,

    /// Per query timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Precision results are rounded to
    #[serde(default = "default_round_epsilon")]
    pub round_epsilon: f64,

    pub bearer_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: default_prometheus_url(),
            query_timeout_secs: default_query_timeout(),
            round_epsilon: default_round_epsilon(),
            bearer_token: None,
            username: None,
            password: None,
        }
    }
}

impl PrometheusConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Defaults applied to graph requests
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphDefaults {
    #[serde(default = "default_graph_type")]
    pub graph_type: GraphType,

    /// Rate window in seconds
    #[serde(default = "default_duration")]
    pub duration_secs: u64,

    #[serde(default)]
    pub include_idle_edges: bool,

    #[serde(default)]
    pub inject_service_nodes: bool,

    /// `all` or a comma separated list
    #[serde(default = "default_appenders")]
    pub appenders: String,

    #[serde(default)]
    pub rates: RequestedRates,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub response_time: ResponseTimeQuantile,

    #[serde(default)]
    pub throughput: ThroughputType,
}

impl Default for GraphDefaults {
    fn default() -> Self {
        Self {
            graph_type: default_graph_type(),
            duration_secs: default_duration(),
            include_idle_edges: false,
            inject_service_nodes: false,
            appenders: default_appenders(),
            rates: RequestedRates::default(),
            ingress: IngressConfig::default(),
            response_time: ResponseTimeQuantile::default(),
            throughput: ThroughputType::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_prometheus_url() -> String {
    "http://localhost:9090".to_string()
}

fn default_query_timeout() -> u64 {
    30
}

fn default_round_epsilon() -> f64 {
    0.001
}

fn default_graph_type() -> GraphType {
    GraphType::VersionedApp
}

fn default_duration() -> u64 {
    600
}

fn default_appenders() -> String {
    "all".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl MeshGraphConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - MESHGRAPH_PROMETHEUS_URL: Prometheus base URL (default: http://localhost:9090)
    /// - MESHGRAPH_QUERY_TIMEOUT: Query timeout in seconds (default: 30)
    /// - MESHGRAPH_LOG_JSON: Emit JSON logs (default: false)
    pub fn from_env() -> Self {
        Self::default().merge_with_env()
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?.merge_with_env()
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::from_env()
            }
            None => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    fn merge_with_env(mut self) -> Self {
        if let Ok(url) = std::env::var("MESHGRAPH_PROMETHEUS_URL") {
            self.prometheus.url = url;
        }

        if let Ok(timeout) = std::env::var("MESHGRAPH_QUERY_TIMEOUT") {
            if let Ok(val) = timeout.parse() {
                self.prometheus.query_timeout_secs = val;
            }
        }

        if let Ok(json) = std::env::var("MESHGRAPH_LOG_JSON") {
            self.logging.json = json.parse().unwrap_or(false);
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.prometheus.url.is_empty() {
            return Err(GraphError::Config("prometheus url must be set".to_string()));
        }
        if self.prometheus.query_timeout_secs == 0 {
            return Err(GraphError::Config(
                "query timeout must be positive".to_string(),
            ));
        }
        if self.prometheus.round_epsilon.is_nan() || self.prometheus.round_epsilon <= 0.0 {
            return Err(GraphError::Config(
                "round epsilon must be positive".to_string(),
            ));
        }
        self.graph.rates.validate()?;
        Ok(())
    }

    /// Telemetry options for namespaces, seeded from the configured defaults
    pub fn telemetry_options(&self, namespaces: &[String]) -> Result<TelemetryOptions> {
        let duration = Duration::from_secs(self.graph.duration_secs);
        Ok(TelemetryOptions {
            graph_type: self.graph.graph_type,
            namespaces: namespaces
                .iter()
                .map(|ns| NamespaceInfo::new(ns.clone(), duration))
                .collect(),
            accessible_namespaces: None,
            duration,
            query_time: Utc::now(),
            rates: self.graph.rates,
            include_idle_edges: self.graph.include_idle_edges,
            inject_service_nodes: self.graph.inject_service_nodes,
            appenders: self.graph.appenders.parse::<RequestedAppenders>()?,
            node: None,
            ingress: self.graph.ingress.clone(),
            response_time_quantile: self.graph.response_time,
            throughput_type: self.graph.throughput,
        })
    }
}
