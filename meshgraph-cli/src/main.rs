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

//! Meshgraph CLI
//!
//! Builds a traffic graph from Istio telemetry and prints it as JSON.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use meshgraph_core::{GraphOutput, GraphType, MeshGraphConfig, NodeOptions, TelemetryOptions};
use meshgraph_query::{PrometheusClient, QueryEngine};
use meshgraph_telemetry::{init_logging, AppenderGlobalInfo, GraphAssembler};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "meshgraph")]
#[command(author, version, about = "Service mesh traffic graphs from Istio telemetry", long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long, env = "MESHGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Prometheus base URL (overrides config file)
    #[arg(long)]
    prometheus_url: Option<String>,

    /// Pretty print the graph
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Graph of one or more namespaces
    Graph {
        /// Comma separated namespaces, merged in the given order
        #[arg(short, long, value_delimiter = ',', required = true)]
        namespaces: Vec<String>,

        #[command(flatten)]
        common: GraphArgs,
    },

    /// Graph of the traffic into and out of a single node
    Node {
        /// Namespace of the node
        #[arg(short, long)]
        namespace: String,

        #[arg(long)]
        workload: Option<String>,

        #[arg(long)]
        app: Option<String>,

        /// Version of the app node
        #[arg(long)]
        version: Option<String>,

        #[arg(long)]
        service: Option<String>,

        #[arg(long)]
        cluster: Option<String>,

        /// Aggregate label, e.g. `request_operation`
        #[arg(long, requires = "aggregate_value")]
        aggregate: Option<String>,

        #[arg(long)]
        aggregate_value: Option<String>,

        #[command(flatten)]
        common: GraphArgs,
    },
}

/// Overrides for the configured graph defaults
#[derive(Args, Debug)]
struct GraphArgs {
    /// app, versionedApp, workload, service or pod
    #[arg(short = 't', long)]
    graph_type: Option<String>,

    /// Rate window in seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// `all`, or a comma separated list of appenders
    #[arg(long)]
    appenders: Option<String>,

    #[arg(long)]
    inject_service_nodes: bool,

    #[arg(long)]
    include_idle_edges: bool,

    /// Namespaces the caller may inspect, all when omitted
    #[arg(long, value_delimiter = ',')]
    accessible: Vec<String>,
}

impl GraphArgs {
    fn apply(&self, options: &mut TelemetryOptions) -> Result<()> {
        if let Some(graph_type) = &self.graph_type {
            options.graph_type = graph_type.parse::<GraphType>()?;
        }
        if let Some(secs) = self.duration {
            *options = options.clone().with_duration(Duration::from_secs(secs));
        }
        if let Some(appenders) = &self.appenders {
            options.appenders = appenders.parse()?;
        }
        options.inject_service_nodes |= self.inject_service_nodes;
        options.include_idle_edges |= self.include_idle_edges;
        if !self.accessible.is_empty() {
            options.accessible_namespaces = Some(self.accessible.iter().cloned().collect::<HashSet<_>>());
        }
        Ok(())
    }
}

fn telemetry_options(config: &MeshGraphConfig, command: &Commands) -> Result<TelemetryOptions> {
    match command {
        Commands::Graph { namespaces, common } => {
            let mut options = config.telemetry_options(namespaces)?;
            common.apply(&mut options)?;
            Ok(options)
        }
        Commands::Node {
            namespace,
            workload,
            app,
            version,
            service,
            cluster,
            aggregate,
            aggregate_value,
            common,
        } => {
            let mut options = config.telemetry_options(std::slice::from_ref(namespace))?;
            options.node = Some(NodeOptions {
                aggregate: aggregate.clone().unwrap_or_default(),
                aggregate_value: aggregate_value.clone().unwrap_or_default(),
                app: app.clone().unwrap_or_default(),
                cluster: cluster.clone().unwrap_or_default(),
                namespace: namespace.clone(),
                service: service.clone().unwrap_or_default(),
                version: version.clone().unwrap_or_default(),
                workload: workload.clone().unwrap_or_default(),
            });
            common.apply(&mut options)?;
            Ok(options)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MeshGraphConfig::load(cli.config.clone())?;
    if let Some(url) = &cli.prometheus_url {
        config.prometheus.url = url.clone();
    }
    init_logging(&config.logging)?;

    let options = telemetry_options(&config, &cli.command)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling graph build");
                cancel.cancel();
            }
        });
    }

    let prometheus = config.prometheus.clone();
    let global = AppenderGlobalInfo::new(move || {
        let client = PrometheusClient::from_config(&prometheus)?;
        Ok(QueryEngine::new(Arc::new(client))
            .with_timeout(prometheus.query_timeout())
            .with_round_epsilon(prometheus.round_epsilon)
            .with_cancellation(cancel.clone()))
    });

    info!(prometheus = %config.prometheus.url, "Building graph");
    let assembler = GraphAssembler::new(options, global)?;
    let map = assembler.build().await.context("Failed to build graph")?;

    let output = GraphOutput::from(&map);
    let json = if cli.pretty {
        output.to_json_pretty()?
    } else {
        output.to_json()?
    };
    println!("{json}");
    Ok(())
}
