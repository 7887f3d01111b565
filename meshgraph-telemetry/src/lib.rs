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

//! # Meshgraph telemetry
//!
//! Builds service mesh traffic graphs from Istio metrics.
//!
//! A request is described by [`TelemetryOptions`]. The [`GraphAssembler`]
//! queries each requested namespace, accumulates the rows into a
//! [`TrafficMap`] with the [`TrafficMapBuilder`], runs the appender pipeline
//! and merges the namespace maps into one graph.
//!
//! ```rust,ignore
//! use meshgraph_telemetry::{AppenderGlobalInfo, GraphAssembler};
//!
//! let global = AppenderGlobalInfo::with_engine(engine);
//! let assembler = GraphAssembler::new(options, global)?;
//! let graph = assembler.build().await?;
//! ```

use meshgraph_core::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod appender;
pub mod assembler;
pub mod global;
pub mod metrics;
pub mod traffic;
pub mod util;

pub use appender::{
    parse_appenders, run_pipeline, Appender, AppenderGlobalInfo, AppenderNamespaceInfo,
    EngineFactory,
};
pub use assembler::GraphAssembler;
pub use global::{
    mark_outside_or_inaccessible, mark_traffic_generators, merge_traffic_maps,
    reduce_to_service_graph,
};
pub use meshgraph_core::{TelemetryOptions, TrafficMap};
pub use traffic::TrafficMapBuilder;

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over
/// the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(config.json.then(|| fmt::layer().json().with_target(true)))
        .with((!config.json).then(|| fmt::layer()))
        .try_init()?;
    Ok(())
}
