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

//! Meshgraph Core
//!
//! Traffic graph data model, node identity resolution and request options
//! shared by the query and telemetry crates.

pub mod config;
pub mod error;
pub mod graph;
pub mod identity;
pub mod metadata;
pub mod options;
pub mod output;
pub mod protocol;

pub use config::{GraphDefaults, LoggingConfig, MeshGraphConfig, PrometheusConfig};
pub use error::{GraphError, Result};
pub use graph::{
    Edge, GraphType, Node, NodeType, ServiceName, TrafficMap, BLACK_HOLE_CLUSTER,
    PASSTHROUGH_CLUSTER, UNKNOWN,
};
pub use identity::{aggregate_id, is_ok, is_ok_version, IdentityResolver, NodeId, NodeLabels};
pub use metadata::Metadata;
pub use options::{
    IngressConfig, NamespaceInfo, NodeOptions, Rate, RequestedAppenders, RequestedRates,
    ResponseTimeQuantile, TelemetryOptions, ThroughputType,
};
pub use output::{EdgeOutput, GraphOutput, NodeOutput};
pub use protocol::{Protocol, Traffic};
