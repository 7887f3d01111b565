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

//! Meshgraph Query
//!
//! Metrics backend access for graph builds: the [`MetricsApi`] seam, a
//! Prometheus HTTP implementation, PromQL construction and the
//! [`QueryEngine`] that runs queries under a deadline and a cancellation token.

pub mod client;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod promql;

pub use client::{MetricsApi, PrometheusClient, QueryResponse, QueryValue, Sample};
pub use engine::{QueryEngine, DEFAULT_QUERY_TIMEOUT, DEFAULT_ROUND_EPSILON};
pub use error::QueryError;
pub use promql::{MetricFamily, NodeQueries, TrafficMetric};
