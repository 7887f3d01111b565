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

//! Backend query diagnostics

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, HistogramVec};

lazy_static! {
    /// Time spent in successful backend queries, by query origin
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "meshgraph_prometheus_query_duration_seconds",
        "Duration of successful metrics backend queries",
        &["query_group"]
    )
    .expect("query duration histogram registers once");
}

/// Start timing a query issued on behalf of `group`
pub fn query_timer(group: &str) -> prometheus::HistogramTimer {
    QUERY_DURATION.with_label_values(&[group]).start_timer()
}
