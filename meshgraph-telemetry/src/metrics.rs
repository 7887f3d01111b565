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

//! Graph generation diagnostics

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, HistogramTimer, HistogramVec};

lazy_static! {
    /// Time spent in each appender
    pub static ref APPENDER_DURATION: HistogramVec = register_histogram_vec!(
        "meshgraph_appender_duration_seconds",
        "Duration of graph appender runs",
        &["appender"]
    )
    .expect("appender duration histogram registers once");
}

pub fn appender_timer(appender: &str) -> HistogramTimer {
    APPENDER_DURATION.with_label_values(&[appender]).start_timer()
}
