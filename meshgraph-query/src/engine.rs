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

//! Cancellable, time-bounded query execution

use crate::client::{MetricsApi, QueryValue, Sample};
use crate::metrics::query_timer;
use chrono::{DateTime, Utc};
use meshgraph_core::{GraphError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ROUND_EPSILON: f64 = 0.001;

/// Runs instant-vector queries against a [`MetricsApi`]
#[derive(Clone)]
pub struct QueryEngine {
    api: Arc<dyn MetricsApi>,
    timeout: Duration,
    round_epsilon: f64,
    cancel: CancellationToken,
}

impl QueryEngine {
    pub fn new(api: Arc<dyn MetricsApi>) -> Self {
        Self {
            api,
            timeout: DEFAULT_QUERY_TIMEOUT,
            round_epsilon: DEFAULT_ROUND_EPSILON,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_round_epsilon(mut self, epsilon: f64) -> Self {
        self.round_epsilon = epsilon;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `query` at `time` and return its samples. An empty query yields an
    /// empty vector without contacting the backend.
    pub async fn query_vector(&self, query: &str, time: DateTime<Utc>) -> Result<Vec<Sample>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        if self.cancel.is_cancelled() {
            return Err(GraphError::Cancelled);
        }

        let query = format!("round({},{})", query, self.round_epsilon);
        trace!(query = %query, time = %time.to_rfc3339(), "Graph query");

        let timer = query_timer("graph");
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(GraphError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.api.query(&query, time)) => {
                match result {
                    Err(_) => Err(GraphError::Timeout(self.timeout)),
                    Ok(response) => response.map_err(GraphError::from),
                }
            }
        };
        // only successful queries are timed
        let response = match outcome {
            Ok(response) => {
                timer.observe_duration();
                response
            }
            Err(e) => {
                timer.stop_and_discard();
                return Err(e);
            }
        };
        if !response.warnings.is_empty() {
            warn!("Prometheus warnings: [{}]", response.warnings.join(","));
        }

        match response.value {
            QueryValue::Vector(samples) => Ok(samples),
            other => Err(GraphError::BackendUnavailable(format!(
                "no handling for result type [{}]",
                other.type_name()
            ))),
        }
    }
}
