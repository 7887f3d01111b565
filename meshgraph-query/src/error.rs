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

use meshgraph_core::GraphError;
use std::time::Duration;
use thiserror::Error;

/// Errors from the metrics backend
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Prometheus error [{error_type}]: {error}")]
    Api { error_type: String, error: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Query cancelled")]
    Cancelled,
}

impl From<QueryError> for GraphError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Timeout(d) => GraphError::Timeout(d),
            QueryError::Cancelled => GraphError::Cancelled,
            other => GraphError::BackendUnavailable(other.to_string()),
        }
    }
}
