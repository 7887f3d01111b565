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

//! Error types shared by every meshgraph crate

use thiserror::Error;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors that can abort a graph build
#[derive(Debug, Error)]
pub enum GraphError {
    /// The label tuple does not carry enough information to name a node
    #[error(
        "Failed to resolve node identity: cluster=[{cluster}] namespace=[{namespace}] \
         workload=[{workload}] app=[{app}] version=[{version}] service=[{service}] graphType=[{graph_type}]"
    )]
    IdentityResolution {
        cluster: String,
        namespace: String,
        workload: String,
        app: String,
        version: String,
        service: String,
        graph_type: String,
    },

    /// Node graphs can only be built around workload, app and service nodes
    #[error("NodeType [{0}] not supported")]
    UnsupportedNodeType(String),

    /// The metrics backend failed or returned something unusable
    #[error("Metrics backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A backend query ran past its deadline
    #[error("Metrics query timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The enclosing request was cancelled
    #[error("Graph request cancelled")]
    Cancelled,

    /// A request option is invalid
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for GraphError {
    fn from(e: serde_json::Error) -> Self {
        GraphError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for GraphError {
    fn from(e: toml::de::Error) -> Self {
        GraphError::Config(e.to_string())
    }
}

impl GraphError {
    /// Whether the error came from the metrics backend rather than the request itself
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            GraphError::BackendUnavailable(_) | GraphError::Timeout(_)
        )
    }
}
