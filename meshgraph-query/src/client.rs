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

//! Metrics backend client

use crate::error::QueryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshgraph_core::PrometheusConfig;
use serde::Deserialize;
use std::collections::BTreeMap;

/// One instant-vector element
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Sample {
    pub fn new<I, K, V>(labels: I, value: f64) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            value,
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// Result of an instant query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Vector(Vec<Sample>),
    Scalar(f64),
    Matrix,
    String(String),
}

impl QueryValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            QueryValue::Vector(_) => "vector",
            QueryValue::Scalar(_) => "scalar",
            QueryValue::Matrix => "matrix",
            QueryValue::String(_) => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub value: QueryValue,
    pub warnings: Vec<String>,
}

impl QueryResponse {
    pub fn vector(samples: Vec<Sample>) -> Self {
        Self {
            value: QueryValue::Vector(samples),
            warnings: Vec::new(),
        }
    }
}

/// Instant query access to a metrics backend
#[async_trait]
pub trait MetricsApi: Send + Sync {
    async fn query(&self, query: &str, time: DateTime<Utc>) -> Result<QueryResponse, QueryError>;
}

/// Prometheus HTTP API client
pub struct PrometheusClient {
    base_url: String,
    bearer_token: Option<String>,
    basic_auth: Option<(String, String)>,
    client: reqwest::Client,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, QueryError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            basic_auth: None,
            client: reqwest::Client::builder().build()?,
        })
    }

    pub fn from_config(config: &PrometheusConfig) -> Result<Self, QueryError> {
        let mut client = Self::new(config.url.clone())?;
        if let Some(token) = &config.bearer_token {
            client = client.with_bearer_token(token.clone());
        }
        if let Some(username) = &config.username {
            client.basic_auth = Some((
                username.clone(),
                config.password.clone().unwrap_or_default(),
            ));
        }
        Ok(client)
    }

    pub fn with_bearer_token(mut self, token: String) -> Self {
        self.bearer_token = Some(token);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    data: Option<ApiData>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum ApiData {
    Vector(Vec<ApiSample>),
    Scalar((f64, String)),
    Matrix(serde_json::Value),
    String((f64, String)),
}

#[derive(Debug, Deserialize)]
struct ApiSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

fn parse_value(raw: &str) -> Result<f64, QueryError> {
    raw.parse::<f64>()
        .map_err(|_| QueryError::InvalidResponse(format!("sample value [{raw}] is not a number")))
}

fn decode_response(body: ApiResponse) -> Result<QueryResponse, QueryError> {
    if body.status != "success" {
        return Err(QueryError::Api {
            error_type: body.error_type.unwrap_or_else(|| "unknown".to_string()),
            error: body.error.unwrap_or_default(),
        });
    }
    let data = body
        .data
        .ok_or_else(|| QueryError::InvalidResponse("missing data".to_string()))?;

    let value = match data {
        ApiData::Vector(samples) => QueryValue::Vector(
            samples
                .into_iter()
                .map(|s| {
                    Ok(Sample {
                        labels: s.metric,
                        value: parse_value(&s.value.1)?,
                    })
                })
                .collect::<Result<Vec<_>, QueryError>>()?,
        ),
        ApiData::Scalar((_, v)) => QueryValue::Scalar(parse_value(&v)?),
        ApiData::Matrix(_) => QueryValue::Matrix,
        ApiData::String((_, v)) => QueryValue::String(v),
    };

    Ok(QueryResponse {
        value,
        warnings: body.warnings,
    })
}

#[async_trait]
impl MetricsApi for PrometheusClient {
    async fn query(&self, query: &str, time: DateTime<Utc>) -> Result<QueryResponse, QueryError> {
        let timestamp = time.timestamp().to_string();
        let mut request = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", query), ("time", timestamp.as_str())]);

        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        } else if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        // Prometheus reports query errors as JSON bodies on 4xx/5xx
        match serde_json::from_str::<ApiResponse>(&text) {
            Ok(body) => decode_response(body),
            Err(_) if !status.is_success() => Err(QueryError::Api {
                error_type: status.to_string(),
                error: text,
            }),
            Err(e) => Err(QueryError::Json(e)),
        }
    }
}
