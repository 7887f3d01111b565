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

//! Node and edge metadata
//!
//! Metadata is an open string-keyed map of JSON values. The key constants below
//! are the ones the engine itself reads and writes.

use crate::graph::ServiceName;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const PROTOCOL: &str = "protocol";

pub const HTTP: &str = "http";
pub const HTTP_3XX: &str = "http3xx";
pub const HTTP_4XX: &str = "http4xx";
pub const HTTP_5XX: &str = "http5xx";
pub const HTTP_NO_RESPONSE: &str = "httpNoResponse";
pub const HTTP_IN: &str = "httpIn";
pub const HTTP_IN_3XX: &str = "httpIn3xx";
pub const HTTP_IN_4XX: &str = "httpIn4xx";
pub const HTTP_IN_5XX: &str = "httpIn5xx";
pub const HTTP_IN_NO_RESPONSE: &str = "httpInNoResponse";
pub const HTTP_OUT: &str = "httpOut";

pub const GRPC: &str = "grpc";
pub const GRPC_ERR: &str = "grpcErr";
pub const GRPC_NO_RESPONSE: &str = "grpcNoResponse";
pub const GRPC_IN: &str = "grpcIn";
pub const GRPC_IN_ERR: &str = "grpcInErr";
pub const GRPC_IN_NO_RESPONSE: &str = "grpcInNoResponse";
pub const GRPC_OUT: &str = "grpcOut";

pub const TCP: &str = "tcp";
pub const TCP_IN: &str = "tcpIn";
pub const TCP_OUT: &str = "tcpOut";

/// Per response code detail: `{code: {flags: {flag: rate}, hosts: {host: rate}}}`
pub const RESPONSES: &str = "responses";
pub const DEST_SERVICES: &str = "destServices";
pub const IS_MTLS: &str = "isMTLS";
pub const SOURCE_PRINCIPAL: &str = "sourcePrincipal";
pub const DEST_PRINCIPAL: &str = "destPrincipal";
pub const RESPONSE_TIME: &str = "responseTime";
pub const THROUGHPUT: &str = "throughput";

pub const IS_OUTSIDE: &str = "isOutside";
pub const IS_INACCESSIBLE: &str = "isInaccessible";
pub const IS_ROOT: &str = "isRoot";
pub const IS_EGRESS_CLUSTER: &str = "isEgressCluster";
pub const AGGREGATE: &str = "aggregate";
pub const AGGREGATE_VALUE: &str = "aggregateValue";

const FLAGS: &str = "flags";
const HOSTS: &str = "hosts";

/// String-keyed JSON annotations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) -> Option<Value> {
        self.0.insert(key.to_string(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Numeric value of `key`, zero when absent
    pub fn rate(&self, key: &str) -> f64 {
        self.0.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    pub fn add_rate(&mut self, key: &str, value: f64) {
        let total = self.rate(key) + value;
        self.0.insert(key.to_string(), number(total));
    }

    pub fn set_rate(&mut self, key: &str, value: f64) {
        self.0.insert(key.to_string(), number(value));
    }

    pub fn set_flag(&mut self, key: &str) {
        self.0.insert(key.to_string(), Value::Bool(true));
    }

    pub fn flag(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Add `value` under `responses[code].flags[flags]` and, when set,
    /// `responses[code].hosts[host]`.
    pub fn add_response(&mut self, code: &str, flags: &str, host: &str, value: f64) {
        let responses = self.object_entry(RESPONSES);
        let detail = object_child(responses, code);
        add_to_object(object_child(detail, FLAGS), flags, value);
        if !host.is_empty() {
            add_to_object(object_child(detail, HOSTS), host, value);
        }
    }

    /// Add `value` under `responses[code].hosts[host]` only
    pub fn add_response_host(&mut self, code: &str, host: &str, value: f64) {
        let responses = self.object_entry(RESPONSES);
        let detail = object_child(responses, code);
        add_to_object(object_child(detail, HOSTS), host, value);
    }

    /// Rate recorded for one response code and flags combination
    pub fn response_rate(&self, code: &str, flags: &str) -> f64 {
        self.0
            .get(RESPONSES)
            .and_then(|r| r.get(code))
            .and_then(|d| d.get(FLAGS))
            .and_then(|f| f.get(flags))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    /// Record `service` in the `destServices` set
    pub fn add_dest_service(&mut self, service: &ServiceName) {
        let set = self.object_entry(DEST_SERVICES);
        let key = service.key();
        if !set.contains_key(&key) {
            if let Ok(value) = serde_json::to_value(service) {
                set.insert(key, value);
            }
        }
    }

    pub fn dest_services(&self) -> Vec<ServiceName> {
        self.0
            .get(DEST_SERVICES)
            .and_then(Value::as_object)
            .map(|set| {
                set.values()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn object_entry(&mut self, key: &str) -> &mut Map<String, Value> {
        let entry = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        ensure_object(entry)
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}

fn object_child<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    ensure_object(entry)
}

fn add_to_object(map: &mut Map<String, Value>, key: &str, value: f64) {
    let total = map.get(key).and_then(Value::as_f64).unwrap_or(0.0) + value;
    map.insert(key.to_string(), number(total));
}
