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

//! Protocol rate accounting
//!
//! Every applied sample adds its value to the edge that carried it, to the
//! source node's outgoing total and to the destination node's incoming rates.

use crate::error::{GraphError, Result};
use crate::metadata::{self as md, Metadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Response code value for a request that got no response
pub const NO_RESPONSE: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Grpc,
    Tcp,
}

struct ProtocolKeys {
    edge: &'static str,
    incoming: &'static str,
    outgoing: &'static str,
    /// Edge rate keys that partition `edge`
    edge_classes: &'static [&'static str],
    incoming_classes: &'static [&'static str],
}

const HTTP_KEYS: ProtocolKeys = ProtocolKeys {
    edge: md::HTTP,
    incoming: md::HTTP_IN,
    outgoing: md::HTTP_OUT,
    edge_classes: &[md::HTTP_3XX, md::HTTP_4XX, md::HTTP_5XX, md::HTTP_NO_RESPONSE],
    incoming_classes: &[
        md::HTTP_IN_3XX,
        md::HTTP_IN_4XX,
        md::HTTP_IN_5XX,
        md::HTTP_IN_NO_RESPONSE,
    ],
};

const GRPC_KEYS: ProtocolKeys = ProtocolKeys {
    edge: md::GRPC,
    incoming: md::GRPC_IN,
    outgoing: md::GRPC_OUT,
    edge_classes: &[md::GRPC_ERR, md::GRPC_NO_RESPONSE],
    incoming_classes: &[md::GRPC_IN_ERR, md::GRPC_IN_NO_RESPONSE],
};

const TCP_KEYS: ProtocolKeys = ProtocolKeys {
    edge: md::TCP,
    incoming: md::TCP_IN,
    outgoing: md::TCP_OUT,
    edge_classes: &[],
    incoming_classes: &[],
};

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Grpc, Protocol::Http, Protocol::Tcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Grpc => "grpc",
            Protocol::Tcp => "tcp",
        }
    }

    fn keys(&self) -> &'static ProtocolKeys {
        match self {
            Protocol::Http => &HTTP_KEYS,
            Protocol::Grpc => &GRPC_KEYS,
            Protocol::Tcp => &TCP_KEYS,
        }
    }

    /// Edge key holding the total rate
    pub fn edge_rate_key(&self) -> &'static str {
        self.keys().edge
    }

    /// Node key holding the total outgoing rate
    pub fn outgoing_rate_key(&self) -> &'static str {
        self.keys().outgoing
    }

    /// Node key holding the total incoming rate
    pub fn incoming_rate_key(&self) -> &'static str {
        self.keys().incoming
    }

    /// Index into the class keys for a response code, if the code is
    /// not a plain success
    fn class_index(&self, code: &str) -> Option<usize> {
        match self {
            Protocol::Http => {
                if code == NO_RESPONSE {
                    return Some(3);
                }
                match code.as_bytes().first() {
                    Some(b'3') => Some(0),
                    Some(b'4') => Some(1),
                    Some(b'5') => Some(2),
                    _ => None,
                }
            }
            Protocol::Grpc => match code {
                NO_RESPONSE => Some(1),
                "0" | "" => None,
                _ => Some(0),
            },
            Protocol::Tcp => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Protocol::Http),
            "grpc" => Ok(Protocol::Grpc),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(GraphError::InvalidOption(format!("unknown protocol [{other}]"))),
        }
    }
}

/// Rates carried by a single sample
#[derive(Debug, Clone, Copy)]
pub struct Traffic<'a> {
    pub protocol: Protocol,
    pub value: f64,
    pub code: &'a str,
    pub flags: &'a str,
    pub host: &'a str,
}

/// Add a sample to an edge
pub fn add_edge_rates(edge: &mut Metadata, sample: &Traffic<'_>) {
    let keys = sample.protocol.keys();
    edge.add_rate(keys.edge, sample.value);
    if let Some(idx) = sample.protocol.class_index(sample.code) {
        edge.add_rate(keys.edge_classes[idx], sample.value);
    }
    // message counts carry no response code
    if !sample.code.is_empty() {
        edge.add_response(sample.code, sample.flags, sample.host, sample.value);
    }
}

/// Add a sample to the node it was sent from
pub fn add_outgoing_rates(source: &mut Metadata, sample: &Traffic<'_>) {
    source.add_rate(sample.protocol.keys().outgoing, sample.value);
}

/// Add a sample to the node it was sent to
pub fn add_incoming_rates(dest: &mut Metadata, sample: &Traffic<'_>) {
    let keys = sample.protocol.keys();
    dest.add_rate(keys.incoming, sample.value);
    if let Some(idx) = sample.protocol.class_index(sample.code) {
        dest.add_rate(keys.incoming_classes[idx], sample.value);
    }
}

/// Protocol recorded on an edge
pub fn edge_protocol(edge: &Metadata) -> Option<Protocol> {
    edge.get_str(md::PROTOCOL).and_then(|p| p.parse().ok())
}

/// Add an edge's total rate to its source node's outgoing rate
pub fn add_outgoing_edge_to_metadata(source: &mut Metadata, edge: &Metadata) {
    if let Some(protocol) = edge_protocol(edge) {
        let value = edge.rate(protocol.edge_rate_key());
        source.add_rate(protocol.outgoing_rate_key(), value);
    }
}

/// Remove every outgoing rate from a node
pub fn reset_outgoing_metadata(node: &mut Metadata) {
    for protocol in Protocol::ALL {
        node.remove(protocol.outgoing_rate_key());
    }
}

/// Sum the rates of `from` into `into`. Both edges must carry the same protocol.
pub fn merge_edge_rates(into: &mut Metadata, from: &Metadata) {
    let Some(protocol) = edge_protocol(from) else {
        return;
    };
    let keys = protocol.keys();
    for key in std::iter::once(&keys.edge).chain(keys.edge_classes) {
        let value = from.rate(key);
        if value > 0.0 {
            into.add_rate(key, value);
        }
    }
    if let Some(Value::Object(responses)) = from.get(md::RESPONSES) {
        for (code, detail) in responses {
            if let Some(Value::Object(flags)) = detail.get("flags") {
                for (flag, value) in flags {
                    into.add_response(code, flag, "", value.as_f64().unwrap_or(0.0));
                }
            }
            if let Some(Value::Object(hosts)) = detail.get("hosts") {
                for (host, value) in hosts {
                    into.add_response_host(code, host, value.as_f64().unwrap_or(0.0));
                }
            }
        }
    }
}
