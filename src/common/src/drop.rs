// Copyright 2023 Dropflow Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The drop data model: open-ended drop specifications and the typed
//! relationships between them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DfError, Result};

/// The author-supplied object identifier of a drop, or the globally unique
/// instance identifier derived from it.
pub type DropId = String;

/// Identifier of one deployment of a graph across the managed hierarchy.
pub type SessionId = String;

/// A graph of drop specifications, indexed by unique identifier.
pub type Graph = HashMap<DropId, DropSpec>;

/// The declarative record from which a drop is instantiated.
///
/// Drop specifications are open keyed records: besides the handful of
/// well-known attributes exposed as typed accessors, any number of additional
/// keys may be present and are carried through unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DropSpec(Map<String, Value>);

impl DropSpec {
    /// The object identifier. Every drop specification must carry one.
    pub fn oid(&self) -> Result<&str> {
        self.get_str("oid")
            .ok_or_else(|| DfError::InvalidGraph("drop spec has no 'oid' attribute".to_string()))
    }

    /// The unique identifier, falling back to the object identifier when the
    /// spec does not carry an explicit `uid`.
    pub fn uid(&self) -> Result<&str> {
        match self.get_str("uid") {
            Some(uid) => Ok(uid),
            None => self.oid(),
        }
    }

    /// The leaf node this drop ultimately lives on.
    pub fn node(&self) -> Option<&str> {
        self.get_str("node")
    }

    /// A string-valued attribute, or `None` if absent or not a string.
    pub fn get_str(&self, attr: &str) -> Option<&str> {
        self.0.get(attr).and_then(Value::as_str)
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.0.get(attr)
    }

    pub fn get_mut(&mut self, attr: &str) -> Option<&mut Value> {
        self.0.get_mut(attr)
    }

    pub fn insert(&mut self, attr: impl Into<String>, value: Value) {
        self.0.insert(attr.into(), value);
    }

    pub fn remove(&mut self, attr: &str) -> Option<Value> {
        self.0.remove(attr)
    }
}

impl From<Map<String, Value>> for DropSpec {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for DropSpec {
    type Error = DfError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DfError::InvalidGraph(format!(
                "drop spec must be an object, got {other}"
            ))),
        }
    }
}

/// The kind of a relationship between two drops, together with the spec
/// attribute the relationship is stored under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkType {
    Consumer,
    StreamingConsumer,
    Input,
    StreamingInput,
    Output,
    Producer,
    Parent,
    Child,
}

impl LinkType {
    /// Link kinds stored as lists of references on a drop spec.
    pub const MANY: [LinkType; 7] = [
        LinkType::Consumer,
        LinkType::StreamingConsumer,
        LinkType::Input,
        LinkType::StreamingInput,
        LinkType::Output,
        LinkType::Producer,
        LinkType::Child,
    ];

    /// The spec attribute under which links of this kind are stored.
    pub fn spec_attr(self) -> &'static str {
        match self {
            LinkType::Consumer => "consumers",
            LinkType::StreamingConsumer => "streamingConsumers",
            LinkType::Input => "inputs",
            LinkType::StreamingInput => "streamingInputs",
            LinkType::Output => "outputs",
            LinkType::Producer => "producers",
            LinkType::Parent => "parent",
            LinkType::Child => "children",
        }
    }

    /// Whether the attribute holds a single reference rather than a list.
    pub fn is_scalar(self) -> bool {
        matches!(self, LinkType::Parent)
    }
}

/// A typed directed relationship between two drops.
///
/// Relationships enter the system with endpoints in object-identifier space
/// and are normalised to unique identifiers before being stored or forwarded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DropRel {
    pub lhs: DropId,
    pub rel: LinkType,
    pub rhs: DropId,
}

impl DropRel {
    pub fn new(lhs: impl Into<DropId>, rel: LinkType, rhs: impl Into<DropId>) -> Self {
        Self {
            lhs: lhs.into(),
            rel,
            rhs: rhs.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn spec(value: Value) -> DropSpec {
        DropSpec::try_from(value).unwrap()
    }

    #[test]
    fn test_uid_falls_back_to_oid() {
        let s = spec(json!({"oid": "A"}));
        assert_eq!(s.uid().unwrap(), "A");

        let s = spec(json!({"oid": "A", "uid": "uA"}));
        assert_eq!(s.uid().unwrap(), "uA");

        let s = spec(json!({"type": "plain"}));
        assert!(s.oid().is_err());
        assert!(s.uid().is_err());
    }

    #[test]
    fn test_unknown_attrs_preserved() {
        let s = spec(json!({"oid": "A", "node": "h1", "dropclass": "x.y.Z", "rank": 3}));
        assert_eq!(s.node(), Some("h1"));
        assert_eq!(s.get_str("dropclass"), Some("x.y.Z"));
        assert_eq!(s.get("rank"), Some(&json!(3)));
    }

    #[test]
    fn test_link_type_wire_names() {
        assert_eq!(
            serde_json::to_value(LinkType::StreamingConsumer).unwrap(),
            json!("streamingConsumer")
        );
        let rel: DropRel =
            serde_json::from_value(json!({"lhs": "a", "rel": "producer", "rhs": "b"})).unwrap();
        assert_eq!(rel, DropRel::new("a", LinkType::Producer, "b"));
    }
}
