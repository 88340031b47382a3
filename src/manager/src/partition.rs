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

//! Splitting a physical graph across the children of one manager tier.

use std::collections::HashMap;

use dropflow_common::drop::{DropId, DropRel, DropSpec, Graph};
use dropflow_common::error::{DfError, Result};

/// The cross-partition relationships a session recorded, keyed symmetrically
/// by both endpoints' nodes so that each side can be told who to exchange
/// events with.
pub(crate) type DropRelMap = HashMap<String, HashMap<String, Vec<DropRel>>>;

/// Buckets `graph_spec` by the value of `partition_attr`.
///
/// Every spec must carry the attribute and its value must be one of `hosts`;
/// otherwise the whole call fails and nothing is bucketed. Order within a
/// bucket follows the input order.
pub(crate) fn partition_graph(
    graph_spec: Vec<DropSpec>,
    partition_attr: &str,
    hosts: &[String],
) -> Result<HashMap<String, Vec<DropSpec>>> {
    let mut per_partition: HashMap<String, Vec<DropSpec>> = HashMap::new();
    for spec in graph_spec {
        let oid = spec.oid()?.to_string();
        let partition = match spec.get_str(partition_attr) {
            Some(partition) => partition.to_string(),
            None => {
                return Err(DfError::InvalidGraph(format!(
                    "drop {oid} doesn't specify a {partition_attr} attribute"
                )))
            }
        };
        if !hosts.contains(&partition) {
            return Err(DfError::InvalidGraph(format!(
                "drop {oid}'s {partition_attr} {partition} does not belong to this manager"
            )));
        }
        per_partition.entry(partition).or_default().push(spec);
    }
    Ok(per_partition)
}

/// Rewrites relationship endpoints from object-identifier space into
/// unique-identifier space, in place.
///
/// Users identify drops by object id in the graphs they submit, while
/// everything downstream is indexed by unique id; relationships are
/// normalised here, right after they are recorded.
pub(crate) fn sanitize_relations(rels: &mut [DropRel], graph: &Graph) -> Result<()> {
    let mut by_oid: HashMap<&str, &str> = HashMap::with_capacity(graph.len());
    for (uid, spec) in graph {
        by_oid.insert(spec.oid()?, uid.as_str());
    }
    let resolve = |id: &str| -> Result<DropId> {
        if let Some(uid) = by_oid.get(id) {
            Ok(uid.to_string())
        } else if graph.contains_key(id) {
            Ok(id.to_string())
        } else {
            Err(DfError::InvalidGraph(format!(
                "relationship references a drop not part of this graph: {id}"
            )))
        }
    };
    for rel in rels {
        rel.lhs = resolve(&rel.lhs)?;
        rel.rhs = resolve(&rel.rhs)?;
    }
    Ok(())
}

/// Builds the symmetric node→node map of cross-partition relationships.
/// Endpoints must already be in unique-identifier space.
pub(crate) fn build_drop_rels(rels: &[DropRel], graph: &Graph) -> Result<DropRelMap> {
    let node_of = |uid: &str| -> Result<String> {
        let spec = graph.get(uid).ok_or_else(|| {
            DfError::InvalidGraph(format!("relationship references an unknown drop: {uid}"))
        })?;
        spec.node()
            .map(str::to_owned)
            .ok_or_else(|| {
                DfError::InvalidGraph(format!("drop {uid} doesn't specify a node attribute"))
            })
    };

    let mut drop_rels = DropRelMap::new();
    for rel in rels {
        let lhn = node_of(&rel.lhs)?;
        let rhn = node_of(&rel.rhs)?;
        drop_rels
            .entry(lhn.clone())
            .or_default()
            .entry(rhn.clone())
            .or_default()
            .push(rel.clone());
        drop_rels
            .entry(rhn)
            .or_default()
            .entry(lhn)
            .or_default()
            .push(rel.clone());
    }
    Ok(drop_rels)
}

/// Groups uids by the leaf node owning each drop.
pub(crate) fn group_by_node(uids: &[DropId], graph: &Graph) -> Result<HashMap<String, Vec<DropId>>> {
    let mut by_node: HashMap<String, Vec<DropId>> = HashMap::new();
    for uid in uids {
        let spec = graph.get(uid).ok_or_else(|| {
            DfError::InvalidGraph(format!("unknown drop: {uid}"))
        })?;
        let node = spec.node().ok_or_else(|| {
            DfError::InvalidGraph(format!("drop {uid} doesn't specify a node attribute"))
        })?;
        by_node.entry(node.to_string()).or_default().push(uid.clone());
    }
    Ok(by_node)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use maplit::hashmap;
    use serde_json::json;

    use dropflow_common::drop::LinkType;

    use super::*;

    fn spec(value: serde_json::Value) -> DropSpec {
        DropSpec::try_from(value).unwrap()
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_partitioning_preserves_bucket_order() {
        let buckets = partition_graph(
            vec![
                spec(json!({"oid": "C", "node": "h1"})),
                spec(json!({"oid": "A", "node": "h2"})),
                spec(json!({"oid": "B", "node": "h1"})),
            ],
            "node",
            &hosts(&["h1", "h2"]),
        )
        .unwrap();
        let oids: Vec<&str> = buckets["h1"].iter().map(|s| s.oid().unwrap()).collect();
        assert_eq!(oids, vec!["C", "B"]);
        assert_eq!(buckets["h2"].len(), 1);
    }

    #[test]
    fn test_missing_partition_attr_is_rejected() {
        let err = partition_graph(
            vec![spec(json!({"oid": "A"}))],
            "island",
            &hosts(&["h1"]),
        )
        .unwrap_err();
        assert_matches!(err, DfError::InvalidGraph(msg) if msg.contains("A") && msg.contains("island"));
    }

    #[test]
    fn test_foreign_partition_is_rejected() {
        let err = partition_graph(
            vec![spec(json!({"oid": "B", "node": "h3"}))],
            "node",
            &hosts(&["h1", "h2"]),
        )
        .unwrap_err();
        assert_matches!(err, DfError::InvalidGraph(msg) if msg.contains("B") && msg.contains("h3"));
    }

    #[test]
    fn test_sanitize_rewrites_to_uid_space() {
        let graph: Graph = [
            ("uA".to_string(), spec(json!({"oid": "A", "uid": "uA"}))),
            ("uB".to_string(), spec(json!({"oid": "B", "uid": "uB"}))),
        ]
        .into();
        let mut rels = vec![DropRel::new("A", LinkType::StreamingConsumer, "B")];
        sanitize_relations(&mut rels, &graph).unwrap();
        assert_eq!(rels, vec![DropRel::new("uA", LinkType::StreamingConsumer, "uB")]);
    }

    #[test]
    fn test_sanitize_rejects_unknown_endpoints() {
        let graph: Graph = [("uA".to_string(), spec(json!({"oid": "A", "uid": "uA"})))].into();
        let mut rels = vec![DropRel::new("A", LinkType::Consumer, "X")];
        assert_matches!(
            sanitize_relations(&mut rels, &graph),
            Err(DfError::InvalidGraph(msg)) if msg.contains("X")
        );
    }

    #[test]
    fn test_drop_rel_map_is_symmetric() {
        let graph: Graph = [
            ("uA".to_string(), spec(json!({"oid": "A", "uid": "uA", "node": "h1"}))),
            ("uB".to_string(), spec(json!({"oid": "B", "uid": "uB", "node": "h2"}))),
        ]
        .into();
        let rel = DropRel::new("uA", LinkType::Output, "uB");
        let map = build_drop_rels(std::slice::from_ref(&rel), &graph).unwrap();
        assert_eq!(
            map,
            hashmap! {
                "h1".to_string() => hashmap! {"h2".to_string() => vec![rel.clone()]},
                "h2".to_string() => hashmap! {"h1".to_string() => vec![rel]},
            }
        );
    }

    #[test]
    fn test_group_by_node() {
        let graph: Graph = [
            ("uA".to_string(), spec(json!({"oid": "A", "uid": "uA", "node": "h1"}))),
            ("uB".to_string(), spec(json!({"oid": "B", "uid": "uB", "node": "h2"}))),
            ("uC".to_string(), spec(json!({"oid": "C", "uid": "uC", "node": "h1"}))),
        ]
        .into();
        let grouped = group_by_node(
            &["uA".to_string(), "uB".to_string(), "uC".to_string()],
            &graph,
        )
        .unwrap();
        assert_eq!(
            grouped,
            hashmap! {
                "h1".to_string() => vec!["uA".to_string(), "uC".to_string()],
                "h2".to_string() => vec!["uB".to_string()],
            }
        );
    }
}
