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

//! Utilities over physical-graph specifications: splitting off relationships
//! that cross a partition boundary, and reattaching them later.

use std::collections::HashSet;

use serde_json::Value;

use crate::drop::{DropRel, DropSpec, LinkType};

/// Removes from `drop_specs` every relationship whose other endpoint is not
/// itself part of `drop_specs`, and returns the removed relationships.
///
/// Endpoints are matched by object identifier; the returned relationships are
/// therefore still in object-identifier space. Entries that are not string
/// references are left untouched.
pub fn remove_unmet_relationships(drop_specs: &mut [DropSpec]) -> Vec<DropRel> {
    let local: HashSet<String> = drop_specs
        .iter()
        .filter_map(|spec| spec.oid().ok().map(str::to_owned))
        .collect();

    let mut unmet = Vec::new();
    for spec in drop_specs.iter_mut() {
        let Ok(owner) = spec.oid().map(str::to_owned) else {
            continue;
        };

        for link in LinkType::MANY {
            let Some(Value::Array(refs)) = spec.get_mut(link.spec_attr()) else {
                continue;
            };
            refs.retain(|entry| match entry.as_str() {
                Some(oid) if !local.contains(oid) => {
                    unmet.push(DropRel::new(oid, link, owner.as_str()));
                    false
                }
                _ => true,
            });
            if refs.is_empty() {
                spec.remove(link.spec_attr());
            }
        }

        let parent = LinkType::Parent;
        if let Some(Value::String(oid)) = spec.get(parent.spec_attr()) {
            if !local.contains(oid) {
                unmet.push(DropRel::new(oid.as_str(), parent, owner.as_str()));
                spec.remove(parent.spec_attr());
            }
        }
    }
    unmet
}

/// Adds to `spec` a link of the given kind pointing at `target`.
pub fn add_link(link: LinkType, spec: &mut DropSpec, target: &str) {
    let attr = link.spec_attr();
    if link.is_scalar() {
        spec.insert(attr, Value::String(target.to_string()));
        return;
    }
    match spec.get_mut(attr) {
        Some(Value::Array(refs)) => refs.push(Value::String(target.to_string())),
        _ => spec.insert(attr, Value::Array(vec![Value::String(target.to_string())])),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn spec(value: serde_json::Value) -> DropSpec {
        DropSpec::try_from(value).unwrap()
    }

    #[test]
    fn test_local_relationships_are_kept() {
        let mut bucket = vec![
            spec(json!({"oid": "A", "consumers": ["B"]})),
            spec(json!({"oid": "B", "producers": ["A"]})),
        ];
        assert_eq!(remove_unmet_relationships(&mut bucket), vec![]);
        assert_eq!(bucket[0].get("consumers"), Some(&json!(["B"])));
        assert_eq!(bucket[1].get("producers"), Some(&json!(["A"])));
    }

    #[test]
    fn test_cross_partition_relationships_are_extracted() {
        let mut bucket = vec![
            spec(json!({"oid": "A", "consumers": ["B", "X"], "outputs": ["Y"]})),
            spec(json!({"oid": "B"})),
        ];
        let unmet = remove_unmet_relationships(&mut bucket);
        assert_eq!(
            unmet,
            vec![
                DropRel::new("X", LinkType::Consumer, "A"),
                DropRel::new("Y", LinkType::Output, "A"),
            ]
        );
        // The local reference survives; the emptied attribute disappears.
        assert_eq!(bucket[0].get("consumers"), Some(&json!(["B"])));
        assert_eq!(bucket[0].get("outputs"), None);
    }

    #[test]
    fn test_unmet_parent_is_extracted() {
        let mut bucket = vec![spec(json!({"oid": "A", "parent": "P"}))];
        let unmet = remove_unmet_relationships(&mut bucket);
        assert_eq!(unmet, vec![DropRel::new("P", LinkType::Parent, "A")]);
        assert_eq!(bucket[0].get("parent"), None);
    }

    #[test]
    fn test_add_link() {
        let mut s = spec(json!({"oid": "A"}));
        add_link(LinkType::StreamingConsumer, &mut s, "uB");
        add_link(LinkType::StreamingConsumer, &mut s, "uC");
        assert_eq!(s.get("streamingConsumers"), Some(&json!(["uB", "uC"])));

        add_link(LinkType::Parent, &mut s, "uP");
        assert_eq!(s.get("parent"), Some(&json!("uP")));
    }
}
