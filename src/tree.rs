//! Hierarchical profile value trees and their flattening into per-stack-node entries.

use crate::types::{ProfileMeta, Value};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single profile as received by a series appender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub meta: ProfileMeta,
    pub tree: ProfileTree,
}

/// Identity of one stack-node position within a series.
///
/// `location` is the `|`-joined location id path from the root to the node. `labels` is the
/// canonical rendering of a flat sample's labels; it is empty for cumulative keys and for
/// unlabelled flat samples.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub location: String,
    pub labels: String,
}

impl NodeKey {
    pub fn new(location: impl Into<String>, labels: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            labels: labels.into(),
        }
    }

    /// Key for a location path without labels.
    pub fn from_path(path: &[u64]) -> Self {
        Self::new(join_path(path), String::new())
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            f.write_str(&self.location)
        } else {
            write!(f, "{}{{{}}}", self.location, self.labels)
        }
    }
}

/// A value attributed directly to a node, with its pprof-style labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatSample {
    pub value: Value,
    pub labels: BTreeMap<String, Vec<String>>,
    pub num_labels: BTreeMap<String, Vec<i64>>,
    pub num_units: BTreeMap<String, Vec<String>>,
}

impl FlatSample {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn with_num_label(mut self, name: impl Into<String>, value: i64, unit: impl Into<String>) -> Self {
        let name = name.into();
        self.num_labels.entry(name.clone()).or_default().push(value);
        self.num_units.entry(name).or_default().push(unit.into());
        self
    }

    /// Renders the labels as `name=v1|v2,#num=1|2`. Separator characters inside names and values
    /// are backslash-escaped, so distinct label sets never render the same.
    fn label_fingerprint(&self) -> String {
        let mut out = String::new();
        for (name, values) in &self.labels {
            if !out.is_empty() {
                out.push(',');
            }
            push_escaped(&mut out, name);
            out.push('=');
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    out.push('|');
                }
                push_escaped(&mut out, v);
            }
        }
        for (name, values) in &self.num_labels {
            if !out.is_empty() {
                out.push(',');
            }
            out.push('#');
            push_escaped(&mut out, name);
            out.push('=');
            let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            out.push_str(&rendered.join("|"));
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileTreeNode {
    pub location_id: u64,
    pub flat: Vec<FlatSample>,
    pub children: Vec<ProfileTreeNode>,
}

impl ProfileTreeNode {
    pub fn new(location_id: u64) -> Self {
        Self {
            location_id,
            ..Default::default()
        }
    }

    fn child_mut(&mut self, location_id: u64) -> &mut ProfileTreeNode {
        let idx = match self
            .children
            .iter()
            .position(|c| c.location_id == location_id)
        {
            Some(idx) => idx,
            None => {
                self.children.push(ProfileTreeNode::new(location_id));
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }
}

/// Call-stack tree of one profile. The root is a synthetic node with location id 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileTree {
    pub root: ProfileTreeNode,
}

impl Default for ProfileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileTree {
    pub fn new() -> Self {
        Self {
            root: ProfileTreeNode::new(0),
        }
    }

    /// Inserts a stack (root-most location first) ending in `sample`.
    pub fn insert_stack(&mut self, locations: &[u64], sample: FlatSample) {
        let mut node = &mut self.root;
        for &loc in locations {
            node = node.child_mut(loc);
        }
        node.flat.push(sample);
    }

    /// Builds a tree from unlabelled stacks.
    pub fn from_stacks<'a>(stacks: impl IntoIterator<Item = (&'a [u64], Value)>) -> Self {
        let mut tree = Self::new();
        for (locations, value) in stacks {
            tree.insert_stack(locations, FlatSample::new(value));
        }
        tree
    }

    /// Flattens the tree depth-first into per-key entries.
    ///
    /// Every node yields one cumulative entry (the sum of all flat values in its subtree); every
    /// flat sample yields one flat entry. Entries sharing a key are summed.
    pub fn entries(&self) -> TreeEntries {
        let mut entries = TreeEntries::default();
        let mut path = Vec::new();
        collect(&self.root, &mut path, &mut entries);
        entries
    }
}

/// Per-key values extracted from one [`ProfileTree`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeEntries {
    pub cumulative: BTreeMap<NodeKey, Value>,
    pub flat: BTreeMap<NodeKey, FlatSample>,
}

fn collect(node: &ProfileTreeNode, path: &mut Vec<u64>, out: &mut TreeEntries) -> Value {
    path.push(node.location_id);
    let location = join_path(path);

    let mut cumulative: Value = 0;
    for sample in &node.flat {
        cumulative = cumulative.wrapping_add(sample.value);
        let key = NodeKey::new(location.clone(), sample.label_fingerprint());
        match out.flat.get_mut(&key) {
            Some(existing) => existing.value = existing.value.wrapping_add(sample.value),
            None => {
                out.flat.insert(key, sample.clone());
            }
        }
    }
    for child in &node.children {
        cumulative = cumulative.wrapping_add(collect(child, path, out));
    }

    let total = out
        .cumulative
        .entry(NodeKey::new(location, String::new()))
        .or_insert(0);
    *total = total.wrapping_add(cumulative);

    path.pop();
    cumulative
}

fn push_escaped(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, '\\' | '|' | ',' | '=' | '#') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn join_path(path: &[u64]) -> String {
    let parts: Vec<String> = path.iter().map(|id| id.to_string()).collect();
    parts.join("|")
}
