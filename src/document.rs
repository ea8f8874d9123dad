//! Prompt document tree.
//!
//! A document is a tree of [`PromptNode`]s. Branch keys starting with `_` are reserved: the
//! ones carrying settings are lifted into [`BranchMeta`], the ones carrying subtrees
//! (`_f`, `_post`, `_all`, `_one`, `_v`, ...) are kept as reserved children that literal path
//! segments can reach but wildcards never select.
//!
//! Processing instructions mutate the tree in place (`route`, `set`, `grep`, and the
//! `_load_from_file` memoization), so one document must not be shared between runs.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{de, Deserialize, Deserializer};

use crate::{codec::load_file_lines, error::PromptError, query::join_path};

/// Position of a deferred branch in the post queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostOrder {
    #[default]
    Last,
    /// `Vec::insert` position; negative values count from the back.
    Index(i64),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BranchMeta {
    /// `_t`
    pub template: Option<String>,
    /// `_w`
    pub weights: Option<Vec<f64>>,
    /// `_r`
    pub retention: Option<Vec<f64>>,
    /// `_k`
    pub keys: Option<Vec<String>>,
    /// `_when`
    pub when: Option<String>,
    /// `_exports`
    pub exports: IndexMap<String, String>,
    /// `_random_count`
    pub random_count: Option<u64>,
    /// `_load_from_file`
    pub load_from_file: Option<String>,
    /// `_order`, only meaningful on deferred branches.
    pub order: Option<PostOrder>,
    /// `_fix`, set once `route` has pinned this branch's keys.
    pub fix: bool,
    /// Description of a malformed `_w`/`_r`, reported when the weights are used.
    pub malformed_weights: Option<String>,
}

impl BranchMeta {
    pub fn weights(&self) -> Result<Option<&[f64]>, PromptError> {
        self.check_weights()?;
        Ok(self.weights.as_deref())
    }

    pub fn retention(&self) -> Result<Option<&[f64]>, PromptError> {
        self.check_weights()?;
        Ok(self.retention.as_deref())
    }

    fn check_weights(&self) -> Result<(), PromptError> {
        match &self.malformed_weights {
            Some(msg) => Err(PromptError::InvalidWeights(msg.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Branch {
    /// Content children in document order.
    pub children: IndexMap<String, PromptNode>,
    /// Underscore-prefixed subtrees.
    pub reserved: IndexMap<String, PromptNode>,
    pub meta: BranchMeta,
}

impl Branch {
    /// Child by literal key, content children first.
    pub fn child(&self, key: &str) -> Option<&PromptNode> {
        self.children.get(key).or_else(|| self.reserved.get(key))
    }

    pub fn child_mut(&mut self, key: &str) -> Option<&mut PromptNode> {
        if self.children.contains_key(key) {
            self.children.get_mut(key)
        } else {
            self.reserved.get_mut(key)
        }
    }

    /// Content keys with their declared index, honoring `_k` when present.
    ///
    /// The index is the position in `_k` (or in natural order) and is what `_w` and `_r`
    /// are aligned with; `_k` entries naming absent children are skipped but keep their slot.
    pub fn declared_keys(&self) -> Vec<(usize, &str)> {
        match &self.meta.keys {
            Some(keys) => keys
                .iter()
                .enumerate()
                .filter(|(_, k)| self.children.contains_key(k.as_str()))
                .map(|(idx, k)| (idx, k.as_str()))
                .collect(),
            None => self
                .children
                .keys()
                .enumerate()
                .map(|(idx, k)| (idx, k.as_str()))
                .collect(),
        }
    }

    pub fn has_content(&self) -> bool {
        !self.declared_keys().is_empty()
    }

    fn from_entries<E: de::Error>(entries: Vec<(String, PromptNode)>) -> Result<Branch, E> {
        let mut branch = Branch::default();
        for (key, value) in entries {
            if !key.starts_with('_') {
                branch.children.insert(key, value);
                continue;
            }
            let meta = &mut branch.meta;
            match key.as_str() {
                "_t" => meta.template = Some(expect_text::<E>(&key, value)?),
                "_when" => meta.when = Some(expect_text::<E>(&key, value)?),
                "_load_from_file" => meta.load_from_file = Some(expect_text::<E>(&key, value)?),
                "_w" => match parse_weights(value) {
                    Ok(weights) => meta.weights = Some(weights),
                    Err(msg) => meta.malformed_weights = Some(format!("_w {msg}")),
                },
                "_r" => match parse_weights(value) {
                    Ok(retention) => meta.retention = Some(retention),
                    Err(msg) => meta.malformed_weights = Some(format!("_r {msg}")),
                },
                "_k" => {
                    meta.keys = Some(match value {
                        PromptNode::Choices(keys) => keys,
                        PromptNode::Leaf(key) => vec![key],
                        PromptNode::Branch(_) => {
                            return Err(E::custom("_k must be a list of keys"));
                        }
                    })
                }
                "_exports" => match value {
                    PromptNode::Branch(exports) => {
                        meta.exports = exports
                            .children
                            .into_iter()
                            .map(|(k, v)| (k, v.to_string()))
                            .collect();
                    }
                    _ => return Err(E::custom("_exports must be a table")),
                },
                "_random_count" => {
                    let text = expect_text::<E>(&key, value)?;
                    let count = text.parse::<u64>().map_err(|_| {
                        E::custom(format!("_random_count must be a non-negative integer, got '{text}'"))
                    })?;
                    meta.random_count = Some(count);
                }
                "_order" => {
                    let text = expect_text::<E>(&key, value)?;
                    meta.order = Some(if text == "last" {
                        PostOrder::Last
                    } else {
                        PostOrder::Index(text.parse::<i64>().map_err(|_| {
                            E::custom(format!("_order must be an integer or \"last\", got '{text}'"))
                        })?)
                    });
                }
                "_fix" => meta.fix = expect_text::<E>(&key, value)? == "true",
                _ => {
                    branch.reserved.insert(key, value);
                }
            }
        }
        Ok(branch)
    }
}

fn expect_text<E: de::Error>(key: &str, value: PromptNode) -> Result<String, E> {
    match value {
        PromptNode::Leaf(text) => Ok(text),
        other => Err(E::custom(format!("{key} must be a scalar value, got {other:?}"))),
    }
}

fn parse_weights(value: PromptNode) -> Result<Vec<f64>, String> {
    match value {
        PromptNode::Choices(values) => values
            .iter()
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|_| format!("entry '{v}' is not a number"))
            })
            .collect(),
        PromptNode::Leaf(v) => Err(format!("must be a list of numbers, got '{v}'")),
        PromptNode::Branch(_) => Err("must be a list of numbers, got a table".to_string()),
    }
}

/// One node of the prompt tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptNode {
    Leaf(String),
    Choices(Vec<String>),
    Branch(Branch),
}

impl PromptNode {
    pub fn as_branch(&self) -> Option<&Branch> {
        match self {
            PromptNode::Branch(branch) => Some(branch),
            _ => None,
        }
    }

    pub fn as_branch_mut(&mut self) -> Option<&mut Branch> {
        match self {
            PromptNode::Branch(branch) => Some(branch),
            _ => None,
        }
    }

    /// Leaves, choice lists and branches without content children.
    pub fn is_terminal(&self) -> bool {
        match self {
            PromptNode::Branch(branch) => !branch.has_content(),
            _ => true,
        }
    }

    pub fn has_template(&self) -> bool {
        matches!(self, PromptNode::Branch(b) if b.meta.template.is_some())
    }
}

impl fmt::Display for PromptNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptNode::Leaf(text) => write!(f, "{text}"),
            PromptNode::Choices(values) => write!(f, "[{}]", values.join(", ")),
            PromptNode::Branch(branch) => write!(f, "{}", branch.meta.template.as_deref().unwrap_or("")),
        }
    }
}

impl<'de> Deserialize<'de> for PromptNode {
    fn deserialize<D>(deserializer: D) -> Result<PromptNode, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PromptNodeVisitor;

        impl<'de> de::Visitor<'de> for PromptNodeVisitor {
            type Value = PromptNode;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string, a list of strings, or a table")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<PromptNode, E> {
                Ok(PromptNode::Leaf(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PromptNode, E> {
                Ok(PromptNode::Leaf(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PromptNode, E> {
                Ok(PromptNode::Leaf(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<PromptNode, E> {
                Ok(PromptNode::Leaf(v.to_string()))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PromptNode, E> {
                Ok(PromptNode::Leaf(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<PromptNode, E> {
                Ok(PromptNode::Leaf(v))
            }

            fn visit_unit<E: de::Error>(self) -> Result<PromptNode, E> {
                Ok(PromptNode::Leaf(String::new()))
            }

            fn visit_none<E: de::Error>(self) -> Result<PromptNode, E> {
                Ok(PromptNode::Leaf(String::new()))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<PromptNode, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut values = Vec::new();
                while let Some(item) = seq.next_element::<PromptNode>()? {
                    match item {
                        PromptNode::Leaf(text) => values.push(text),
                        _ => {
                            return Err(de::Error::custom(
                                "choice lists may only contain scalar values",
                            ))
                        }
                    }
                }
                Ok(PromptNode::Choices(values))
            }

            fn visit_map<A>(self, mut map: A) -> Result<PromptNode, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, PromptNode>()? {
                    entries.push((key, value));
                }
                Branch::from_entries(entries).map(PromptNode::Branch)
            }
        }

        deserializer.deserialize_any(PromptNodeVisitor)
    }
}

/// A loaded prompt tree plus the directory `_load_from_file` paths are relative to.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptDocument {
    root: PromptNode,
    root_dir: PathBuf,
}

impl PromptDocument {
    pub fn new<P: Into<PathBuf>>(root: Branch, root_dir: P) -> PromptDocument {
        PromptDocument {
            root: PromptNode::Branch(root),
            root_dir: root_dir.into(),
        }
    }

    pub fn from_toml_str<P: Into<PathBuf>>(text: &str, root_dir: P) -> Result<PromptDocument, PromptError> {
        let root: PromptNode = toml::from_str(text)?;
        PromptDocument::from_node(root, root_dir)
    }

    pub fn from_yaml_str<P: Into<PathBuf>>(text: &str, root_dir: P) -> Result<PromptDocument, PromptError> {
        let root: PromptNode = serde_yaml::from_str(text)?;
        PromptDocument::from_node(root, root_dir)
    }

    fn from_node<P: Into<PathBuf>>(root: PromptNode, root_dir: P) -> Result<PromptDocument, PromptError> {
        match root {
            PromptNode::Branch(branch) => Ok(PromptDocument::new(branch, root_dir)),
            other => Err(PromptError::Serialization(format!(
                "prompt document root must be a table, got {other:?}"
            ))),
        }
    }

    pub fn root(&self) -> &Branch {
        match &self.root {
            PromptNode::Branch(branch) => branch,
            _ => unreachable!("document root is always a branch"),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Node at an absolute path; the empty path is the root.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&PromptNode> {
        let mut node = &self.root;
        for key in path {
            node = node.as_branch()?.child(key.as_ref())?;
        }
        Some(node)
    }

    pub fn get_mut<S: AsRef<str>>(&mut self, path: &[S]) -> Option<&mut PromptNode> {
        let mut node = &mut self.root;
        for key in path {
            node = node.as_branch_mut()?.child_mut(key.as_ref())?;
        }
        Some(node)
    }

    /// Like [`PromptDocument::get_mut`], but a missing node is an error naming the path.
    pub fn require_mut<S: AsRef<str>>(&mut self, path: &[S]) -> Result<&mut PromptNode, PromptError> {
        self.get_mut(path)
            .ok_or_else(|| PromptError::NotFound(format!("no prompt node at '{}'", join_path(path))))
    }

    /// Replace a `_load_from_file` branch at `path` with the file's lines. Memoized: the
    /// node becomes a choice list, so later calls are no-ops.
    pub fn load_file_var<S: AsRef<str>>(&mut self, path: &[S]) -> Result<(), PromptError> {
        let root_dir = self.root_dir.clone();
        let Some(node) = self.get_mut(path) else {
            return Ok(());
        };
        let Some(rel) = node.as_branch().and_then(|b| b.meta.load_from_file.clone()) else {
            return Ok(());
        };
        let lines = load_file_lines(&root_dir, &rel)?;
        tracing::debug!(
            "Load From File: {} <- {} ({} lines)",
            join_path(path),
            rel,
            lines.len()
        );
        *node = PromptNode::Choices(lines);
        Ok(())
    }
}
