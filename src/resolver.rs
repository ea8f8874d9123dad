//! Tree resolver: walks a [`PromptDocument`] along compiled selector paths and collects
//! the text fragments of every node it lands on.
//!
//! A [`Resolver`] borrows the document and a [`Resolution`] context for one feed. The
//! context (visited keys, exports, random source) outlives the resolver and is shared by
//! every feed of a run; deferred `_post` / `_all` / `_one` selectors are queued on the
//! resolver and drained by its caller.
//!
//! Visited paths double as the `_when` gate and as the duplicate filter: a branch is
//! resolved once per run, while terminal nodes are re-emitted on every visit.

use std::collections::{BTreeSet, VecDeque};

use indexmap::IndexMap;

use crate::{
    document::{Branch, PostOrder, PromptDocument, PromptNode},
    error::PromptError,
    expand::{expand_fragment, expand_legacy_vars},
    query::{build_search_keys, join_path, split_path, ChildFilter, Segment, PATH_SEP},
    random::PromptRandom,
};

/// Sub-template entered by a `name()` segment.
pub const CALL_KEY: &str = "_f";

/// Legacy variable table read by `${name}` references.
pub const VARS_KEY: &str = "_v";

/// Deferred sub-branches and the selector suffix queued for each when it is a table.
const DEFERRED: [(&str, &str); 3] = [("_post", "*!.??"), ("_all", "*!.??"), ("_one", "??")];

/// Mutable state shared by every resolution of one run.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Visited dotted paths and loaded lora names.
    pub exclude_keys: BTreeSet<String>,
    pub exports: IndexMap<String, String>,
    pub rand: PromptRandom,
}

impl Resolution {
    pub fn new(seed: Option<u64>) -> Resolution {
        Resolution {
            exclude_keys: BTreeSet::new(),
            exports: IndexMap::new(),
            rand: PromptRandom::new(seed),
        }
    }

    pub fn is_visited(&self, path: &str) -> bool {
        self.exclude_keys.contains(path)
    }
}

fn passes_when(branch: &Branch, key: &str, visited: Option<&BTreeSet<String>>) -> bool {
    let Some(visited) = visited else {
        return true;
    };
    match branch.children.get(key) {
        Some(PromptNode::Branch(child)) => child
            .meta
            .when
            .as_ref()
            .map_or(true, |gate| visited.contains(gate)),
        _ => true,
    }
}

/// Eligible content keys with their declared index.
///
/// With `visited`, children whose `_when` path has not been visited are dropped. With
/// `rand`, `_r` retention draws once per remaining key; unlike `_w`, retention values line
/// up with the remaining keys, not with the declared index.
pub fn keys_all<'b>(
    branch: &'b Branch,
    rand: Option<&mut PromptRandom>,
    visited: Option<&BTreeSet<String>>,
) -> Result<Vec<(usize, &'b str)>, PromptError> {
    let keys = branch
        .declared_keys()
        .into_iter()
        .filter(|(_, key)| passes_when(branch, key, visited))
        .collect::<Vec<_>>();
    let Some(rand) = rand else {
        return Ok(keys);
    };
    let Some(retention) = branch.meta.retention()? else {
        return Ok(keys);
    };
    Ok(keys
        .into_iter()
        .enumerate()
        .filter(|(pos, _)| rand.keep(retention.get(*pos).copied().unwrap_or(1.0)))
        .map(|(_, key)| key)
        .collect())
}

/// [`keys_all`] restricted to terminal (`terminal == true`) or branch children.
pub fn keys_term<'b>(
    branch: &'b Branch,
    terminal: bool,
    rand: Option<&mut PromptRandom>,
    visited: Option<&BTreeSet<String>>,
) -> Result<Vec<(usize, &'b str)>, PromptError> {
    Ok(keys_all(branch, rand, visited)?
        .into_iter()
        .filter(|(_, key)| {
            branch
                .children
                .get(*key)
                .is_some_and(|child| child.is_terminal() == terminal)
        })
        .collect())
}

/// Every descendant path below `branch`, relative to it, as `(long, short)`.
///
/// `long` holds leaves, choice lists and templated childless branches; `short` holds
/// templated branches that have children of their own. Both are in document order.
pub fn keys_all_recursive(
    branch: &Branch,
    mut rand: Option<&mut PromptRandom>,
    visited: Option<&BTreeSet<String>>,
) -> Result<(Vec<String>, Vec<String>), PromptError> {
    fn walk(
        branch: &Branch,
        prefix: &mut Vec<String>,
        rand: &mut Option<&mut PromptRandom>,
        visited: Option<&BTreeSet<String>>,
        long: &mut Vec<String>,
        short: &mut Vec<String>,
    ) -> Result<(), PromptError> {
        for (_, key) in keys_all(branch, rand.as_deref_mut(), visited)? {
            let Some(child) = branch.children.get(key) else {
                continue;
            };
            prefix.push(key.to_string());
            match child {
                PromptNode::Leaf(_) | PromptNode::Choices(_) => long.push(join_path(prefix)),
                PromptNode::Branch(sub) if !sub.has_content() => {
                    if sub.meta.template.is_some() {
                        long.push(join_path(prefix));
                    }
                }
                PromptNode::Branch(sub) => {
                    if sub.meta.template.is_some() {
                        short.push(join_path(prefix));
                    }
                    walk(sub, prefix, rand, visited, long, short)?;
                }
            }
            prefix.pop();
        }
        Ok(())
    }

    let mut long = Vec::new();
    let mut short = Vec::new();
    walk(branch, &mut Vec::new(), &mut rand, visited, &mut long, &mut short)?;
    Ok((long, short))
}

/// Weights for the given declared indices, padded with 1.0.
fn aligned_weights(branch: &Branch, keys: &[(usize, &str)]) -> Result<Option<Vec<f64>>, PromptError> {
    Ok(branch.meta.weights()?.map(|weights| {
        keys.iter()
            .map(|(idx, _)| weights.get(*idx).copied().unwrap_or(1.0))
            .collect()
    }))
}

fn pick_weighted(branch: &Branch, keys: &[(usize, &str)], rand: &mut PromptRandom) -> Result<Option<usize>, PromptError> {
    match aligned_weights(branch, keys)? {
        Some(weights) if !keys.is_empty() => rand.choose_weighted(&weights).map(Some),
        _ => Ok(rand.choose_index(keys.len())),
    }
}

/// One random terminal or branch child, weighted by `_w`. `None` when nothing is eligible.
pub fn keys_random(
    branch: &Branch,
    terminal: bool,
    rand: &mut PromptRandom,
    visited: Option<&BTreeSet<String>>,
) -> Result<Option<String>, PromptError> {
    let keys = keys_term(branch, terminal, None, visited)?;
    let picked = pick_weighted(branch, &keys, rand)?;
    Ok(picked.map(|idx| keys[idx].1.to_string()))
}

/// Random descent from `branch` to a node without children, one weighted pick per level.
///
/// Returns the relative path of every leaf, choice list or templated branch passed on
/// the way, shallowest first.
pub fn keys_random_recursive(
    branch: &Branch,
    rand: &mut PromptRandom,
    visited: Option<&BTreeSet<String>>,
) -> Result<Vec<String>, PromptError> {
    let mut picked = Vec::new();
    let mut prefix = Vec::new();
    let mut current = branch;
    loop {
        let keys = keys_all(current, None, visited)?;
        let Some(idx) = pick_weighted(current, &keys, rand)? else {
            break;
        };
        let key = keys[idx].1;
        let Some(child) = current.children.get(key) else {
            break;
        };
        prefix.push(key.to_string());
        match child {
            PromptNode::Branch(sub) => {
                if sub.meta.template.is_some() {
                    picked.push(join_path(&prefix));
                }
                current = sub;
            }
            _ => {
                picked.push(join_path(&prefix));
                break;
            }
        }
    }
    Ok(picked)
}

fn queue_post(posts: &mut Vec<String>, order: PostOrder, selector: String) {
    match order {
        PostOrder::Last => posts.push(selector),
        PostOrder::Index(idx) => {
            let len = posts.len() as i64;
            let at = if idx < 0 { (len + idx).max(0) } else { idx.min(len) };
            posts.insert(at as usize, selector);
        }
    }
}

/// Resolves selector paths against one document for one feed.
pub struct Resolver<'a> {
    doc: &'a mut PromptDocument,
    ctx: &'a mut Resolution,
    posts: Vec<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(doc: &'a mut PromptDocument, ctx: &'a mut Resolution) -> Resolver<'a> {
        Resolver {
            doc,
            ctx,
            posts: Vec::new(),
        }
    }

    /// Deferred selectors queued so far, in run order. Leaves the queue empty.
    pub fn take_posts(&mut self) -> Vec<String> {
        std::mem::take(&mut self.posts)
    }

    /// Compile `selector`, resolve it, then drain deferred selectors batch by batch.
    pub fn resolve(&mut self, selector: &str) -> Result<Vec<String>, PromptError> {
        let keys = build_search_keys(selector)
            .iter()
            .map(|key| split_path(key))
            .collect::<Vec<_>>();
        let mut fragments = self.collect(&keys, &[])?;
        loop {
            let posts = self.take_posts();
            if posts.is_empty() {
                break;
            }
            let keys = posts.iter().map(|key| split_path(key)).collect::<Vec<_>>();
            fragments.extend(self.collect(&keys, &[])?);
        }
        Ok(fragments)
    }

    /// Resolve each path, given as segments relative to `init_prefix`, in order.
    pub fn collect(&mut self, keys: &[Vec<String>], init_prefix: &[String]) -> Result<Vec<String>, PromptError> {
        let mut fragments = Vec::new();
        for key in keys {
            self.collect_path(key, init_prefix, &mut fragments)?;
        }
        Ok(fragments)
    }

    fn collect_path(
        &mut self,
        parts: &[String],
        init_prefix: &[String],
        out: &mut Vec<String>,
    ) -> Result<(), PromptError> {
        let mut prefix = init_prefix.to_vec();
        let mut parts = parts.iter().cloned().collect::<VecDeque<String>>();
        while let Some(part) = parts.pop_front() {
            let segment = Segment::parse(&part);
            if segment.must_be_last() && !parts.is_empty() {
                return Err(PromptError::Selector(format!(
                    "'{}' must be the last segment, found before '{}' under '{}'",
                    part,
                    parts.iter().cloned().collect::<Vec<_>>().join("."),
                    join_path(&prefix)
                )));
            }
            let key = match segment {
                Segment::Literal(name) => name.to_string(),
                Segment::Call(name) => {
                    parts.push_front(CALL_KEY.to_string());
                    name.to_string()
                }
                Segment::Pick { terminal } => match self.pick_child(&prefix, terminal)? {
                    Some(key) => key,
                    None => {
                        tracing::debug!("No eligible child for '{}' under '{}'", part, join_path(&prefix));
                        return Ok(());
                    }
                },
                Segment::PickRecursive => {
                    if self.pick_recursive(&prefix, out)? || self.ctx.is_visited(&join_path(&prefix)) {
                        return Ok(());
                    }
                    continue;
                }
                Segment::All(filter) => {
                    let picked = self.all_children(&prefix, filter)?;
                    let keys = picked
                        .into_iter()
                        .map(|key| std::iter::once(key).chain(parts.iter().cloned()).collect())
                        .collect::<Vec<Vec<String>>>();
                    out.extend(self.collect(&keys, &prefix)?);
                    return Ok(());
                }
                Segment::AllRecursive => {
                    let (long, short) = match self.doc.get(&prefix) {
                        Some(PromptNode::Branch(branch)) => keys_all_recursive(
                            branch,
                            Some(&mut self.ctx.rand),
                            Some(&self.ctx.exclude_keys),
                        )?,
                        _ => return Ok(()),
                    };
                    let keys = short
                        .iter()
                        .chain(long.iter())
                        .map(|key| split_path(key))
                        .collect::<Vec<_>>();
                    out.extend(self.collect(&keys, &prefix)?);
                    return Ok(());
                }
            };

            let exists = self
                .doc
                .get(&prefix)
                .and_then(PromptNode::as_branch)
                .is_some_and(|branch| branch.child(&key).is_some());
            if !exists {
                return Ok(());
            }
            prefix.push(key);
            self.visit(&prefix)?;
        }
        self.fall_through(&prefix, out)
    }

    fn pick_child(&mut self, prefix: &[String], terminal: bool) -> Result<Option<String>, PromptError> {
        match self.doc.get(prefix) {
            Some(PromptNode::Branch(branch)) => {
                keys_random(branch, terminal, &mut self.ctx.rand, Some(&self.ctx.exclude_keys))
            }
            _ => Ok(None),
        }
    }

    /// `??` on a node with children. Returns false when the node has none.
    fn pick_recursive(&mut self, prefix: &[String], out: &mut Vec<String>) -> Result<bool, PromptError> {
        let picked = match self.doc.get(prefix) {
            Some(PromptNode::Branch(branch)) if branch.has_content() => {
                keys_random_recursive(branch, &mut self.ctx.rand, Some(&self.ctx.exclude_keys))?
            }
            _ => return Ok(false),
        };
        let keys = picked.iter().map(|key| split_path(key)).collect::<Vec<_>>();
        out.extend(self.collect(&keys, prefix)?);
        Ok(true)
    }

    fn all_children(&mut self, prefix: &[String], filter: ChildFilter) -> Result<Vec<String>, PromptError> {
        let Some(PromptNode::Branch(branch)) = self.doc.get(prefix) else {
            return Ok(Vec::new());
        };
        Ok(
            keys_all(branch, Some(&mut self.ctx.rand), Some(&self.ctx.exclude_keys))?
                .into_iter()
                .filter(|(_, key)| {
                    branch
                        .children
                        .get(*key)
                        .is_some_and(|child| filter.accepts(child.is_terminal()))
                })
                .map(|(_, key)| key.to_string())
                .collect(),
        )
    }

    /// Side effects of stepping onto a node: exports, deferred branches, random checkpoint.
    fn visit(&mut self, prefix: &[String]) -> Result<(), PromptError> {
        let path = join_path(prefix);
        let Some(PromptNode::Branch(branch)) = self.doc.get(prefix) else {
            return Ok(());
        };
        if !self.ctx.exclude_keys.contains(&path) {
            for (key, value) in &branch.meta.exports {
                if self.ctx.exports.get(key) != Some(value) {
                    tracing::debug!("Export: {} = {}", key, value);
                    self.ctx.exports.insert(key.clone(), value.clone());
                }
            }
        }
        for (name, suffix) in DEFERRED {
            let Some(deferred) = branch.reserved.get(name) else {
                continue;
            };
            let defer_key = format!("{path}{PATH_SEP}{name}");
            if self.ctx.exclude_keys.contains(&defer_key) {
                continue;
            }
            let (selector, order) = match deferred {
                PromptNode::Branch(sub) => (
                    format!("{defer_key}{PATH_SEP}{suffix}"),
                    sub.meta.order.unwrap_or_default(),
                ),
                _ => (defer_key.clone(), PostOrder::Last),
            };
            tracing::debug!("Queue Post: {} ({:?})", selector, order);
            queue_post(&mut self.posts, order, selector);
            self.ctx.exclude_keys.insert(defer_key);
        }
        if let Some(count) = branch.meta.random_count {
            self.ctx.rand.set_count(count)?;
        }
        Ok(())
    }

    /// One random value of `${name}`: from the `_v` table of `scope`, or of the root when
    /// `name` starts with `.`. Strings count as one-value lists.
    fn legacy_var(&mut self, scope: &[String], name: &str) -> Result<String, PromptError> {
        let (mut path, var_name) = match name.strip_prefix('.') {
            Some(rest) => (Vec::new(), rest),
            None => (scope.to_vec(), name),
        };
        path.push(VARS_KEY.to_string());
        path.push(var_name.to_string());
        self.doc.load_file_var(&path)?;
        let values = match self.doc.get(&path) {
            Some(PromptNode::Leaf(value)) => vec![value.clone()],
            Some(PromptNode::Choices(values)) => values.clone(),
            Some(PromptNode::Branch(_)) => {
                return Err(PromptError::Instruction(format!(
                    "variable '{}' must be a string, a list or a _load_from_file table",
                    join_path(&path)
                )));
            }
            None => {
                tracing::warn!("Variable not set: {}", join_path(&path));
                return Ok(String::new());
            }
        };
        match self.ctx.rand.choose(&values) {
            Some(value) => Ok(value.clone()),
            None => {
                tracing::warn!("Empty variable list at '{}'", join_path(&path));
                Ok(String::new())
            }
        }
    }

    fn fall_through(&mut self, prefix: &[String], out: &mut Vec<String>) -> Result<(), PromptError> {
        let path = join_path(prefix);
        let (is_term, is_branch) = match self.doc.get(prefix) {
            Some(node) => (node.is_terminal(), node.as_branch().is_some()),
            None => return Ok(()),
        };
        self.doc.load_file_var(prefix)?;
        let duplicated = self.ctx.exclude_keys.contains(&path);
        if duplicated && !is_term {
            return Ok(());
        }
        let raw = match self.doc.get(prefix) {
            Some(PromptNode::Branch(branch)) => branch.meta.template.clone().unwrap_or_default(),
            Some(PromptNode::Choices(values)) => match self.ctx.rand.choose(values) {
                Some(value) => value.clone(),
                None => {
                    tracing::warn!("Empty choice list at '{}'", path);
                    String::new()
                }
            },
            Some(PromptNode::Leaf(text)) => text.clone(),
            None => return Ok(()),
        };
        let scope = if is_branch {
            prefix
        } else {
            &prefix[..prefix.len().saturating_sub(1)]
        };
        let raw = expand_legacy_vars(&raw, |name| self.legacy_var(scope, name))?;
        let text = expand_fragment(&mut self.ctx.rand, &raw, scope);
        if !text.is_empty() {
            out.push(text);
        }
        if duplicated {
            tracing::debug!("Load Prompt (Duplicated): {}", path);
        } else {
            tracing::debug!("Load Prompt: {}", path);
            self.ctx.exclude_keys.insert(path);
        }
        Ok(())
    }
}

fn route_branch<'d>(doc: &'d mut PromptDocument, path: &str) -> Result<&'d mut Branch, PromptError> {
    doc.require_mut(&split_path(path.trim()))?
        .as_branch_mut()
        .ok_or_else(|| PromptError::Instruction(format!("route target '{path}' is not a table")))
}

/// Walk `route` from `start`, calling `f` on every branch before stepping through it.
fn walk_route<F>(start: &mut Branch, route: &str, mut f: F) -> Result<(), PromptError>
where
    F: FnMut(&mut Branch, &str),
{
    let elems = route.split(PATH_SEP).collect::<Vec<&str>>();
    let mut node = start;
    for (i, elem) in elems.iter().enumerate() {
        if node.child(elem).is_none() {
            return Err(PromptError::NotFound(format!("route '{route}' has no key '{elem}'")));
        }
        f(node, elem);
        if i + 1 == elems.len() {
            break;
        }
        node = node
            .child_mut(elem)
            .and_then(PromptNode::as_branch_mut)
            .ok_or_else(|| PromptError::NotFound(format!("route '{route}' passes through leaf '{elem}'")))?;
    }
    Ok(())
}

/// Pin the eligible keys along each route: every branch on a route keeps only the route's
/// keys (weight 1.0 each). A branch is reset once, then accumulates every route through it.
pub fn route_fix<S: AsRef<str>>(start: &mut Branch, routes: &[S]) -> Result<(), PromptError> {
    for route in routes {
        walk_route(start, route.as_ref(), |branch, _| {
            if !branch.meta.fix {
                branch.meta.keys = Some(Vec::new());
                branch.meta.weights = Some(Vec::new());
                branch.meta.malformed_weights = None;
                branch.meta.fix = true;
            }
        })?;
    }
    for route in routes {
        walk_route(start, route.as_ref(), |branch, elem| {
            let keys = branch.meta.keys.get_or_insert_with(Vec::new);
            if !keys.iter().any(|k| k == elem) {
                keys.push(elem.to_string());
                branch.meta.weights.get_or_insert_with(Vec::new).push(1.0);
            }
        })?;
    }
    Ok(())
}

/// Remove the last key of each route from its parent's `_k`, with the aligned `_w` entry.
pub fn route_remove<S: AsRef<str>>(start: &mut Branch, routes: &[S]) -> Result<(), PromptError> {
    for route in routes {
        let route = route.as_ref();
        let (parent_path, elem) = route.rsplit_once(PATH_SEP).unwrap_or(("", route));
        let mut parent = &mut *start;
        if !parent_path.is_empty() {
            for key in parent_path.split(PATH_SEP) {
                parent = parent
                    .child_mut(key)
                    .and_then(PromptNode::as_branch_mut)
                    .ok_or_else(|| PromptError::NotFound(format!("route '{route}' has no table '{key}'")))?;
            }
        }
        if parent.meta.keys.is_none() {
            let natural = parent.children.keys().cloned().collect();
            parent.meta.keys = Some(natural);
        }
        let Some(keys) = parent.meta.keys.as_mut() else {
            continue;
        };
        if let Some(pos) = keys.iter().position(|k| k == elem) {
            keys.remove(pos);
            if let Some(weights) = parent.meta.weights.as_mut() {
                if pos < weights.len() {
                    weights.remove(pos);
                }
            }
            tracing::debug!("Route Remove: {}", route);
        }
    }
    Ok(())
}

/// `route fix|find|remove <path> <args...>` against the document.
pub fn apply_route<S: AsRef<str>>(doc: &mut PromptDocument, args: &[S]) -> Result<(), PromptError> {
    let args = args.iter().map(|a| a.as_ref()).collect::<Vec<&str>>();
    let [mode, path, rest @ ..] = args.as_slice() else {
        return Err(PromptError::Instruction(format!(
            "route expects a mode and a path, got {args:?}"
        )));
    };
    let start = route_branch(doc, path)?;
    match *mode {
        "fix" => {
            tracing::debug!("Route Fix: {} {:?}", path, rest);
            route_fix(start, rest)
        }
        "find" | "remove" => {
            let [needle, ..] = rest else {
                return Err(PromptError::Instruction(format!("route {mode} expects a substring")));
            };
            let (long, short) = keys_all_recursive(start, None, None)?;
            let matched = long
                .into_iter()
                .chain(short)
                .filter(|key| key.contains(needle))
                .collect::<Vec<String>>();
            tracing::debug!("Route {}: {} '{}' -> {:?}", mode, path, needle, matched);
            if *mode == "find" {
                route_fix(start, &matched)
            } else {
                route_remove(start, &matched)
            }
        }
        other => Err(PromptError::Instruction(format!("unknown route mode '{other}'"))),
    }
}
