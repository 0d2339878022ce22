//! URI routing trie with online compaction of pure-literal routes.
//!
//! # Path Grammar
//! - `name` is a literal segment
//! - `:name` captures exactly one segment
//! - `*name` captures the rest of the path (at least one segment) and must be last
//!
//! # Compaction
//! A leaf whose whole path is literal is queued when it is created. Once the
//! queue reaches the threshold, queued leaves that are still eligible move into
//! a flat `path → value` map and are detached from the tree. Lookups try the
//! flat map first.

use std::collections::{HashMap, HashSet};
use std::mem;

use crate::routing::query::{is_well_formed, parse_query};
use crate::routing::RoutingError;

/// Pending-compaction queue size that triggers a compaction pass.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 16;

type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Literal,
    Parameter,
    Wildcard,
}

#[derive(Debug)]
struct Node<T> {
    kind: NodeKind,
    /// Literal text, or the capture name for parameter and wildcard nodes.
    label: String,
    parent: Option<NodeId>,
    literals: HashMap<String, NodeId>,
    param: Option<NodeId>,
    wildcard: Option<NodeId>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn new(kind: NodeKind, label: &str, parent: Option<NodeId>) -> Self {
        Self {
            kind,
            label: label.to_string(),
            parent,
            literals: HashMap::new(),
            param: None,
            wildcard: None,
            value: None,
        }
    }

    fn is_leaf(&self) -> bool {
        self.literals.is_empty() && self.param.is_none() && self.wildcard.is_none()
    }

    fn is_prunable(&self) -> bool {
        self.is_leaf() && self.value.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
    Wildcard(&'a str),
}

impl<'a> Segment<'a> {
    fn kind(&self) -> NodeKind {
        match self {
            Segment::Literal(_) => NodeKind::Literal,
            Segment::Param(_) => NodeKind::Parameter,
            Segment::Wildcard(_) => NodeKind::Wildcard,
        }
    }

    fn label(&self) -> &'a str {
        match self {
            Segment::Literal(s) | Segment::Param(s) | Segment::Wildcard(s) => *s,
        }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn canonical(segments: &[&str]) -> String {
    format!("/{}", segments.join("/"))
}

fn invalid(path: &str, reason: &'static str) -> RoutingError {
    RoutingError::InvalidPath {
        path: path.to_string(),
        reason,
    }
}

fn parse_pattern(path: &str) -> Result<Vec<Segment<'_>>, RoutingError> {
    if path.contains('?') {
        return Err(invalid(path, "query strings are not part of a route"));
    }

    let raw = split_path(path);
    let last = raw.len().saturating_sub(1);
    let mut names = HashSet::new();
    let mut segments = Vec::with_capacity(raw.len());

    for (i, seg) in raw.into_iter().enumerate() {
        let segment = if let Some(name) = seg.strip_prefix(':') {
            Segment::Param(name)
        } else if let Some(name) = seg.strip_prefix('*') {
            if i != last {
                return Err(invalid(path, "a wildcard must be the last segment"));
            }
            Segment::Wildcard(name)
        } else {
            Segment::Literal(seg)
        };

        if !matches!(segment, Segment::Literal(_)) {
            let name = segment.label();
            if name.is_empty() {
                return Err(invalid(path, "captures need a name"));
            }
            if !names.insert(name) {
                return Err(RoutingError::DuplicateParameter {
                    name: name.to_string(),
                });
            }
        }
        segments.push(segment);
    }

    Ok(segments)
}

fn literal_key(segments: &[Segment<'_>]) -> Option<String> {
    let mut literals = Vec::with_capacity(segments.len());
    for seg in segments {
        match seg {
            Segment::Literal(s) => literals.push(*s),
            _ => return None,
        }
    }
    Some(canonical(&literals))
}

/// Result of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchContext<T> {
    /// Captured path parameters (wildcards included).
    pub params: HashMap<String, String>,
    /// Parsed query parameters.
    pub query: HashMap<String, String>,
    /// Value registered for the matched route.
    pub value: T,
}

/// Routing table mapping URI patterns to values.
#[derive(Debug)]
pub struct TrieRouter<T> {
    nodes: Vec<Node<T>>,
    free: Vec<NodeId>,
    constant: HashMap<String, T>,
    pending: Vec<NodeId>,
    compaction_threshold: usize,
}

impl<T: Clone> Default for TrieRouter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TrieRouter<T> {
    pub fn new() -> Self {
        Self::with_compaction_threshold(DEFAULT_COMPACTION_THRESHOLD)
    }

    /// A threshold of 1 compacts on every eligible insert.
    pub fn with_compaction_threshold(threshold: usize) -> Self {
        Self {
            nodes: vec![Node::new(NodeKind::Literal, "", None)],
            free: Vec::new(),
            constant: HashMap::new(),
            pending: Vec::new(),
            compaction_threshold: threshold.max(1),
        }
    }

    /// Register `value` under `path`.
    ///
    /// Returns the replaced value when `override_existing` swapped one out.
    pub fn add(
        &mut self,
        path: &str,
        value: T,
        override_existing: bool,
    ) -> Result<Option<T>, RoutingError> {
        let segments = parse_pattern(path)?;
        let key = literal_key(&segments);

        if let Some(existing) = key.as_ref().and_then(|k| self.constant.get_mut(k)) {
            if !override_existing {
                return Err(RoutingError::AlreadyRegistered {
                    path: path.to_string(),
                });
            }
            return Ok(Some(mem::replace(existing, value)));
        }

        // Validate against existing nodes before creating anything, so a
        // failed add leaves no half-built branch behind.
        if let Some(terminal) = self.probe(&segments)? {
            if self.nodes[terminal].value.is_some() && !override_existing {
                return Err(RoutingError::AlreadyRegistered {
                    path: path.to_string(),
                });
            }
        }

        let mut current = ROOT;
        let mut created = false;
        for seg in &segments {
            let (next, was_created) = self.child_or_insert(current, *seg);
            current = next;
            created = was_created;
        }

        let previous = self.nodes[current].value.replace(value);

        if created && key.is_some() {
            self.pending.push(current);
            if self.pending.len() >= self.compaction_threshold {
                self.compact();
            }
        }

        Ok(previous)
    }

    /// Remove the value registered under exactly `path`.
    pub fn remove(&mut self, path: &str) -> Result<T, RoutingError> {
        let segments = parse_pattern(path)?;
        let not_found = || RoutingError::NotFound {
            path: path.to_string(),
        };

        if let Some(value) = literal_key(&segments).and_then(|k| self.constant.remove(&k)) {
            return Ok(value);
        }

        let terminal = self.probe(&segments).ok().flatten().ok_or_else(not_found)?;
        let value = self.nodes[terminal].value.take().ok_or_else(not_found)?;
        self.prune(terminal);
        Ok(value)
    }

    /// Resolve a concrete path (with optional query) to its value and captures.
    pub fn match_path(&self, path: &str) -> Result<MatchContext<T>, RoutingError> {
        let (route, raw_query) = match path.split_once('?') {
            Some((route, query)) => (route, query),
            None => (path, ""),
        };
        let query = parse_query(raw_query)?;
        let segments = split_path(route);

        if let Some(value) = self.constant.get(&canonical(&segments)) {
            return Ok(MatchContext {
                params: HashMap::new(),
                query,
                value: value.clone(),
            });
        }

        let mut params = HashMap::new();
        self.find(ROOT, &segments, Some(&mut params))
            .and_then(|id| self.nodes[id].value.clone())
            .map(|value| MatchContext {
                params,
                query,
                value,
            })
            .ok_or_else(|| RoutingError::NotFound {
                path: route.to_string(),
            })
    }

    /// Cheap routability check: same matching as [`match_path`](Self::match_path),
    /// no captures built.
    pub fn supports_uri(&self, path: &str) -> bool {
        let (route, raw_query) = match path.split_once('?') {
            Some((route, query)) => (route, query),
            None => (path, ""),
        };
        if !is_well_formed(raw_query) {
            return false;
        }
        let segments = split_path(route);
        self.constant.contains_key(&canonical(&segments))
            || self.find(ROOT, &segments, None).is_some()
    }

    /// Hoist every queued, still-eligible leaf into the constant map.
    ///
    /// Returns the number of routes hoisted.
    pub fn compact(&mut self) -> usize {
        let pending = mem::take(&mut self.pending);
        let mut hoisted = 0;

        for id in pending {
            if !self.is_compactable(id) {
                continue;
            }
            let path = self.path_of(id);
            if let Some(value) = self.nodes[id].value.take() {
                self.constant.insert(path, value);
                self.prune(id);
                hoisted += 1;
            }
        }

        if hoisted > 0 {
            tracing::trace!(hoisted, compacted = self.constant.len(), "Trie compaction pass");
        }
        hoisted
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.constant.len() + self.nodes.iter().filter(|n| n.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of routes served from the constant map.
    pub fn compacted_len(&self) -> usize {
        self.constant.len()
    }

    /// Follow the pattern through existing nodes only.
    ///
    /// `Ok(None)` means the branch does not exist yet; an error means the
    /// pattern conflicts with an existing capture.
    fn probe(&self, segments: &[Segment<'_>]) -> Result<Option<NodeId>, RoutingError> {
        let mut current = ROOT;
        for seg in segments {
            let node = &self.nodes[current];
            let next = match seg {
                Segment::Literal(s) => node.literals.get(*s).copied(),
                Segment::Param(_) => self.capture_child(node.param, seg)?,
                Segment::Wildcard(_) => self.capture_child(node.wildcard, seg)?,
            };
            match next {
                Some(id) => current = id,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn capture_child(
        &self,
        slot: Option<NodeId>,
        seg: &Segment<'_>,
    ) -> Result<Option<NodeId>, RoutingError> {
        match slot {
            Some(id) if self.nodes[id].label == seg.label() => Ok(Some(id)),
            Some(_) => Err(RoutingError::DuplicateCapture {
                segment: seg.label().to_string(),
            }),
            None => Ok(None),
        }
    }

    fn child_or_insert(&mut self, parent: NodeId, seg: Segment<'_>) -> (NodeId, bool) {
        let existing = match seg {
            Segment::Literal(s) => self.nodes[parent].literals.get(s).copied(),
            Segment::Param(_) => self.nodes[parent].param,
            Segment::Wildcard(_) => self.nodes[parent].wildcard,
        };
        if let Some(id) = existing {
            return (id, false);
        }

        let id = self.alloc(Node::new(seg.kind(), seg.label(), Some(parent)));
        let node = &mut self.nodes[parent];
        match seg {
            Segment::Literal(s) => {
                node.literals.insert(s.to_string(), id);
            }
            Segment::Param(_) => node.param = Some(id),
            Segment::Wildcard(_) => node.wildcard = Some(id),
        }
        (id, true)
    }

    fn alloc(&mut self, node: Node<T>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Detach `id` and every ancestor left without children or value.
    fn prune(&mut self, mut id: NodeId) {
        while id != ROOT && self.nodes[id].is_prunable() {
            let Some(parent) = self.nodes[id].parent else {
                break;
            };
            let node = mem::replace(&mut self.nodes[id], Node::new(NodeKind::Literal, "", None));
            let parent_node = &mut self.nodes[parent];
            match node.kind {
                NodeKind::Literal => {
                    parent_node.literals.remove(&node.label);
                }
                NodeKind::Parameter => parent_node.param = None,
                NodeKind::Wildcard => parent_node.wildcard = None,
            }
            self.free.push(id);
            id = parent;
        }
    }

    fn is_compactable(&self, id: NodeId) -> bool {
        if id == ROOT || id >= self.nodes.len() {
            return false;
        }
        let node = &self.nodes[id];
        if !node.is_leaf() || node.value.is_none() {
            return false;
        }

        // Freed slots have no parent, so they never reach the root.
        let mut current = id;
        while current != ROOT {
            let node = &self.nodes[current];
            if node.kind != NodeKind::Literal {
                return false;
            }
            match node.parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        true
    }

    fn path_of(&self, id: NodeId) -> String {
        let mut labels = Vec::new();
        let mut current = id;
        while current != ROOT {
            let node = &self.nodes[current];
            labels.push(node.label.as_str());
            match node.parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        labels.reverse();
        canonical(&labels)
    }

    fn find(
        &self,
        id: NodeId,
        segments: &[&str],
        mut captures: Option<&mut HashMap<String, String>>,
    ) -> Option<NodeId> {
        let node = &self.nodes[id];
        let Some((head, rest)) = segments.split_first() else {
            return node.value.as_ref().map(|_| id);
        };

        if let Some(&child) = node.literals.get(*head) {
            if let Some(found) = self.find(child, rest, captures.as_mut().map(|c| &mut **c)) {
                return Some(found);
            }
        }

        if let Some(child) = node.param {
            if let Some(found) = self.find(child, rest, captures.as_mut().map(|c| &mut **c)) {
                if let Some(captures) = captures {
                    captures.insert(self.nodes[child].label.clone(), head.to_string());
                }
                return Some(found);
            }
        }

        if let Some(child) = node.wildcard {
            if self.nodes[child].value.is_some() {
                if let Some(captures) = captures {
                    captures.insert(self.nodes[child].label.clone(), segments.join("/"));
                }
                return Some(child);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> TrieRouter<&'static str> {
        TrieRouter::with_compaction_threshold(1000)
    }

    #[test]
    fn literal_beats_parameter() {
        let mut r = router();
        r.add("/x/:p", "param", false).unwrap();
        r.add("/x/y", "literal", false).unwrap();

        assert_eq!(r.match_path("/x/y").unwrap().value, "literal");
        let m = r.match_path("/x/other").unwrap();
        assert_eq!(m.value, "param");
        assert_eq!(m.params["p"], "other");
    }

    #[test]
    fn parameter_beats_wildcard() {
        let mut r = router();
        r.add("/x/*rest", "wild", false).unwrap();
        r.add("/x/:p", "param", false).unwrap();

        assert_eq!(r.match_path("/x/a").unwrap().value, "param");
        assert_eq!(r.match_path("/x/a/b").unwrap().value, "wild");
    }

    #[test]
    fn wildcard_captures_rest() {
        let mut r = router();
        r.add("/x/*rest", "wild", false).unwrap();

        let m = r.match_path("/x/a/b/c").unwrap();
        assert_eq!(m.value, "wild");
        assert_eq!(m.params["rest"], "a/b/c");
        assert!(r.match_path("/x").is_err());
    }

    #[test]
    fn nested_parameter_capture() {
        let mut r = router();
        r.add("/x/z/:p/x", "deep", false).unwrap();

        let m = r.match_path("/x/z/param/x").unwrap();
        assert_eq!(m.value, "deep");
        assert_eq!(m.params["p"], "param");
    }

    #[test]
    fn backtracks_out_of_dead_literal_branch() {
        let mut r = router();
        r.add("/x/y/z", "literal", false).unwrap();
        r.add("/x/:p/w", "param", false).unwrap();

        let m = r.match_path("/x/y/w").unwrap();
        assert_eq!(m.value, "param");
        assert_eq!(m.params["p"], "y");
    }

    #[test]
    fn query_is_parsed_alongside_match() {
        let mut r = router();
        r.add("/svc/:id", "svc", false).unwrap();

        let m = r.match_path("/svc/9?verbose=1&mode=full").unwrap();
        assert_eq!(m.params["id"], "9");
        assert_eq!(m.query["verbose"], "1");
        assert_eq!(m.query["mode"], "full");

        assert!(matches!(
            r.match_path("/svc/9?broken"),
            Err(RoutingError::MalformedQuery { .. })
        ));
        assert!(!r.supports_uri("/svc/9?broken"));
    }

    #[test]
    fn add_conflicts() {
        let mut r = router();
        r.add("/a/:id", "one", false).unwrap();

        assert!(matches!(
            r.add("/a/:name", "two", false),
            Err(RoutingError::DuplicateCapture { .. })
        ));
        assert!(matches!(
            r.add("/b/:id/:id", "two", false),
            Err(RoutingError::DuplicateParameter { .. })
        ));
        assert!(matches!(
            r.add("/a/:id", "two", false),
            Err(RoutingError::AlreadyRegistered { .. })
        ));
        assert!(matches!(
            r.add("/a/*rest/more", "two", false),
            Err(RoutingError::InvalidPath { .. })
        ));

        // Same capture name extends the existing branch.
        r.add("/a/:id/edit", "edit", false).unwrap();
        assert_eq!(r.add("/a/:id", "three", true).unwrap(), Some("one"));
        assert_eq!(r.match_path("/a/1").unwrap().value, "three");
    }

    #[test]
    fn failed_add_leaves_no_branch() {
        let mut r = router();
        r.add("/a/:id", "one", false).unwrap();
        assert!(r.add("/a/:other/deeper", "two", false).is_err());

        assert_eq!(r.len(), 1);
        assert!(!r.supports_uri("/a/1/deeper"));
    }

    #[test]
    fn not_found() {
        let r = router();
        assert!(matches!(
            r.match_path("/nothing/here"),
            Err(RoutingError::NotFound { .. })
        ));
        assert!(!r.supports_uri("/nothing/here"));
    }

    #[test]
    fn root_route() {
        let mut r = router();
        r.add("/", "root", false).unwrap();
        assert_eq!(r.match_path("/").unwrap().value, "root");
        assert_eq!(r.remove("/").unwrap(), "root");
        assert!(!r.supports_uri("/"));
    }

    #[test]
    fn remove_frees_slot() {
        let mut r = router();
        r.add("/p/:id/q", "v1", false).unwrap();
        r.add("/lit/only", "l1", false).unwrap();

        assert_eq!(r.remove("/p/:id/q").unwrap(), "v1");
        assert!(!r.supports_uri("/p/1/q"));
        r.add("/p/:id/q", "v2", false).unwrap();
        assert_eq!(r.match_path("/p/1/q").unwrap().value, "v2");

        assert_eq!(r.remove("/lit/only").unwrap(), "l1");
        assert!(!r.supports_uri("/lit/only"));
        r.add("/lit/only", "l2", false).unwrap();

        assert!(matches!(
            r.remove("/never/added"),
            Err(RoutingError::NotFound { .. })
        ));
    }

    #[test]
    fn remove_keeps_siblings() {
        let mut r = router();
        r.add("/a/b/c", "c", false).unwrap();
        r.add("/a/b", "b", false).unwrap();

        r.remove("/a/b/c").unwrap();
        assert_eq!(r.match_path("/a/b").unwrap().value, "b");
        r.remove("/a/b").unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn compaction_is_transparent() {
        let paths: Vec<String> = (0..40).map(|i| format!("/svc{}/ops/{}", i % 7, i)).collect();
        let probes = [
            "/svc0/ops/0",
            "/svc3/ops/10",
            "/svc6/ops/39",
            "/svc1/ops/99",
            "/svc1/ops",
            "/svc2/ops/2?x=1",
        ];

        let mut lazy = TrieRouter::with_compaction_threshold(1000);
        let mut eager = TrieRouter::with_compaction_threshold(4);
        for (i, p) in paths.iter().enumerate() {
            lazy.add(p, i, false).unwrap();
            eager.add(p, i, false).unwrap();
        }
        lazy.add("/svc1/ops/:n", 1000, false).unwrap();
        eager.add("/svc1/ops/:n", 1000, false).unwrap();

        assert_eq!(lazy.compacted_len(), 0);
        assert!(eager.compacted_len() > 0);

        for probe in probes {
            assert_eq!(
                lazy.match_path(probe).map(|m| m.value),
                eager.match_path(probe).map(|m| m.value),
                "{probe}"
            );
            assert_eq!(lazy.supports_uri(probe), eager.supports_uri(probe), "{probe}");
        }

        let before: Vec<_> = paths.iter().map(|p| lazy.match_path(p).map(|m| m.value)).collect();
        lazy.compact();
        let after: Vec<_> = paths.iter().map(|p| lazy.match_path(p).map(|m| m.value)).collect();
        assert_eq!(before, after);
        assert_eq!(lazy.len(), 41);
    }

    #[test]
    fn compacted_route_still_conflicts_and_removes() {
        let mut r = TrieRouter::with_compaction_threshold(1);
        r.add("/a/b", 1, false).unwrap();
        assert_eq!(r.compacted_len(), 1);

        assert!(matches!(
            r.add("/a/b", 2, false),
            Err(RoutingError::AlreadyRegistered { .. })
        ));
        assert_eq!(r.add("/a/b", 3, true).unwrap(), Some(1));

        // Extending a compacted path rebuilds the branch in the tree.
        r.add("/a/b/c", 4, false).unwrap();
        assert_eq!(r.match_path("/a/b").unwrap().value, 3);
        assert_eq!(r.match_path("/a/b/c").unwrap().value, 4);

        r.remove("/a/b").unwrap();
        assert!(!r.supports_uri("/a/b"));
        assert!(r.supports_uri("/a/b/c"));
    }
}
