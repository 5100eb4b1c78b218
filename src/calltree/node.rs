//! Arena-backed call-path tree nodes.
//!
//! Nodes are owned by the arena and addressed by index; the parent link is a
//! plain back-index used for upward metric percolation, so the tree has no
//! reference cycles and traversal order is deterministic.

use rustc_hash::FxHashMap;

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Procedure {
        /// Declared identity shared by every call site of this procedure.
        ident: u64,
        stmt: u64,
        line: u64,
        module: u64,
        file: u64,
        /// Inlined/alien frame marker.
        alien: bool,
    },
    Loop {
        id: u64,
        stmt: u64,
        line: u64,
        containing_proc: NodeId,
    },
}

#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    metrics: FxHashMap<u64, f64>,
    max_index: Option<u64>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            parent: None,
            children: Vec::new(),
            metrics: FxHashMap::default(),
            max_index: None,
        }
    }

    pub fn is_alien(&self) -> bool {
        matches!(self.kind, NodeKind::Procedure { alien: true, .. })
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, NodeKind::Loop { .. })
    }

    pub fn metric(&self, index: u64) -> f64 {
        self.metrics.get(&index).copied().unwrap_or(0.0)
    }

    pub fn add_metric(&mut self, index: u64, value: f64) {
        *self.metrics.entry(index).or_insert(0.0) += value;
        if self.max_index.is_none_or(|m| m < index) {
            self.max_index = Some(index);
        }
    }

    pub fn has_metrics(&self) -> bool {
        !self.metrics.is_empty()
    }

    /// Accumulated metrics ordered by metric index.
    pub fn metrics_sorted(&self) -> Vec<(u64, f64)> {
        let mut entries: Vec<(u64, f64)> = self.metrics.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_unstable_by_key(|(k, _)| *k);
        entries
    }
}

/// Owning arena of call-path nodes.
#[derive(Debug, Default)]
pub struct CallTree {
    nodes: Vec<Node>,
}

impl CallTree {
    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Attach `child` under `parent`. A node keeps its first attachment:
    /// re-encountering a deduplicated frame elsewhere must not re-parent it,
    /// or percolation chains and traversal would alias across call sites.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        if self.nodes[child].parent.is_some() || parent == child {
            return;
        }
        if !self.nodes[parent].children.contains(&child) {
            self.nodes[parent].children.push(child);
        }
        self.nodes[child].parent = Some(parent);
    }
}
