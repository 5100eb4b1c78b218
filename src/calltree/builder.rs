//! Call-path document parsing.
//!
//! Consumes the raw hierarchical profile document as an element stream and
//! builds the in-memory [`CallTree`], maintaining an explicit stack of open
//! procedure/loop frames. Metric values recorded at inlined/alien frames are
//! percolated upward into the nearest enclosing loop as they arrive.

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::warn;

use crate::calltree::node::{CallTree, Node, NodeId, NodeKind};
use crate::xml::{Element, XmlError, XmlEvent, XmlReader};

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("{element} element with no '{attr}' attribute")]
    MissingAttribute {
        element: &'static str,
        attr: &'static str,
    },
    #[error("{element} element with a non-numeric '{attr}' attribute")]
    InvalidNumber {
        element: &'static str,
        attr: &'static str,
    },
    #[error("loop without a containing procedure")]
    LoopOutsideProcedure,
    #[error("metric value outside of any open procedure or loop")]
    MetricOutsideSection,
    #[error("metric index {0} not covered by the metric table")]
    MetricIndexOutOfRange(u64),
    #[error("closing {0} element without a matching open frame")]
    UnbalancedClose(String),
    #[error("unterminated procedure or loop frame at end of document")]
    UnterminatedFrame,
    #[error(transparent)]
    Xml(#[from] XmlError),
}

/// Fully parsed call-path document, ready to be flattened.
#[derive(Debug, Default)]
pub struct CallPathDocument {
    pub(crate) tree: CallTree,
    pub(crate) version: String,
    pub(crate) header: String,
    pub(crate) profile_name: String,
    /// Counter names in metric-table order; metric indices key into this.
    pub(crate) metric_names: Vec<String>,
    /// Whole-document totals, one slot per metric-table entry.
    pub(crate) aggregate: Vec<f64>,
    pub(crate) proc_names: FxHashMap<u64, String>,
    pub(crate) file_names: FxHashMap<u64, String>,
    pub(crate) module_names: FxHashMap<u64, String>,
    /// Non-alien top-level procedures, in order of first sight.
    pub(crate) real_procs: Vec<NodeId>,
}

impl CallPathDocument {
    pub fn parse(input: &str) -> Result<Self, TreeError> {
        Builder::default().run(input)
    }

    pub fn aggregate_metric(&self, index: usize) -> f64 {
        self.aggregate.get(index).copied().unwrap_or(0.0)
    }
}

#[derive(Default)]
struct Builder {
    doc: CallPathDocument,
    proc_by_ident: FxHashMap<u64, NodeId>,
    loop_by_stmt: FxHashMap<u64, NodeId>,
    stack: Vec<NodeId>,
    /// Nesting depth inside a callsite subtree; everything is skipped
    /// until the matching close.
    callsite_depth: usize,
}

impl Builder {
    fn run(mut self, input: &str) -> Result<CallPathDocument, TreeError> {
        let mut reader = XmlReader::new(input);
        while let Some(event) = reader.next_event()? {
            match event {
                XmlEvent::Open(element) => self.open(&element)?,
                XmlEvent::Close(name) => self.close(&name)?,
            }
        }
        if !self.stack.is_empty() {
            return Err(TreeError::UnterminatedFrame);
        }
        Ok(self.doc)
    }

    fn open(&mut self, element: &Element) -> Result<(), TreeError> {
        if self.callsite_depth > 0 {
            if element.name == "C" {
                self.callsite_depth += 1;
            }
            return Ok(());
        }

        match element.name.as_str() {
            "HPCToolkitExperiment" => {
                self.doc.version = element.attr("version").unwrap_or_default().to_string();
            }
            "Header" => {
                self.doc.header = element.attr("n").unwrap_or_default().to_string();
            }
            "SecCallPathProfile" => {
                self.doc.profile_name = element.attr("n").unwrap_or_default().to_string();
            }
            "LoadModule" => {
                if let (Some(i), Some(n)) = (element.attr("i"), element.attr("n")) {
                    let id = parse_u64(i, "LoadModule", "i")?;
                    self.doc.module_names.insert(id, n.to_string());
                }
            }
            "File" => {
                if let (Some(i), Some(n)) = (element.attr("i"), element.attr("n")) {
                    let id = parse_u64(i, "File", "i")?;
                    // Only the basename is carried into flat output labels.
                    let base = n.rsplit('/').next().unwrap_or(n);
                    self.doc.file_names.insert(id, base.to_string());
                }
            }
            "Procedure" => {
                if let (Some(i), Some(n)) = (element.attr("i"), element.attr("n")) {
                    let id = parse_u64(i, "Procedure", "i")?;
                    self.doc.proc_names.insert(id, n.to_string());
                }
            }
            "Metric" => {
                let name = element
                    .attr("n")
                    .ok_or(TreeError::MissingAttribute { element: "Metric", attr: "n" })?;
                self.doc.metric_names.push(name.to_string());
            }
            "PF" | "Pr" => self.open_procedure_frame(element)?,
            "L" => self.open_loop(element)?,
            "M" => self.metric_value(element)?,
            "C" => {
                self.callsite_depth = 1;
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<(), TreeError> {
        if self.callsite_depth > 0 {
            if name == "C" {
                self.callsite_depth -= 1;
            }
            return Ok(());
        }

        match name {
            "MetricTable" => {
                if self.doc.metric_names.is_empty() {
                    warn!("metric table declared zero counters, is the input document correct?");
                }
                self.doc.aggregate = vec![0.0; self.doc.metric_names.len()];
            }
            "PF" | "Pr" | "L" => {
                if self.stack.pop().is_none() {
                    return Err(TreeError::UnbalancedClose(name.to_string()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn open_procedure_frame(&mut self, element: &Element) -> Result<(), TreeError> {
        let ident = parse_u64(
            element
                .attr("n")
                .ok_or(TreeError::MissingAttribute { element: "PF", attr: "n" })?,
            "PF",
            "n",
        )?;

        let node_id = match self.proc_by_ident.get(&ident) {
            Some(&existing) => existing,
            None => {
                let alien = opt_u64(element, "a", "PF")? == 1;
                let node = Node::new(NodeKind::Procedure {
                    ident,
                    stmt: opt_u64(element, "s", "PF")?,
                    line: opt_u64(element, "l", "PF")?,
                    module: opt_u64(element, "lm", "PF")?,
                    file: opt_u64(element, "f", "PF")?,
                    alien,
                });
                let id = self.doc.tree.push(node);
                if !alien {
                    self.doc.real_procs.push(id);
                }
                self.proc_by_ident.insert(ident, id);
                if let Some(&top) = self.stack.last() {
                    self.doc.tree.attach(top, id);
                }
                id
            }
        };
        self.stack.push(node_id);
        Ok(())
    }

    fn open_loop(&mut self, element: &Element) -> Result<(), TreeError> {
        let stmt = parse_u64(
            element
                .attr("s")
                .ok_or(TreeError::MissingAttribute { element: "L", attr: "s" })?,
            "L",
            "s",
        )?;

        let &top = self.stack.last().ok_or(TreeError::LoopOutsideProcedure)?;
        let containing_proc = match self.doc.tree.node(top).kind {
            NodeKind::Loop { containing_proc, .. } => containing_proc,
            NodeKind::Procedure { .. } => top,
        };

        let node_id = match self.loop_by_stmt.get(&stmt) {
            Some(&existing) => existing,
            None => {
                let node = Node::new(NodeKind::Loop {
                    id: opt_u64(element, "i", "L")?,
                    stmt,
                    line: opt_u64(element, "l", "L")?,
                    containing_proc,
                });
                let id = self.doc.tree.push(node);
                self.loop_by_stmt.insert(stmt, id);
                self.doc.tree.attach(top, id);
                id
            }
        };
        self.stack.push(node_id);
        Ok(())
    }

    fn metric_value(&mut self, element: &Element) -> Result<(), TreeError> {
        let index = parse_u64(
            element
                .attr("n")
                .ok_or(TreeError::MissingAttribute { element: "M", attr: "n" })?,
            "M",
            "n",
        )?;
        let value: f64 = element
            .attr("v")
            .ok_or(TreeError::MissingAttribute { element: "M", attr: "v" })?
            .parse()
            .map_err(|_| TreeError::InvalidNumber { element: "M", attr: "v" })?;

        let &top = self.stack.last().ok_or(TreeError::MetricOutsideSection)?;
        if (index as usize) >= self.doc.aggregate.len() {
            return Err(TreeError::MetricIndexOutOfRange(index));
        }

        self.doc.tree.node_mut(top).add_metric(index, value);
        percolate_up(&mut self.doc.tree, top, index, value);
        self.doc.aggregate[index as usize] += value;
        Ok(())
    }
}

/// Walk upward from `node`: an inlined/alien procedure forwards the
/// contribution toward its nearest enclosing loop; a loop keeps climbing;
/// a non-alien procedure ends the chain.
fn percolate_up(tree: &mut CallTree, node: NodeId, index: u64, value: f64) {
    let parent = tree.node(node).parent;
    if tree.node(node).is_alien() {
        if let Some(up) = parent {
            percolate_up(tree, up, index, value);
            percolate_to_loop(tree, up, index, value);
        }
    } else if tree.node(node).is_loop() {
        if let Some(up) = parent {
            percolate_up(tree, up, index, value);
        }
    }
}

fn percolate_to_loop(tree: &mut CallTree, node: NodeId, index: u64, value: f64) {
    if tree.node(node).is_loop() {
        tree.node_mut(node).add_metric(index, value);
    }
}

fn parse_u64(value: &str, element: &'static str, attr: &'static str) -> Result<u64, TreeError> {
    value
        .parse()
        .map_err(|_| TreeError::InvalidNumber { element, attr })
}

fn opt_u64(element: &Element, attr: &'static str, name: &'static str) -> Result<u64, TreeError> {
    match element.attr(attr) {
        Some(value) => parse_u64(value, name, attr),
        None => Ok(0),
    }
}
