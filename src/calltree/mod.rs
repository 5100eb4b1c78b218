//! Call-path tree construction and flattening.
//!
//! The raw profile document is reduced in two steps: `builder` consumes the
//! element stream into an arena tree, percolating inlined-frame metrics into
//! their nearest enclosing loop; `flatten` serializes the tree into the flat
//! profile consumed by the aggregation stage.

pub mod builder;
pub mod flatten;
pub mod node;
pub mod writer;

pub use builder::{CallPathDocument, TreeError};
pub use node::{CallTree, Node, NodeId, NodeKind};
