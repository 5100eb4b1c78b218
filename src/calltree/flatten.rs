//! Depth-first flattening of the call-path tree.

use crate::calltree::builder::CallPathDocument;
use crate::calltree::node::{NodeId, NodeKind};
use crate::calltree::writer::FlatWriter;

const UNKNOWN_NAME: &str = "~unknown~";

/// Module/file context markers are only switched when they change from the
/// previously emitted procedure.
#[derive(Default)]
struct EmitContext {
    module: Option<u64>,
    file: Option<u64>,
}

impl CallPathDocument {
    /// Serialize the tree into the flat profile document consumed by the
    /// aggregation stage.
    pub fn flatten(&self) -> String {
        let mut writer = FlatWriter::new();
        writer.put_header(&self.version, &self.header, &self.profile_name);

        for (index, name) in self.metric_names.iter().enumerate() {
            writer.put_metric(index, name);
        }
        writer.put_intermediate();

        for (index, value) in self.aggregate.iter().enumerate() {
            if *value != 0.0 {
                writer.put_m(index as u64, *value);
            }
        }

        let mut procs = self.real_procs.clone();
        procs.sort_by_key(|&id| match self.tree.node(id).kind {
            NodeKind::Procedure { module, file, .. } => (module, file),
            NodeKind::Loop { .. } => (0, 0),
        });

        if !procs.is_empty() {
            let mut ctx = EmitContext::default();
            for proc in procs {
                self.emit(&mut writer, &mut ctx, proc, true);
            }
            writer.end_procedures();
        }
        writer.put_appendix();
        writer.into_string()
    }

    fn emit(&self, writer: &mut FlatWriter, ctx: &mut EmitContext, id: NodeId, first: bool) {
        let node = self.tree.node(id);
        match node.kind {
            NodeKind::Procedure { ident, line, module, file, alien, .. } => {
                let name = self
                    .proc_names
                    .get(&ident)
                    .map(String::as_str)
                    .unwrap_or(UNKNOWN_NAME);

                if !first && alien {
                    // Inlined/alien child frames flatten to a reference marker.
                    writer.put_proc_frame(ident, name, line);
                    return;
                }

                let switch_module = ctx.module != Some(module);
                if switch_module {
                    if ctx.file.is_some() {
                        writer.end_f();
                    }
                    if ctx.module.is_some() {
                        writer.end_lm();
                    }
                    let module_name = self
                        .module_names
                        .get(&module)
                        .map(String::as_str)
                        .unwrap_or(UNKNOWN_NAME);
                    writer.put_lm(module, module_name);
                }
                ctx.module = Some(module);

                if ctx.file != Some(file) {
                    if !switch_module && ctx.file.is_some() {
                        writer.end_f();
                    }
                    let file_name = self
                        .file_names
                        .get(&file)
                        .map(String::as_str)
                        .unwrap_or(UNKNOWN_NAME);
                    writer.put_f(file, file_name);
                }
                ctx.file = Some(file);

                writer.put_p(ident, name, line);
                for (index, value) in node.metrics_sorted() {
                    writer.put_m(index, value);
                }
                for &child in &node.children {
                    self.emit(writer, ctx, child, false);
                }
                writer.end_p();
            }
            NodeKind::Loop { id: loop_id, stmt, line, .. } => {
                writer.put_l(loop_id, stmt, line);
                for (index, value) in node.metrics_sorted() {
                    writer.put_m(index, value);
                }
                for &child in &node.children {
                    self.emit(writer, ctx, child, false);
                }
                writer.end_l();
            }
        }
    }
}
