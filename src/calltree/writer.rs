//! Flat-document emission.
//!
//! The flat profile keeps the element shapes of the call-path input (module,
//! file, procedure, loop, metric) but with all nesting reduced to the
//! procedure/loop skeleton, so the aggregator can consume it with the same
//! closing discipline.

use crate::xml::escape;
use std::fmt::Write;

#[derive(Debug, Default)]
pub struct FlatWriter {
    out: String,
}

impl FlatWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_string(self) -> String {
        self.out
    }

    pub fn put_header(&mut self, version: &str, header: &str, profile: &str) {
        let _ = write!(
            self.out,
            "<HPCToolkitExperiment version=\"{}\">\n<Header n=\"{}\">\n  <Info/>\n</Header>\n\
             <SecFlatProfile i=\"0\" n=\"{}\">\n<SecHeader>\n <MetricTable>\n",
            escape(version),
            escape(header),
            escape(profile)
        );
    }

    pub fn put_metric(&mut self, index: usize, name: &str) {
        let _ = write!(
            self.out,
            "    <Metric i=\"{}\" n=\"{} (E)\" v=\"final\" t=\"exclusive\" s=\"1\"> </Metric>\n",
            index,
            escape(name)
        );
    }

    pub fn put_intermediate(&mut self) {
        self.out
            .push_str(" </MetricTable>\n</SecHeader>\n<SecFlatProfileData>\n");
    }

    pub fn put_m(&mut self, index: u64, value: f64) {
        let _ = write!(self.out, "<M n=\"{}\" v=\"{}\"/>", index, value);
    }

    pub fn put_lm(&mut self, id: u64, name: &str) {
        let _ = write!(
            self.out,
            "\n<LM i=\"{}\" n=\"Load module {}\">",
            id,
            escape(name)
        );
    }

    pub fn put_f(&mut self, id: u64, name: &str) {
        let _ = write!(self.out, "\n <F i=\"{}\" n=\"{}\">", id, escape(name));
    }

    pub fn put_p(&mut self, ident: u64, name: &str, line: u64) {
        let _ = write!(
            self.out,
            "\n <P i=\"{}\" n=\"{}\" l=\"{}\">\n",
            ident,
            escape(name),
            line
        );
    }

    pub fn put_l(&mut self, id: u64, stmt: u64, line: u64) {
        let _ = write!(self.out, "\n<L i=\"{}\" s=\"{}\" l=\"{}\">\n", id, stmt, line);
    }

    /// Lightweight reference marker standing in for an inlined/alien frame.
    pub fn put_proc_frame(&mut self, ident: u64, name: &str, line: u64) {
        let _ = write!(
            self.out,
            "<C i=\"0\" l=\"0\"><PF i=\"{}\" n=\"{}\" l=\"{}\"/></C>",
            ident,
            escape(name),
            line
        );
    }

    pub fn end_p(&mut self) {
        self.out.push_str("\n</P>");
    }

    pub fn end_l(&mut self) {
        self.out.push_str("\n</L>");
    }

    pub fn end_f(&mut self) {
        self.out.push_str("</F>");
    }

    pub fn end_lm(&mut self) {
        self.out.push_str("</LM>");
    }

    pub fn end_procedures(&mut self) {
        self.out.push_str("</F></LM>");
    }

    pub fn put_appendix(&mut self) {
        self.out
            .push_str("</SecFlatProfileData></SecFlatProfile></HPCToolkitExperiment>\n");
    }
}
