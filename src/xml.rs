//! Pull reader for the profile document markup.
//!
//! Profile documents use a restricted XML subset: elements with quoted
//! attributes, self-closing tags, character entities in attribute values,
//! and ignorable text/comments/prolog between elements. The reader walks
//! the input once and hands out open/close events; callers drive it with
//! `next_event()` until it returns `None`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum XmlError {
    #[error("unexpected end of document")]
    UnexpectedEof,
    #[error("malformed markup at byte offset {0}")]
    Malformed(usize),
}

/// An opened element with its attributes in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum XmlEvent {
    Open(Element),
    Close(String),
}

pub struct XmlReader<'a> {
    input: &'a [u8],
    pos: usize,
    /// Close event queued by a self-closing tag.
    pending_close: Option<String>,
}

impl<'a> XmlReader<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            pending_close: None,
        }
    }

    /// Next open/close event, or `None` at end of input.
    pub fn next_event(&mut self) -> Result<Option<XmlEvent>, XmlError> {
        if let Some(name) = self.pending_close.take() {
            return Ok(Some(XmlEvent::Close(name)));
        }

        loop {
            // Discard character data up to the next tag.
            while self.pos < self.input.len() && self.input[self.pos] != b'<' {
                self.pos += 1;
            }
            if self.pos >= self.input.len() {
                return Ok(None);
            }

            if self.skip_if_prefixed(b"<?", b"?>")? || self.skip_if_prefixed(b"<!--", b"-->")? {
                continue;
            }
            if self.input[self.pos..].starts_with(b"<!") {
                // DOCTYPE and friends
                self.skip_past(b">")?;
                continue;
            }

            if self.input[self.pos..].starts_with(b"</") {
                self.pos += 2;
                let name = self.read_name()?;
                self.skip_whitespace();
                self.expect(b'>')?;
                return Ok(Some(XmlEvent::Close(name)));
            }

            self.pos += 1; // consume '<'
            let name = self.read_name()?;
            let mut attrs = Vec::new();
            loop {
                self.skip_whitespace();
                match self.peek()? {
                    b'>' => {
                        self.pos += 1;
                        return Ok(Some(XmlEvent::Open(Element { name, attrs })));
                    }
                    b'/' => {
                        self.pos += 1;
                        self.expect(b'>')?;
                        self.pending_close = Some(name.clone());
                        return Ok(Some(XmlEvent::Open(Element { name, attrs })));
                    }
                    _ => {
                        let key = self.read_name()?;
                        self.skip_whitespace();
                        self.expect(b'=')?;
                        self.skip_whitespace();
                        let value = self.read_quoted()?;
                        attrs.push((key, value));
                    }
                }
            }
        }
    }

    fn peek(&self) -> Result<u8, XmlError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(XmlError::UnexpectedEof)
    }

    fn expect(&mut self, byte: u8) -> Result<(), XmlError> {
        if self.peek()? != byte {
            return Err(XmlError::Malformed(self.pos));
        }
        self.pos += 1;
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while self
            .input
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn skip_if_prefixed(&mut self, prefix: &[u8], until: &[u8]) -> Result<bool, XmlError> {
        if !self.input[self.pos..].starts_with(prefix) {
            return Ok(false);
        }
        self.pos += prefix.len();
        self.skip_past(until)?;
        Ok(true)
    }

    fn skip_past(&mut self, marker: &[u8]) -> Result<(), XmlError> {
        while self.pos < self.input.len() {
            if self.input[self.pos..].starts_with(marker) {
                self.pos += marker.len();
                return Ok(());
            }
            self.pos += 1;
        }
        Err(XmlError::UnexpectedEof)
    }

    fn read_name(&mut self) -> Result<String, XmlError> {
        let start = self.pos;
        while self.input.get(self.pos).is_some_and(|&b| {
            !b.is_ascii_whitespace() && !matches!(b, b'=' | b'>' | b'/' | b'<')
        }) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(XmlError::Malformed(self.pos));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn read_quoted(&mut self) -> Result<String, XmlError> {
        let quote = self.peek()?;
        if quote != b'"' && quote != b'\'' {
            return Err(XmlError::Malformed(self.pos));
        }
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != quote {
            self.pos += 1;
        }
        let raw = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        self.pos += 1; // closing quote
        Ok(unescape(&raw))
    }
}

/// Expand the character entities the document format uses.
pub fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Escape a string for use inside a quoted attribute value.
pub fn escape(value: &str) -> String {
    if !value.contains(['&', '<', '>', '"']) {
        return value.to_string();
    }
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
