//! Minimal streaming XML reader and writer for the property protocol.
//!
//! The protocol is a stream of top-level elements with no document root.
//! [`XmlParser`] is fed arbitrary byte slices as they arrive from a socket
//! and returns every top-level element completed by that slice. It keeps
//! only what routing needs: tags, attributes, child elements and text.
//! Processing instructions, comments and declarations are skipped.

use std::borrow::Cow;

use crate::error::{Result, ServerError};

/// One parsed element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    /// Tag name.
    pub tag: String,
    /// Attributes in document order.
    pub attrs: Vec<(String, String)>,
    /// Child elements.
    pub children: Vec<XmlElement>,
    /// Concatenated character data, unescaped.
    pub text: String,
}

impl XmlElement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder-style text setter.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Sets or replaces an attribute, keeping its original position.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => *v = value,
            None => self.attrs.push((name, value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|(k, _)| k == name)?;
        Some(self.attrs.remove(pos).1)
    }

    /// Serializes the element and its subtree.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_open_tag(out, &self.tag, &self.attrs);
        if self.children.is_empty() && self.text.is_empty() {
            out.pop();
            out.extend_from_slice(b"/>");
            return;
        }
        out.extend_from_slice(escape(&self.text).as_bytes());
        for child in &self.children {
            child.write_to(out);
        }
        write_close_tag(out, &self.tag);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.write_to(&mut out);
        out.push(b'\n');
        out
    }
}

/// Writes `<tag attr="value" ...>`.
pub(crate) fn write_open_tag(out: &mut Vec<u8>, tag: &str, attrs: &[(String, String)]) {
    out.push(b'<');
    out.extend_from_slice(tag.as_bytes());
    for (k, v) in attrs {
        out.push(b' ');
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(b"=\"");
        out.extend_from_slice(escape(v).as_bytes());
        out.push(b'"');
    }
    out.push(b'>');
}

/// Writes `</tag>`.
pub(crate) fn write_close_tag(out: &mut Vec<u8>, tag: &str) {
    out.extend_from_slice(b"</");
    out.extend_from_slice(tag.as_bytes());
    out.push(b'>');
}

/// Escapes markup characters for text and attribute values.
pub fn escape(s: &str) -> Cow<'_, str> {
    if !s.bytes().any(|b| matches!(b, b'&' | b'<' | b'>' | b'"' | b'\'')) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Resolves the predefined and numeric character entities.
///
/// Unknown entities are kept verbatim.
pub fn unescape(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..semi];
        let resolved = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match resolved {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Open,
    TagName,
    InTag,
    AttrName,
    AfterAttrName,
    BeforeValue,
    Value,
    SelfClose,
    EndTag,
    EndTagTail,
    Pi,
    PiEnd,
    Bang,
    BangDash,
    Decl,
    Comment,
    CommentDash,
    CommentDashDash,
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':' || b >= 0x80
}

fn is_name_char(b: u8) -> bool {
    is_name_start(b) || b.is_ascii_digit() || b == b'-' || b == b'.'
}

/// Incremental parser for a stream of top-level elements.
#[derive(Debug)]
pub struct XmlParser {
    max_element_bytes: usize,
    state: State,
    stack: Vec<XmlElement>,
    name: Vec<u8>,
    value: Vec<u8>,
    text: Vec<u8>,
    quote: u8,
    tag: String,
    attrs: Vec<(String, String)>,
    element_bytes: usize,
}

impl XmlParser {
    /// Creates a parser rejecting any single element larger than
    /// `max_element_bytes`.
    pub fn new(max_element_bytes: usize) -> Self {
        Self {
            max_element_bytes,
            state: State::Text,
            stack: Vec::new(),
            name: Vec::new(),
            value: Vec::new(),
            text: Vec::new(),
            quote: b'"',
            tag: String::new(),
            attrs: Vec::new(),
            element_bytes: 0,
        }
    }

    /// Returns true if no element is partially parsed.
    pub fn is_idle(&self) -> bool {
        self.state == State::Text && self.stack.is_empty()
    }

    /// Consumes `input` and returns the top-level elements it completed.
    ///
    /// Any error leaves the parser in an unusable state; the stream is
    /// corrupt and the connection should be dropped.
    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<XmlElement>> {
        let mut done = Vec::new();
        let mut i = 0;

        while i < input.len() {
            // Bulk copy of character data inside an element.
            if self.state == State::Text && !self.stack.is_empty() {
                let run = input[i..]
                    .iter()
                    .position(|&b| b == b'<')
                    .unwrap_or(input.len() - i);
                self.text.extend_from_slice(&input[i..i + run]);
                self.count(run)?;
                i += run;
                if i == input.len() {
                    break;
                }
            }

            let b = input[i];
            i += 1;
            if self.state != State::Text || !self.stack.is_empty() || b == b'<' {
                self.count(1)?;
            }
            self.step(b, &mut done)?;
        }

        Ok(done)
    }

    fn count(&mut self, n: usize) -> Result<()> {
        self.element_bytes += n;
        if self.element_bytes > self.max_element_bytes {
            return Err(ServerError::framing(format!(
                "element exceeds {} bytes",
                self.max_element_bytes
            )));
        }
        Ok(())
    }

    fn step(&mut self, b: u8, done: &mut Vec<XmlElement>) -> Result<()> {
        match self.state {
            State::Text => {
                if b == b'<' {
                    self.flush_text();
                    self.state = State::Open;
                } else if self.stack.is_empty() {
                    if !b.is_ascii_whitespace() {
                        return Err(ServerError::framing("text outside of any element"));
                    }
                } else {
                    self.text.push(b);
                }
            }
            State::Open => match b {
                b'/' => {
                    self.name.clear();
                    self.state = State::EndTag;
                }
                b'?' => self.state = State::Pi,
                b'!' => self.state = State::Bang,
                _ if is_name_start(b) => {
                    self.name.clear();
                    self.name.push(b);
                    self.state = State::TagName;
                }
                _ => return Err(self.unexpected(b)),
            },
            State::TagName => match b {
                _ if is_name_char(b) => self.name.push(b),
                _ if b.is_ascii_whitespace() => {
                    self.tag = self.take_name();
                    self.state = State::InTag;
                }
                b'>' => {
                    self.tag = self.take_name();
                    self.open_element(false, done);
                }
                b'/' => {
                    self.tag = self.take_name();
                    self.state = State::SelfClose;
                }
                _ => return Err(self.unexpected(b)),
            },
            State::InTag => match b {
                _ if b.is_ascii_whitespace() => {}
                b'>' => self.open_element(false, done),
                b'/' => self.state = State::SelfClose,
                _ if is_name_start(b) => {
                    self.name.clear();
                    self.name.push(b);
                    self.state = State::AttrName;
                }
                _ => return Err(self.unexpected(b)),
            },
            State::AttrName => match b {
                _ if is_name_char(b) => self.name.push(b),
                _ if b.is_ascii_whitespace() => self.state = State::AfterAttrName,
                b'=' => self.state = State::BeforeValue,
                _ => return Err(self.unexpected(b)),
            },
            State::AfterAttrName => match b {
                _ if b.is_ascii_whitespace() => {}
                b'=' => self.state = State::BeforeValue,
                _ => return Err(self.unexpected(b)),
            },
            State::BeforeValue => match b {
                _ if b.is_ascii_whitespace() => {}
                b'"' | b'\'' => {
                    self.quote = b;
                    self.value.clear();
                    self.state = State::Value;
                }
                _ => return Err(self.unexpected(b)),
            },
            State::Value => {
                if b == self.quote {
                    let name = self.take_name();
                    let raw = String::from_utf8_lossy(&self.value);
                    let value = unescape(&raw).into_owned();
                    self.attrs.push((name, value));
                    self.state = State::InTag;
                } else if b == b'<' {
                    return Err(self.unexpected(b));
                } else {
                    self.value.push(b);
                }
            }
            State::SelfClose => match b {
                b'>' => self.open_element(true, done),
                _ => return Err(self.unexpected(b)),
            },
            State::EndTag => match b {
                _ if is_name_char(b) => self.name.push(b),
                _ if b.is_ascii_whitespace() => self.state = State::EndTagTail,
                b'>' => self.close_element(done)?,
                _ => return Err(self.unexpected(b)),
            },
            State::EndTagTail => match b {
                _ if b.is_ascii_whitespace() => {}
                b'>' => self.close_element(done)?,
                _ => return Err(self.unexpected(b)),
            },
            State::Pi => {
                if b == b'?' {
                    self.state = State::PiEnd;
                }
            }
            State::PiEnd => match b {
                b'>' => self.state = State::Text,
                b'?' => {}
                _ => self.state = State::Pi,
            },
            State::Bang => {
                self.state = match b {
                    b'-' => State::BangDash,
                    b'>' => State::Text,
                    _ => State::Decl,
                }
            }
            State::BangDash => {
                self.state = match b {
                    b'-' => State::Comment,
                    b'>' => State::Text,
                    _ => State::Decl,
                }
            }
            State::Decl => {
                if b == b'>' {
                    self.state = State::Text;
                }
            }
            State::Comment => {
                if b == b'-' {
                    self.state = State::CommentDash;
                }
            }
            State::CommentDash => {
                self.state = if b == b'-' {
                    State::CommentDashDash
                } else {
                    State::Comment
                }
            }
            State::CommentDashDash => match b {
                b'>' => self.state = State::Text,
                b'-' => {}
                _ => self.state = State::Comment,
            },
        }
        Ok(())
    }

    fn unexpected(&self, b: u8) -> ServerError {
        ServerError::framing(format!(
            "unexpected {:?} while in {:?}",
            char::from(b),
            self.state
        ))
    }

    fn take_name(&mut self) -> String {
        let name = String::from_utf8_lossy(&self.name).into_owned();
        self.name.clear();
        name
    }

    fn flush_text(&mut self) {
        if self.text.is_empty() {
            return;
        }
        if let Some(top) = self.stack.last_mut() {
            let raw = String::from_utf8_lossy(&self.text);
            top.text.push_str(&unescape(&raw));
        }
        self.text.clear();
    }

    fn open_element(&mut self, self_closing: bool, done: &mut Vec<XmlElement>) {
        let element = XmlElement {
            tag: std::mem::take(&mut self.tag),
            attrs: std::mem::take(&mut self.attrs),
            children: Vec::new(),
            text: String::new(),
        };
        self.state = State::Text;
        if self_closing {
            self.complete(element, done);
        } else {
            self.stack.push(element);
        }
    }

    fn close_element(&mut self, done: &mut Vec<XmlElement>) -> Result<()> {
        let name = self.take_name();
        let element = match self.stack.pop() {
            Some(top) if top.tag == name => top,
            Some(top) => {
                return Err(ServerError::framing(format!(
                    "closing tag </{}> does not match <{}>",
                    name, top.tag
                )))
            }
            None => {
                return Err(ServerError::framing(format!(
                    "closing tag </{}> without opening tag",
                    name
                )))
            }
        };
        self.state = State::Text;
        self.complete(element, done);
        Ok(())
    }

    fn complete(&mut self, element: XmlElement, done: &mut Vec<XmlElement>) {
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => {
                self.element_bytes = 0;
                done.push(element);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_all(input: &str) -> Vec<XmlElement> {
        XmlParser::new(1 << 20).feed(input.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_simple_vector() {
        let elems = parse_all(
            r#"<defNumberVector device="Cam" name="temperature" perm="rw">
  <defNumber name="value" format="%.2f">20.5</defNumber>
</defNumberVector>"#,
        );
        assert_eq!(elems.len(), 1);
        let root = &elems[0];
        assert_eq!(root.tag, "defNumberVector");
        assert_eq!(root.attr("device"), Some("Cam"));
        assert_eq!(root.attr("name"), Some("temperature"));
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].attr("format"), Some("%.2f"));
        assert_eq!(root.children[0].text, "20.5");
    }

    #[test]
    fn test_parse_split_at_every_byte() {
        let input = br#"<?xml version="1.0"?><getProperties version='1.7' device="Cam"/><!-- hi --><message device="Cam" message="a &amp; b"/>"#;
        let mut parser = XmlParser::new(1 << 20);
        let mut elems = Vec::new();
        for b in input.iter() {
            elems.extend(parser.feed(std::slice::from_ref(b)).unwrap());
        }
        assert!(parser.is_idle());
        assert_eq!(elems.len(), 2);
        assert_eq!(elems[0].tag, "getProperties");
        assert_eq!(elems[0].attr("version"), Some("1.7"));
        assert_eq!(elems[1].attr("message"), Some("a & b"));
    }

    #[test]
    fn test_multiple_elements_in_one_feed() {
        let elems = parse_all("<a/>\n<b x=\"1\"></b>\n<c>t</c>");
        let tags: Vec<_> = elems.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_partial_element_is_retained() {
        let mut parser = XmlParser::new(1 << 20);
        assert!(parser.feed(b"<setTextVector device=\"Cam\" na").unwrap().is_empty());
        assert!(!parser.is_idle());
        let elems = parser.feed(b"me=\"x\"><oneText name=\"t\">hello</oneText></setTextVector>").unwrap();
        assert_eq!(elems.len(), 1);
        assert_eq!(elems[0].attr("name"), Some("x"));
        assert_eq!(elems[0].children[0].text, "hello");
    }

    #[test]
    fn test_mismatched_close_is_framing_error() {
        let err = XmlParser::new(1024).feed(b"<a><b></a>").unwrap_err();
        assert!(matches!(err, ServerError::Framing(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_stray_text_is_framing_error() {
        let err = XmlParser::new(1024).feed(b"garbage").unwrap_err();
        assert!(matches!(err, ServerError::Framing(_)));
    }

    #[test]
    fn test_element_size_limit() {
        let mut parser = XmlParser::new(32);
        assert!(parser.feed(b"<a>short</a>").is_ok());
        let err = parser
            .feed(b"<a>this text is much longer than thirty two bytes</a>")
            .unwrap_err();
        assert!(matches!(err, ServerError::Framing(_)));
    }

    #[test]
    fn test_limit_resets_between_elements() {
        let mut parser = XmlParser::new(16);
        for _ in 0..10 {
            assert_eq!(parser.feed(b"<a>0123</a>").unwrap().len(), 1);
        }
    }

    #[test]
    fn test_entities() {
        assert_eq!(unescape("&lt;&#65;&#x42;&unknown;&gt;"), "<AB&unknown;>");
        assert_eq!(unescape("plain"), "plain");
        assert_eq!(escape(r#"a<b & "c""#), "a&lt;b &amp; &quot;c&quot;");
    }

    #[test]
    fn test_write_round_trip() {
        let elem = XmlElement::new("newSwitchVector")
            .with_attr("device", "Mount & Co")
            .with_attr("name", "CONNECTION")
            .with_child(
                XmlElement::new("oneSwitch")
                    .with_attr("name", "CONNECT")
                    .with_text("On"),
            );
        let bytes = elem.to_bytes();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            "<newSwitchVector device=\"Mount &amp; Co\" name=\"CONNECTION\"><oneSwitch name=\"CONNECT\">On</oneSwitch></newSwitchVector>\n"
        );

        let parsed = XmlParser::new(1024).feed(&bytes).unwrap();
        assert_eq!(parsed, vec![elem]);
    }

    #[test]
    fn test_empty_element_writes_self_closing() {
        let elem = XmlElement::new("getProperties").with_attr("version", "1.7");
        assert_eq!(elem.to_bytes(), b"<getProperties version=\"1.7\"/>\n".to_vec());
    }

    #[test]
    fn test_set_and_remove_attr() {
        let mut elem = XmlElement::new("oneBLOB").with_attr("name", "img");
        elem.set_attr("name", "frame");
        elem.set_attr("attached", "true");
        assert_eq!(
            elem.attrs,
            vec![
                ("name".to_string(), "frame".to_string()),
                ("attached".to_string(), "true".to_string())
            ]
        );
        assert_eq!(elem.remove_attr("attached"), Some("true".to_string()));
        assert_eq!(elem.remove_attr("attached"), None);
    }
}
