use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::SourceFormat;
use crate::error::ExtractError;

/// Element kinds of the gazette schema. Everything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Process,
    Dispatch,
    Classification,
    Status,
    Holder,
    Mark,
    Name,
    Agent,
    Specification,
    Translation,
    Other,
}

impl NodeKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "processo" => NodeKind::Process,
            "despacho" => NodeKind::Dispatch,
            "classe-nice" => NodeKind::Classification,
            "status" => NodeKind::Status,
            "titular" => NodeKind::Holder,
            "marca" => NodeKind::Mark,
            "nome" => NodeKind::Name,
            "procurador" => NodeKind::Agent,
            "especificacao" => NodeKind::Specification,
            "traducao-especificacao" => NodeKind::Translation,
            t if t.eq_ignore_ascii_case("revista") => NodeKind::Root,
            _ => NodeKind::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub tag: String,
    attrs: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<Node>,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Direct text content, trimmed. `None` when blank.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn child(&self, kind: NodeKind) -> Option<&Node> {
        self.children.iter().find(|c| c.kind == kind)
    }

    /// Every node below this one, depth-first in document order.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            stack: self.children.iter().rev().collect(),
        }
    }

    pub fn find(&self, kind: NodeKind) -> Option<&Node> {
        self.descendants().find(|n| n.kind == kind)
    }

    pub fn find_all(&self, kind: NodeKind) -> impl Iterator<Item = &Node> {
        self.descendants().filter(move |n| n.kind == kind)
    }
}

pub struct Descendants<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Element under construction. Raw text and CDATA pieces are collected as-is
/// and trimmed once when the element closes.
struct OpenNode {
    node: Node,
    text: String,
}

impl OpenNode {
    fn close(mut self) -> Node {
        let text = self.text.trim();
        self.node.text = (!text.is_empty()).then(|| text.to_string());
        self.node
    }
}

/// Parse a whole UTF-8 XML document into a node tree rooted at its document
/// element.
pub fn parse_document(bytes: &[u8]) -> Result<Node, ExtractError> {
    let mut reader = Reader::from_reader(bytes);

    let mut buf = Vec::new();
    let mut stack: Vec<OpenNode> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let node = open_node(&e)?;
                if stack.is_empty() && root.is_some() {
                    return Err(multiple_roots(&node.node.tag));
                }
                stack.push(node);
            }
            Event::Empty(e) => {
                let node = open_node(&e)?.close();
                attach(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| ExtractError::structural(SourceFormat::Xml, "closing tag without an open element"))?
                    .close();
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(e) => {
                let text = e.unescape()?;
                push_text(&mut stack, text);
            }
            Event::CData(e) => {
                let text = std::str::from_utf8(&e)
                    .map_err(|err| ExtractError::structural(SourceFormat::Xml, format!("CDATA is not UTF-8: {err}")))?;
                push_text(&mut stack, Cow::Borrowed(text));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(ExtractError::structural(
            SourceFormat::Xml,
            format!("document ends inside <{}>", open.node.tag),
        ));
    }
    root.ok_or_else(|| ExtractError::structural(SourceFormat::Xml, "document has no root element"))
}

fn open_node(e: &BytesStart) -> Result<OpenNode, ExtractError> {
    let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        let value = attr.unescape_value()?.to_string();
        attrs.push((key, value));
    }
    Ok(OpenNode {
        node: Node {
            kind: NodeKind::from_tag(&tag),
            tag,
            attrs,
            text: None,
            children: Vec::new(),
        },
        text: String::new(),
    })
}

fn attach(stack: &mut [OpenNode], root: &mut Option<Node>, node: Node) -> Result<(), ExtractError> {
    match stack.last_mut() {
        Some(parent) => parent.node.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(multiple_roots(&node.tag)),
    }
    Ok(())
}

// Text outside the document element is ignored.
fn push_text(stack: &mut [OpenNode], text: Cow<'_, str>) {
    if let Some(open) = stack.last_mut() {
        open.text.push_str(&text);
    }
}

fn multiple_roots(tag: &str) -> ExtractError {
    ExtractError::structural(
        SourceFormat::Xml,
        format!("unexpected second root element <{}>", tag),
    )
}
