//! The tree node every stanza decodes to.

use std::collections::BTreeMap;
use std::fmt;

use crate::types::Jid;

/// Node attributes, kept sorted so encoding is deterministic
pub type Attrs = BTreeMap<String, String>;

/// Payload of a node
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Content {
    /// No content
    #[default]
    None,
    /// Opaque bytes (ciphertext, serialized identities)
    Bytes(Vec<u8>),
    /// Child nodes
    Nodes(Vec<Node>),
}

/// A protocol stanza: tag, attributes and content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Element name
    pub tag: String,
    /// Attributes
    pub attrs: Attrs,
    /// Content
    pub content: Content,
}

impl Node {
    /// Create a node with no attributes or content
    pub fn new(tag: impl Into<String>) -> Self {
        Node {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: Content::None,
        }
    }

    /// Builder: set an attribute
    pub fn attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.insert(key.into(), value.to_string());
        self
    }

    /// Builder: set child nodes
    pub fn children_nodes(mut self, children: Vec<Node>) -> Self {
        self.content = Content::Nodes(children);
        self
    }

    /// Builder: set byte content
    pub fn bytes_content(mut self, bytes: Vec<u8>) -> Self {
        self.content = Content::Bytes(bytes);
        self
    }

    /// Attribute value
    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Attribute parsed as a JID
    pub fn attr_jid(&self, key: &str) -> Option<Jid> {
        self.get_attr(key).and_then(|v| v.parse().ok())
    }

    /// Attribute parsed as an integer
    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.get_attr(key).and_then(|v| v.parse().ok())
    }

    /// Child nodes, empty when the content is not a list
    pub fn children(&self) -> &[Node] {
        match &self.content {
            Content::Nodes(nodes) => nodes,
            _ => &[],
        }
    }

    /// First child with the given tag
    pub fn child_by_tag(&self, tag: &str) -> Option<&Node> {
        self.children().iter().find(|c| c.tag == tag)
    }

    /// Follow a path of tags through first matching children
    pub fn child_by_path(&self, path: &[&str]) -> Option<&Node> {
        path.iter()
            .try_fold(self, |node, tag| node.child_by_tag(tag))
    }

    /// All children with the given tag
    pub fn children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children().iter().filter(move |c| c.tag == tag)
    }

    /// Byte content, if any
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            Content::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (k, v) in &self.attrs {
            write!(f, " {}=\"{}\"", k, v)?;
        }
        match &self.content {
            Content::None => write!(f, "/>"),
            Content::Bytes(b) => write!(f, "><!-- {} bytes --></{}>", b.len(), self.tag),
            Content::Nodes(nodes) => {
                write!(f, ">")?;
                for node in nodes {
                    write!(f, "{}", node)?;
                }
                write!(f, "</{}>", self.tag)
            }
        }
    }
}
