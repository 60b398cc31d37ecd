//! Document tree with an explicit, ordered attribute list.
//!
//! The tree is the single source of the bytes that get canonicalized and the
//! bytes that get returned, so the serialized form is fully determined by the
//! tree: attribute order is whatever order the attributes sit in the list, and
//! whitespace-only text between tags is dropped on parse.
mod parse;
mod write;

pub use write::collapse_inter_tag_whitespace;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while reading a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("XML parse error at byte {position}: {message}")]
    Parse { position: u64, message: String },
    #[error("document has no root element")]
    MissingRoot,
    #[error("document has more than one root element")]
    MultipleRoots,
    #[error("unexpected closing tag </{0}>")]
    UnexpectedClose(String),
    #[error("element <{0}> is never closed")]
    Unclosed(String),
    #[error("invalid document kind: {input}")]
    InvalidKind { input: String },
}

/// Document subtype. Selects the transformation resource and the business
/// rules that apply before signing.
///
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use sello_core::document::DocumentKind;
///
/// let kind = DocumentKind::from_str("payment")?;
/// assert_eq!(kind, DocumentKind::PaymentComplement);
/// assert_eq!(kind.timestamp_attribute(), "Fecha");
/// # Ok::<(), sello_core::document::DocumentError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Invoice,
    PaymentComplement,
    Withholding,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 3] = [
        DocumentKind::Invoice,
        DocumentKind::PaymentComplement,
        DocumentKind::Withholding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "invoice",
            DocumentKind::PaymentComplement => "payment_complement",
            DocumentKind::Withholding => "withholding",
        }
    }

    /// Root attribute holding the issue timestamp.
    pub fn timestamp_attribute(&self) -> &'static str {
        match self {
            DocumentKind::Invoice | DocumentKind::PaymentComplement => "Fecha",
            DocumentKind::Withholding => "FechaExp",
        }
    }

    /// Whether the receiver usage/regime code rules apply to this kind.
    pub fn has_receiver_codes(&self) -> bool {
        !matches!(self, DocumentKind::Withholding)
    }
}

impl FromStr for DocumentKind {
    type Err = DocumentError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "invoice" | "ingreso" | "egreso" | "traslado" => Ok(DocumentKind::Invoice),
            "payment" | "payment_complement" | "pago" | "pagos" => {
                Ok(DocumentKind::PaymentComplement)
            }
            "withholding" | "retenciones" => Ok(DocumentKind::Withholding),
            _ => Err(DocumentError::InvalidKind {
                input: input.to_string(),
            }),
        }
    }
}

/// Single `name="value"` pair on an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// Outcome of [`Attributes::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeChange {
    Unchanged,
    Replaced { previous: String },
    Appended,
}

/// Ordered attribute list. Updating an attribute keeps its slot, new
/// attributes go last, and removal never reorders the survivors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<Attribute>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| attr.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|attr| attr.name == name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) -> AttributeChange {
        let value = value.into();
        match self.0.iter_mut().find(|attr| attr.name == name) {
            Some(attr) if attr.value == value => AttributeChange::Unchanged,
            Some(attr) => AttributeChange::Replaced {
                previous: std::mem::replace(&mut attr.value, value),
            },
            None => {
                self.0.push(Attribute {
                    name: name.to_string(),
                    value,
                });
                AttributeChange::Appended
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.position(name)?;
        Some(self.0.remove(index).value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|attr| attr.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut attributes = Attributes::new();
        for (name, value) in iter {
            attributes.set(&name, value);
        }
        attributes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    /// Raw comment body, written back verbatim.
    Comment(String),
    /// Raw processing-instruction body (`target data`).
    Instruction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Attributes,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Attributes::new(),
            children: Vec::new(),
        }
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        self.name
            .split_once(':')
            .map(|(_, local)| local)
            .unwrap_or(&self.name)
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
    }

    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.child_elements()
            .find(|el| el.local_name() == local_name)
    }

    pub fn child_mut(&mut self, local_name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|node| match node {
            Node::Element(el) if el.local_name() == local_name => Some(el),
            _ => None,
        })
    }

    fn collect_namespaces<'a>(&'a self, out: &mut Vec<&'a str>) {
        for attr in self.attributes.iter() {
            if attr.name == "xmlns" || attr.name.starts_with("xmlns:") {
                out.push(attr.value.as_str());
            }
        }
        for child in self.child_elements() {
            child.collect_namespaces(out);
        }
    }
}

/// Parsed document: prolog items (declaration, comments, instructions), the
/// single root element, and any trailing misc items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    prolog: Vec<Node>,
    root: Element,
    epilog: Vec<Node>,
}

impl DocumentSnapshot {
    pub fn new(root: Element) -> Self {
        Self {
            prolog: Vec::new(),
            root,
            epilog: Vec::new(),
        }
    }

    /// Parse a document from its string form.
    ///
    /// # Examples
    /// ```rust
    /// use sello_core::document::DocumentSnapshot;
    ///
    /// let doc = DocumentSnapshot::parse("<a:Root x=\"1\" y=\"2\">\n  <a:Child/>\n</a:Root>")?;
    /// assert_eq!(doc.root().local_name(), "Root");
    /// assert_eq!(doc.to_xml(), "<a:Root x=\"1\" y=\"2\"><a:Child/></a:Root>");
    /// # Ok::<(), sello_core::document::DocumentError>(())
    /// ```
    pub fn parse(xml: &str) -> Result<Self, DocumentError> {
        parse::parse_document(xml)
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    pub fn prolog(&self) -> &[Node] {
        &self.prolog
    }

    /// Compact serialization; no indentation is ever added.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        write::write_document(self, &mut out);
        out
    }

    /// Every namespace URI declared anywhere in the tree.
    pub fn namespace_uris(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.root.collect_namespaces(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }
}
