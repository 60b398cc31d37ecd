use super::{DocumentSnapshot, Element, Node};
use quick_xml::escape::{escape, partial_escape};

pub(super) fn write_document(doc: &DocumentSnapshot, out: &mut String) {
    for node in &doc.prolog {
        write_node(node, out);
    }
    write_element(&doc.root, out);
    for node in &doc.epilog {
        write_node(node, out);
    }
}

fn write_element(element: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&element.name);
    for attr in element.attributes.iter() {
        out.push(' ');
        out.push_str(&attr.name);
        out.push_str("=\"");
        out.push_str(&escape(attr.value.as_str()));
        out.push('"');
    }
    if element.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &element.children {
        write_node(child, out);
    }
    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Element(el) => write_element(el, out),
        Node::Text(text) => out.push_str(&partial_escape(text.as_str())),
        Node::CData(data) => {
            out.push_str("<![CDATA[");
            out.push_str(data);
            out.push_str("]]>");
        }
        Node::Comment(body) => {
            out.push_str("<!--");
            out.push_str(body);
            out.push_str("-->");
        }
        Node::Instruction(body) => {
            out.push_str("<?");
            out.push_str(body);
            out.push_str("?>");
        }
    }
}

/// Remove whitespace runs that sit between a `>` and the next `<`.
pub fn collapse_inter_tag_whitespace(xml: &str) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut pending = String::new();
    let mut after_tag = false;
    for ch in xml.chars() {
        if after_tag && ch.is_whitespace() {
            pending.push(ch);
            continue;
        }
        if ch != '<' {
            out.push_str(&pending);
        }
        pending.clear();
        out.push(ch);
        after_tag = ch == '>';
    }
    out.push_str(&pending);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_output_round_trips() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?><r a="1 &amp; 2"><x>t &lt; u</x><!-- c --><y/></r>"#;
        let doc = DocumentSnapshot::parse(xml).unwrap();
        assert_eq!(doc.to_xml(), xml);
    }

    #[test]
    fn collapse_only_touches_whitespace_between_tags() {
        assert_eq!(
            collapse_inter_tag_whitespace("<a>\n  <b> x y </b>\n</a>\n"),
            "<a><b> x y </b></a>\n"
        );
        assert_eq!(collapse_inter_tag_whitespace("<a>  text</a>"), "<a>  text</a>");
    }
}
