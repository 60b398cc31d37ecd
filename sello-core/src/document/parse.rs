use super::{Attributes, DocumentError, DocumentSnapshot, Element, Node};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

pub(super) fn parse_document(xml: &str) -> Result<DocumentSnapshot, DocumentError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut prolog = Vec::new();
    let mut epilog = Vec::new();
    let mut root: Option<Element> = None;
    let mut stack: Vec<Element> = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| DocumentError::Parse {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        })?;
        let node = match event {
            Event::Start(start) => {
                stack.push(start_element(&start, &reader)?);
                continue;
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                let element = stack
                    .pop()
                    .ok_or_else(|| DocumentError::UnexpectedClose(name))?;
                Node::Element(element)
            }
            Event::Empty(start) => Node::Element(start_element(&start, &reader)?),
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| DocumentError::Parse {
                    position: reader.buffer_position() as u64,
                    message: e.to_string(),
                })?;
                if text.trim().is_empty() {
                    continue;
                }
                Node::Text(text.into_owned())
            }
            Event::CData(data) => {
                Node::CData(String::from_utf8_lossy(&data.into_inner()).into_owned())
            }
            Event::Comment(comment) => Node::Comment(String::from_utf8_lossy(&comment).into_owned()),
            Event::PI(pi) => Node::Instruction(String::from_utf8_lossy(&pi).into_owned()),
            Event::Decl(decl) => Node::Instruction(String::from_utf8_lossy(&decl).into_owned()),
            // DTDs carry nothing the signature covers.
            Event::DocType(_) => continue,
            Event::Eof => break,
        };

        match (stack.last_mut(), node) {
            (Some(parent), node) => parent.children.push(node),
            (None, Node::Element(element)) => {
                if root.is_some() {
                    return Err(DocumentError::MultipleRoots);
                }
                root = Some(element);
            }
            (None, Node::Text(_)) | (None, Node::CData(_)) => {
                return Err(DocumentError::Parse {
                    position: reader.buffer_position() as u64,
                    message: "character data outside the root element".into(),
                });
            }
            (None, misc) if root.is_none() => prolog.push(misc),
            (None, misc) => epilog.push(misc),
        }
    }

    if let Some(open) = stack.pop() {
        return Err(DocumentError::Unclosed(open.name));
    }
    let root = root.ok_or(DocumentError::MissingRoot)?;
    Ok(DocumentSnapshot {
        prolog,
        root,
        epilog,
    })
}

fn start_element(start: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Element, DocumentError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Attributes::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| DocumentError::Parse {
            position: reader.buffer_position() as u64,
            message: format!("bad attribute on <{name}>: {e}"),
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| DocumentError::Parse {
            position: reader.buffer_position() as u64,
            message: format!("bad value for {name}/@{key}: {e}"),
        })?;
        attributes.set(&key, value.into_owned());
    }
    Ok(Element {
        name,
        attributes,
        children: Vec::new(),
    })
}
