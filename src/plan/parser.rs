use super::instruction::{Instruction, VerbKind, ROOT_TAG};
use crate::error::FlowError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;

/// Generic element tree before verb mapping.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: BTreeMap<String, String>,
    text: String,
    children: Vec<Element>,
}

fn xml_err(e: impl std::fmt::Display) -> FlowError {
    FlowError::format(format!("malformed document: {}", e))
}

fn element_from(start: &BytesStart<'_>) -> Result<Element, FlowError> {
    let mut element = Element {
        name: String::from_utf8_lossy(start.name().as_ref()).to_string(),
        ..Default::default()
    };
    for attr in start.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value().map_err(xml_err)?.to_string();
        element.attrs.insert(key, value);
    }
    Ok(element)
}

fn parse_tree(xml: &str) -> Result<Element, FlowError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    let mut attach = |stack: &mut Vec<Element>, element: Element| -> Result<(), FlowError> {
        if let Some(parent) = stack.last_mut() {
            parent.children.push(element);
        } else if root.is_none() {
            root = Some(element);
        } else {
            return Err(FlowError::format("document has more than one root element"));
        }
        Ok(())
    };

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let element = element_from(&start)?;
                attach(&mut stack, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| FlowError::format("unbalanced closing tag"))?;
                attach(&mut stack, element)?;
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(xml_err)?;
                match stack.last_mut() {
                    Some(top) => top.text.push_str(&text),
                    None => return Err(FlowError::format("text outside the root element")),
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(FlowError::format("unterminated element"));
    }
    drop(attach);
    root.ok_or_else(|| FlowError::format("empty document"))
}

fn build(element: Element, parent: Option<VerbKind>) -> Result<Instruction, FlowError> {
    let kind = VerbKind::from_tag(&element.name)
        .ok_or_else(|| FlowError::UnrecognizedElement(element.name.clone()))?;

    match parent {
        None if !kind.is_top_level() => {
            return Err(FlowError::format(format!(
                "{} is only valid nested inside another verb",
                kind
            )));
        }
        Some(parent) if !parent.nestables().contains(&kind) => {
            return Err(FlowError::format(format!(
                "{} is not allowed inside {}",
                kind, parent
            )));
        }
        _ => {}
    }
    if kind.nestables().is_empty() && !element.children.is_empty() {
        return Err(FlowError::format(format!(
            "{} cannot contain child elements",
            kind
        )));
    }

    let children = element
        .children
        .into_iter()
        .map(|child| build(child, Some(kind)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Instruction {
        kind,
        attrs: element.attrs,
        text: element.text,
        children,
    })
}

/// Parse a call-flow document into its top-level instruction sequence.
pub fn parse_document(xml: &str) -> Result<Vec<Instruction>, FlowError> {
    let root = parse_tree(xml)?;
    if root.name != ROOT_TAG {
        return Err(FlowError::UnrecognizedElement(root.name));
    }
    root.children
        .into_iter()
        .map(|child| build(child, None))
        .collect()
}
