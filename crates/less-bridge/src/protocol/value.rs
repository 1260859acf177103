//! Tagged binary encoding of the values that cross the persistent protocol.
//!
//! ```text
//! 0 null
//! 1 dimension   value f64 | unit str
//! 2 color       count u8 (3 or 4) | components f64 * count
//! 3 quoted      quote u8 | escaped u8 | value str
//! 4 keyword     value str
//! 5 expression  count u32 | items
//! 6 number      value f64
//! 7 boolean     u8
//! ```
//!
//! `str` is a `length:u32` prefix followed by UTF-8 bytes.
use less_flat::io::{read_f64_at, read_str_at, read_u8_at, read_u32_at, write_f64, write_str, write_u32};
use less_flat::{Node, NodeData, NodeFlags};
use strum::FromRepr;

use super::ProtocolError;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
enum Tag {
    Null = 0,
    Dimension = 1,
    Color = 2,
    Quoted = 3,
    Keyword = 4,
    Expression = 5,
    Number = 6,
    Boolean = 7,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Dimension { value: f64, unit: String },
    Color { rgb: [f64; 3], alpha: Option<f64> },
    Quoted { quote: u8, escaped: bool, value: String },
    Keyword(String),
    Expression(Vec<WireValue>),
    Number(f64),
    Boolean(bool),
}

impl WireValue {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            WireValue::Null => out.push(Tag::Null as u8),
            WireValue::Dimension { value, unit } => {
                out.push(Tag::Dimension as u8);
                write_f64(out, *value);
                write_str(out, unit)?;
            }
            WireValue::Color { rgb, alpha } => {
                out.push(Tag::Color as u8);
                out.push(if alpha.is_some() { 4 } else { 3 });
                for component in rgb.iter().chain(alpha.iter()) {
                    write_f64(out, *component);
                }
            }
            WireValue::Quoted { quote, escaped, value } => {
                out.push(Tag::Quoted as u8);
                out.push(*quote);
                out.push(u8::from(*escaped));
                write_str(out, value)?;
            }
            WireValue::Keyword(value) => {
                out.push(Tag::Keyword as u8);
                write_str(out, value)?;
            }
            WireValue::Expression(items) => {
                out.push(Tag::Expression as u8);
                write_u32(out, less_flat::io::to_u32(items.len())?);
                for item in items {
                    item.encode(out)?;
                }
            }
            WireValue::Number(value) => {
                out.push(Tag::Number as u8);
                write_f64(out, *value);
            }
            WireValue::Boolean(value) => {
                out.push(Tag::Boolean as u8);
                out.push(u8::from(*value));
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    pub fn decode(data: &[u8], offset: &mut usize) -> Result<Self, ProtocolError> {
        decode_at(data, offset, 0)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut offset = 0;
        Self::decode(data, &mut offset)
    }

    /// Converts a tree node. Kinds without a binary form become `Null`.
    pub fn from_node(node: &Node) -> Self {
        match &node.data {
            NodeData::Dimension { value, unit } => WireValue::Dimension {
                value: *value,
                unit: unit.clone(),
            },
            NodeData::Color { rgb, alpha, .. } => WireValue::Color {
                rgb: *rgb,
                alpha: (*alpha != 1.0).then_some(*alpha),
            },
            NodeData::Quoted { quote, value, escaped } => WireValue::Quoted {
                quote: u8::try_from(*quote).unwrap_or(b'"'),
                escaped: *escaped,
                value: value.clone(),
            },
            NodeData::Keyword { value } | NodeData::Anonymous { value } => WireValue::Keyword(value.clone()),
            NodeData::Expression { items } | NodeData::Value { items } | NodeData::Arguments { items } => {
                WireValue::Expression(items.iter().map(WireValue::from_node).collect())
            }
            _ => WireValue::Null,
        }
    }

    /// Whether `node` survives [`WireValue::from_node`] and [`WireValue::to_node`] unchanged:
    /// same kind, same payload, no parentheses.
    pub fn supports(node: &Node) -> bool {
        supports_at(node, 0)
    }

    pub fn to_node(&self) -> Node {
        match self {
            WireValue::Null => Node::null(),
            WireValue::Dimension { value, unit } => Node::dimension(*value, unit.as_str()),
            WireValue::Color { rgb, alpha } => Node::color(*rgb, alpha.unwrap_or(1.0)),
            WireValue::Quoted { quote, escaped, value } => Node::quoted(char::from(*quote), value.as_str(), *escaped),
            WireValue::Keyword(value) => Node::keyword(value.as_str()),
            WireValue::Expression(items) => Node::expression(items.iter().map(WireValue::to_node).collect()),
            WireValue::Number(value) => Node::number(*value),
            WireValue::Boolean(value) => Node::keyword(value.to_string()),
        }
    }
}

fn supports_at(node: &Node, depth: usize) -> bool {
    if depth > MAX_DEPTH || node.flags.intersects(NodeFlags::PARENS | NodeFlags::PARENS_IN_OP) {
        return false;
    }
    match &node.data {
        NodeData::Null | NodeData::Dimension { .. } | NodeData::Keyword { .. } => true,
        NodeData::Color { original, .. } => original.is_none(),
        NodeData::Quoted { quote, .. } => quote.is_ascii(),
        NodeData::Expression { items } => items.iter().all(|item| supports_at(item, depth + 1)),
        _ => false,
    }
}

fn decode_at(data: &[u8], offset: &mut usize, depth: usize) -> Result<WireValue, ProtocolError> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::Malformed("expression nesting too deep".to_string()));
    }

    let tag = read_u8_at(data, offset)?;
    let value = match Tag::from_repr(tag).ok_or(ProtocolError::UnknownTag(tag))? {
        Tag::Null => WireValue::Null,
        Tag::Dimension => WireValue::Dimension {
            value: read_f64_at(data, offset)?,
            unit: read_str_at(data, offset, "dimension unit")?,
        },
        Tag::Color => {
            let count = read_u8_at(data, offset)?;
            if count != 3 && count != 4 {
                return Err(ProtocolError::Malformed(format!("color with {count} components")));
            }
            let rgb = [
                read_f64_at(data, offset)?,
                read_f64_at(data, offset)?,
                read_f64_at(data, offset)?,
            ];
            let alpha = if count == 4 { Some(read_f64_at(data, offset)?) } else { None };
            WireValue::Color { rgb, alpha }
        }
        Tag::Quoted => WireValue::Quoted {
            quote: read_u8_at(data, offset)?,
            escaped: read_u8_at(data, offset)? != 0,
            value: read_str_at(data, offset, "quoted value")?,
        },
        Tag::Keyword => WireValue::Keyword(read_str_at(data, offset, "keyword")?),
        Tag::Expression => {
            let count = read_u32_at(data, offset)? as usize;
            // Each item is at least a tag byte.
            if count > data.len().saturating_sub(*offset) {
                return Err(ProtocolError::Malformed(format!("expression claims {count} items")));
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_at(data, offset, depth + 1)?);
            }
            WireValue::Expression(items)
        }
        Tag::Number => WireValue::Number(read_f64_at(data, offset)?),
        Tag::Boolean => WireValue::Boolean(read_u8_at(data, offset)? != 0),
    };
    Ok(value)
}
