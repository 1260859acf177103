use std::borrow::Cow;

use strum::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};

use crate::flags::NodeFlags;
use crate::props::{Properties, PropertyValue};

/// Built-in node kinds. The discriminant is the stable `typeID` written to FlatAST records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Display, EnumString, IntoStaticStr, FromRepr,
)]
#[repr(u16)]
pub enum NodeKind {
    Null = 0,
    Ruleset = 1,
    Selector = 2,
    Element = 3,
    Declaration = 4,
    Value = 5,
    Expression = 6,
    Dimension = 7,
    Color = 8,
    Quoted = 9,
    Keyword = 10,
    Anonymous = 11,
    Call = 12,
    Variable = 13,
    Operation = 14,
    Paren = 15,
    Url = 16,
    Comment = 17,
    Arguments = 18,
}

impl NodeKind {
    #[inline]
    pub fn id(self) -> u16 {
        self as u16
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Null,
    Ruleset { selectors: Vec<Node>, rules: Vec<Node> },
    Selector { elements: Vec<Node> },
    Element { combinator: String, value: String },
    Declaration { name: String, value: Box<Node>, important: bool },
    Value { items: Vec<Node> },
    Expression { items: Vec<Node> },
    Dimension { value: f64, unit: String },
    Color { rgb: [f64; 3], alpha: f64, original: Option<String> },
    Quoted { quote: char, value: String, escaped: bool },
    Keyword { value: String },
    Anonymous { value: String },
    Call { name: String, args: Vec<Node> },
    Variable { name: String },
    Operation { op: String, operands: Vec<Node> },
    Paren { value: Box<Node> },
    Url { value: Box<Node> },
    Comment { value: String, is_line_comment: bool },
    Arguments { items: Vec<Node> },
    /// A host-defined kind resolved by name through a [`crate::TypeRegistry`].
    Extension {
        type_name: String,
        properties: Properties,
        children: Vec<Node>,
    },
}

/// Children of a node grouped under the field name they occupy in the structural (JSON) form.
#[derive(Debug, Clone, Copy)]
pub enum ChildField<'a> {
    One(&'a Node),
    Many(&'a [Node]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub flags: NodeFlags,
    pub file_info: Option<FileInfo>,
    pub index: Option<u32>,
    pub data: NodeData,
}

/// What the flattener needs from a tree node.
pub trait TreeNode {
    fn type_name(&self) -> Cow<'_, str>;
    fn flags(&self) -> NodeFlags;
    /// Node-specific scalar fields, excluding anything that is itself a child node.
    fn properties(&self) -> Vec<(String, PropertyValue)>;
    fn children(&self) -> Vec<&Self>;
}

impl Node {
    pub fn new(data: NodeData) -> Self {
        Self {
            flags: NodeFlags::empty(),
            file_info: None,
            index: None,
            data,
        }
    }

    pub fn null() -> Self {
        Self::new(NodeData::Null)
    }

    pub fn dimension(value: f64, unit: impl Into<String>) -> Self {
        Self::new(NodeData::Dimension {
            value,
            unit: unit.into(),
        })
    }

    pub fn number(value: f64) -> Self {
        Self::dimension(value, "")
    }

    pub fn keyword(value: impl Into<String>) -> Self {
        Self::new(NodeData::Keyword { value: value.into() })
    }

    pub fn anonymous(value: impl Into<String>) -> Self {
        Self::new(NodeData::Anonymous { value: value.into() })
    }

    pub fn quoted(quote: char, value: impl Into<String>, escaped: bool) -> Self {
        Self::new(NodeData::Quoted {
            quote,
            value: value.into(),
            escaped,
        })
    }

    pub fn color(rgb: [f64; 3], alpha: f64) -> Self {
        Self::new(NodeData::Color {
            rgb,
            alpha,
            original: None,
        })
    }

    pub fn expression(items: Vec<Node>) -> Self {
        Self::new(NodeData::Expression { items })
    }

    pub fn value(items: Vec<Node>) -> Self {
        Self::new(NodeData::Value { items })
    }

    pub fn declaration(name: impl Into<String>, value: Node) -> Self {
        Self::new(NodeData::Declaration {
            name: name.into(),
            value: Box::new(value),
            important: false,
        })
    }

    pub fn ruleset(selectors: Vec<Node>, rules: Vec<Node>) -> Self {
        Self::new(NodeData::Ruleset { selectors, rules })
    }

    pub fn call(name: impl Into<String>, args: Vec<Node>) -> Self {
        Self::new(NodeData::Call {
            name: name.into(),
            args,
        })
    }

    pub fn arguments(items: Vec<Node>) -> Self {
        Self::new(NodeData::Arguments { items })
    }

    pub fn with_parens(mut self) -> Self {
        self.flags |= NodeFlags::PARENS;
        self
    }

    pub fn with_visibility(mut self, visible: bool) -> Self {
        self.flags = self.flags.with_visibility(visible);
        self
    }

    pub fn with_file_info(mut self, filename: impl Into<String>) -> Self {
        self.file_info = Some(FileInfo {
            filename: filename.into(),
        });
        self
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// The built-in kind, or `None` for extension nodes.
    pub fn kind(&self) -> Option<NodeKind> {
        Some(match &self.data {
            NodeData::Null => NodeKind::Null,
            NodeData::Ruleset { .. } => NodeKind::Ruleset,
            NodeData::Selector { .. } => NodeKind::Selector,
            NodeData::Element { .. } => NodeKind::Element,
            NodeData::Declaration { .. } => NodeKind::Declaration,
            NodeData::Value { .. } => NodeKind::Value,
            NodeData::Expression { .. } => NodeKind::Expression,
            NodeData::Dimension { .. } => NodeKind::Dimension,
            NodeData::Color { .. } => NodeKind::Color,
            NodeData::Quoted { .. } => NodeKind::Quoted,
            NodeData::Keyword { .. } => NodeKind::Keyword,
            NodeData::Anonymous { .. } => NodeKind::Anonymous,
            NodeData::Call { .. } => NodeKind::Call,
            NodeData::Variable { .. } => NodeKind::Variable,
            NodeData::Operation { .. } => NodeKind::Operation,
            NodeData::Paren { .. } => NodeKind::Paren,
            NodeData::Url { .. } => NodeKind::Url,
            NodeData::Comment { .. } => NodeKind::Comment,
            NodeData::Arguments { .. } => NodeKind::Arguments,
            NodeData::Extension { .. } => return None,
        })
    }

    pub fn child_fields(&self) -> Vec<(&'static str, ChildField<'_>)> {
        match &self.data {
            NodeData::Ruleset { selectors, rules } => vec![
                ("selectors", ChildField::Many(selectors)),
                ("rules", ChildField::Many(rules)),
            ],
            NodeData::Selector { elements } => vec![("elements", ChildField::Many(elements))],
            NodeData::Declaration { value, .. } | NodeData::Paren { value } | NodeData::Url { value } => {
                vec![("value", ChildField::One(value))]
            }
            NodeData::Value { items } | NodeData::Expression { items } | NodeData::Arguments { items } => {
                vec![("value", ChildField::Many(items))]
            }
            NodeData::Call { args, .. } => vec![("args", ChildField::Many(args))],
            NodeData::Operation { operands, .. } => vec![("operands", ChildField::Many(operands))],
            NodeData::Extension { children, .. } => vec![("children", ChildField::Many(children))],
            NodeData::Null
            | NodeData::Element { .. }
            | NodeData::Dimension { .. }
            | NodeData::Color { .. }
            | NodeData::Quoted { .. }
            | NodeData::Keyword { .. }
            | NodeData::Anonymous { .. }
            | NodeData::Variable { .. }
            | NodeData::Comment { .. } => Vec::new(),
        }
    }

    fn data_properties(&self) -> Vec<(String, PropertyValue)> {
        fn prop(key: &str, value: impl Into<PropertyValue>) -> (String, PropertyValue) {
            (key.to_string(), value.into())
        }

        match &self.data {
            NodeData::Ruleset { selectors, .. } => vec![prop("selectorCount", selectors.len() as f64)],
            NodeData::Element { combinator, value } => {
                vec![prop("combinator", combinator.as_str()), prop("value", value.as_str())]
            }
            NodeData::Declaration { name, important, .. } => {
                vec![prop("name", name.as_str()), prop("important", *important)]
            }
            NodeData::Dimension { value, unit } => vec![prop("value", *value), prop("unit", unit.as_str())],
            NodeData::Color { rgb, alpha, original } => {
                let mut props = vec![
                    (
                        "rgb".to_string(),
                        PropertyValue::Array(rgb.iter().map(|c| PropertyValue::Number(*c)).collect()),
                    ),
                    prop("alpha", *alpha),
                ];
                if let Some(original) = original {
                    props.push(prop("original", original.as_str()));
                }
                props
            }
            NodeData::Quoted { quote, value, escaped } => vec![
                prop("quote", quote.to_string()),
                prop("value", value.as_str()),
                prop("escaped", *escaped),
            ],
            NodeData::Keyword { value } | NodeData::Anonymous { value } => vec![prop("value", value.as_str())],
            NodeData::Call { name, .. } | NodeData::Variable { name } => vec![prop("name", name.as_str())],
            NodeData::Operation { op, .. } => vec![prop("op", op.as_str())],
            NodeData::Comment { value, is_line_comment } => vec![
                prop("value", value.as_str()),
                prop("isLineComment", *is_line_comment),
            ],
            NodeData::Extension { properties, .. } => properties
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            NodeData::Null
            | NodeData::Selector { .. }
            | NodeData::Value { .. }
            | NodeData::Expression { .. }
            | NodeData::Paren { .. }
            | NodeData::Url { .. }
            | NodeData::Arguments { .. } => Vec::new(),
        }
    }
}

impl TreeNode for Node {
    fn type_name(&self) -> Cow<'_, str> {
        match (&self.data, self.kind()) {
            (NodeData::Extension { type_name, .. }, _) => Cow::Borrowed(type_name),
            (_, Some(kind)) => Cow::Borrowed(kind.name()),
            (_, None) => Cow::Borrowed(""),
        }
    }

    fn flags(&self) -> NodeFlags {
        let mut flags = self.flags & NodeFlags::SYNTAX;
        if self.file_info.is_some() {
            flags |= NodeFlags::FILE_INFO;
        }
        if self.index.is_some() {
            flags |= NodeFlags::EXPLICIT_INDEX;
        }
        flags
    }

    fn properties(&self) -> Vec<(String, PropertyValue)> {
        let mut props = self.data_properties();
        if let Some(info) = &self.file_info {
            props.push(("filename".to_string(), PropertyValue::String(info.filename.clone())));
        }
        if let Some(index) = self.index {
            props.push(("index".to_string(), PropertyValue::Number(f64::from(index))));
        }
        props
    }

    fn children(&self) -> Vec<&Self> {
        self.child_fields()
            .into_iter()
            .flat_map(|(_, field)| match field {
                ChildField::One(node) => vec![node],
                ChildField::Many(nodes) => nodes.iter().collect(),
            })
            .collect()
    }
}
