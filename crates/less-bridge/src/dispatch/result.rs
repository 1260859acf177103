use std::str::FromStr;

use itertools::Itertools;
use less_flat::{ChildField, GenericNode, Node, NodeData, NodeKind, Properties, PropertyValue, TreeNode};
use serde_json::{Map, Number, Value};

use crate::protocol::WireValue;

pub const TYPE_KEY: &str = "_type";

/// Children stored under one field of a [`ResultNode`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChildSlot {
    One(Box<ResultNode>),
    Many(Vec<ResultNode>),
}

impl ChildSlot {
    fn nodes(&self) -> Vec<&ResultNode> {
        match self {
            ChildSlot::One(node) => vec![node.as_ref()],
            ChildSlot::Many(nodes) => nodes.iter().collect(),
        }
    }
}

/// A node decoded from a plugin result, whichever path it came back on.
///
/// Offers the same read access a native node does: its type name, scalar fields, children
/// and a CSS rendering.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultNode {
    type_name: String,
    fields: Map<String, Value>,
    slots: Vec<(String, ChildSlot)>,
}

impl ResultNode {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_children(mut self, field: impl Into<String>, children: Vec<ResultNode>) -> Self {
        self.slots.push((field.into(), ChildSlot::Many(children)));
        self
    }

    pub fn with_child(mut self, field: impl Into<String>, child: ResultNode) -> Self {
        self.slots.push((field.into(), ChildSlot::One(Box::new(child))));
        self
    }

    pub fn null() -> Self {
        Self::new(NodeKind::Null.name())
    }

    pub fn dimension(value: f64, unit: &str) -> Self {
        Self::new(NodeKind::Dimension.name())
            .with_field("value", number(value))
            .with_field("unit", unit)
    }

    pub fn keyword(value: &str) -> Self {
        Self::new(NodeKind::Keyword.name()).with_field("value", value)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::from_str(&self.type_name).ok()
    }

    pub fn is_null(&self) -> bool {
        self.kind() == Some(NodeKind::Null)
    }

    /// The `value` field, the primary scalar of most leaf kinds.
    pub fn value(&self) -> Option<&Value> {
        self.fields.get("value")
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn slot(&self, field: &str) -> Option<&ChildSlot> {
        self.slots.iter().find(|(name, _)| name == field).map(|(_, slot)| slot)
    }

    pub fn children(&self) -> Vec<&ResultNode> {
        self.slots.iter().flat_map(|(_, slot)| slot.nodes()).collect()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value().and_then(Value::as_f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value().and_then(Value::as_str)
    }

    fn str_field(&self, key: &str) -> &str {
        self.field(key).and_then(Value::as_str).unwrap_or_default()
    }

    fn bool_field(&self, key: &str) -> bool {
        self.field(key).and_then(Value::as_bool).unwrap_or_default()
    }

    fn slot_nodes(&self, field: &str) -> Vec<&ResultNode> {
        self.slot(field).map(ChildSlot::nodes).unwrap_or_default()
    }

    /// Reads the structural JSON form (`{"_type": ..., fields..., childField: ...}`).
    ///
    /// Plain JSON values are mapped to the closest node kind.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::null(),
            Value::Bool(b) => Self::new("Boolean").with_field("value", *b),
            Value::Number(n) => Self::dimension(n.as_f64().unwrap_or_default(), ""),
            Value::String(s) => Self::new(NodeKind::Anonymous.name()).with_field("value", s.as_str()),
            Value::Array(items) => {
                Self::new(NodeKind::Value.name()).with_children("value", items.iter().map(Self::from_json).collect())
            }
            Value::Object(map) => {
                let Some(type_name) = map.get(TYPE_KEY).and_then(Value::as_str) else {
                    return Self::new("Object").with_fields(map.clone());
                };
                let mut node = Self::new(type_name);
                for (key, value) in map {
                    if key == TYPE_KEY {
                        continue;
                    }
                    match value {
                        Value::Object(child) if child.contains_key(TYPE_KEY) => {
                            node.slots.push((key.clone(), ChildSlot::One(Box::new(Self::from_json(value)))));
                        }
                        Value::Array(items) if !items.is_empty() && items.iter().all(is_typed) => {
                            node.slots
                                .push((key.clone(), ChildSlot::Many(items.iter().map(Self::from_json).collect())));
                        }
                        Value::Array(items) if items.is_empty() && is_child_field(type_name, key) => {
                            node.slots.push((key.clone(), ChildSlot::Many(Vec::new())));
                        }
                        _ => {
                            node.fields.insert(key.clone(), value.clone());
                        }
                    }
                }
                node
            }
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + self.slots.len() + 1);
        map.insert(TYPE_KEY.to_string(), Value::String(self.type_name.clone()));
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        for (key, slot) in &self.slots {
            let value = match slot {
                ChildSlot::One(node) => node.to_json(),
                ChildSlot::Many(nodes) => Value::Array(nodes.iter().map(ResultNode::to_json).collect()),
            };
            map.insert(key.clone(), value);
        }
        Value::Object(map)
    }

    pub fn from_node(node: &Node) -> Self {
        let mut result = Self::new(node.type_name());
        result.fields = properties_to_json(node.properties());
        result.fields.remove("selectorCount");
        if node.flags.contains(less_flat::NodeFlags::PARENS) {
            result.fields.insert("parens".to_string(), Value::Bool(true));
        }
        result.slots = node
            .child_fields()
            .into_iter()
            .map(|(field, child)| {
                let slot = match child {
                    ChildField::One(node) => ChildSlot::One(Box::new(Self::from_node(node))),
                    ChildField::Many(nodes) => ChildSlot::Many(nodes.iter().map(Self::from_node).collect()),
                };
                (field.to_string(), slot)
            })
            .collect();
        result
    }

    /// Rebuilds child fields from the kind, since a FlatAST only stores an ordered child list.
    pub fn from_generic(node: &GenericNode) -> Self {
        let mut result = Self::new(node.type_name.as_str());
        result.fields = properties_to_json(node.properties.clone());
        if node.flags.contains(less_flat::NodeFlags::PARENS) {
            result.fields.insert("parens".to_string(), Value::Bool(true));
        }

        let children = node.children.iter().map(Self::from_generic).collect::<Vec<_>>();
        result.slots = match node.kind {
            Some(NodeKind::Ruleset) => {
                let selector_count = node
                    .property("selectorCount")
                    .and_then(PropertyValue::as_f64)
                    .map_or(0, |n| n as usize)
                    .min(children.len());
                result.fields.remove("selectorCount");
                let mut children = children;
                let rules = children.split_off(selector_count);
                vec![
                    ("selectors".to_string(), ChildSlot::Many(children)),
                    ("rules".to_string(), ChildSlot::Many(rules)),
                ]
            }
            Some(NodeKind::Declaration | NodeKind::Paren | NodeKind::Url) => children
                .into_iter()
                .next()
                .map(|child| vec![("value".to_string(), ChildSlot::One(Box::new(child)))])
                .unwrap_or_default(),
            Some(NodeKind::Value | NodeKind::Expression | NodeKind::Arguments) => {
                vec![("value".to_string(), ChildSlot::Many(children))]
            }
            Some(NodeKind::Selector) => vec![("elements".to_string(), ChildSlot::Many(children))],
            Some(NodeKind::Call) => vec![("args".to_string(), ChildSlot::Many(children))],
            Some(NodeKind::Operation) => vec![("operands".to_string(), ChildSlot::Many(children))],
            _ if children.is_empty() => Vec::new(),
            _ => vec![("children".to_string(), ChildSlot::Many(children))],
        };
        result
    }

    pub fn from_wire(value: &WireValue) -> Self {
        match value {
            WireValue::Null => Self::null(),
            WireValue::Dimension { value, unit } => Self::dimension(*value, unit),
            WireValue::Number(value) => Self::dimension(*value, ""),
            WireValue::Color { rgb, alpha } => Self::new(NodeKind::Color.name())
                .with_field("rgb", Value::Array(rgb.iter().map(|c| number(*c)).collect()))
                .with_field("alpha", number(alpha.unwrap_or(1.0))),
            WireValue::Quoted { quote, escaped, value } => Self::new(NodeKind::Quoted.name())
                .with_field("quote", char::from(*quote).to_string())
                .with_field("escaped", *escaped)
                .with_field("value", value.as_str()),
            WireValue::Keyword(value) => Self::keyword(value),
            WireValue::Expression(items) => Self::new(NodeKind::Expression.name())
                .with_children("value", items.iter().map(Self::from_wire).collect()),
            WireValue::Boolean(value) => Self::new("Boolean").with_field("value", *value),
        }
    }

    /// Converts back into a tree node. Unknown type names become extension nodes.
    pub fn to_node(&self) -> Node {
        let nodes = |field: &str| self.slot_nodes(field).into_iter().map(Self::to_node).collect::<Vec<_>>();
        let one = |field: &str| {
            Box::new(
                self.slot_nodes(field)
                    .first()
                    .map_or_else(Node::null, |node| node.to_node()),
            )
        };

        let data = match self.kind() {
            Some(NodeKind::Null) => NodeData::Null,
            Some(NodeKind::Ruleset) => NodeData::Ruleset {
                selectors: nodes("selectors"),
                rules: nodes("rules"),
            },
            Some(NodeKind::Selector) => NodeData::Selector {
                elements: nodes("elements"),
            },
            Some(NodeKind::Element) => NodeData::Element {
                combinator: self.str_field("combinator").to_string(),
                value: self.str_field("value").to_string(),
            },
            Some(NodeKind::Declaration) => NodeData::Declaration {
                name: self.str_field("name").to_string(),
                value: one("value"),
                important: self.bool_field("important"),
            },
            Some(NodeKind::Value) => NodeData::Value { items: nodes("value") },
            Some(NodeKind::Expression) => NodeData::Expression { items: nodes("value") },
            Some(NodeKind::Arguments) => NodeData::Arguments { items: nodes("value") },
            Some(NodeKind::Dimension) => NodeData::Dimension {
                value: self.as_f64().unwrap_or_default(),
                unit: self.str_field("unit").to_string(),
            },
            Some(NodeKind::Color) => NodeData::Color {
                rgb: self.rgb(),
                alpha: self.field("alpha").and_then(Value::as_f64).unwrap_or(1.0),
                original: self.field("original").and_then(Value::as_str).map(str::to_string),
            },
            Some(NodeKind::Quoted) => NodeData::Quoted {
                quote: self.str_field("quote").chars().next().unwrap_or('"'),
                value: self.str_field("value").to_string(),
                escaped: self.bool_field("escaped"),
            },
            Some(NodeKind::Keyword) => NodeData::Keyword {
                value: self.scalar_text(),
            },
            Some(NodeKind::Anonymous) => NodeData::Anonymous {
                value: self.scalar_text(),
            },
            Some(NodeKind::Call) => NodeData::Call {
                name: self.str_field("name").to_string(),
                args: nodes("args"),
            },
            Some(NodeKind::Variable) => NodeData::Variable {
                name: self.str_field("name").to_string(),
            },
            Some(NodeKind::Operation) => NodeData::Operation {
                op: self.str_field("op").to_string(),
                operands: nodes("operands"),
            },
            Some(NodeKind::Paren) => NodeData::Paren { value: one("value") },
            Some(NodeKind::Url) => NodeData::Url { value: one("value") },
            Some(NodeKind::Comment) => NodeData::Comment {
                value: self.str_field("value").to_string(),
                is_line_comment: self.bool_field("isLineComment"),
            },
            None if self.type_name == "Boolean" => NodeData::Keyword {
                value: self.scalar_text(),
            },
            None => NodeData::Extension {
                type_name: self.type_name.clone(),
                properties: self
                    .fields
                    .iter()
                    .filter(|(key, _)| key.as_str() != "parens")
                    .map(|(key, value)| (key.clone(), PropertyValue::from_json(value)))
                    .collect::<Properties>(),
                children: self.children().into_iter().map(Self::to_node).collect(),
            },
        };

        let mut node = Node::new(data);
        if self.bool_field("parens") {
            node = node.with_parens();
        }
        node
    }

    /// Renders the node the way it would appear in compiled CSS.
    pub fn to_css(&self) -> String {
        let joined = |field: &str, sep: &str| self.slot_nodes(field).iter().map(|n| n.to_css()).join(sep);
        let css = match self.kind() {
            Some(NodeKind::Null) => String::new(),
            Some(NodeKind::Dimension) => {
                format!("{}{}", format_number(self.as_f64().unwrap_or_default()), self.str_field("unit"))
            }
            Some(NodeKind::Color) => self.color_css(),
            Some(NodeKind::Quoted) => {
                if self.bool_field("escaped") {
                    self.str_field("value").to_string()
                } else {
                    let quote = self.str_field("quote");
                    let quote = if quote.is_empty() { "\"" } else { quote };
                    format!("{quote}{}{quote}", self.str_field("value"))
                }
            }
            Some(NodeKind::Keyword | NodeKind::Anonymous | NodeKind::Comment | NodeKind::Element) => {
                self.scalar_text()
            }
            Some(NodeKind::Variable) => self.str_field("name").to_string(),
            Some(NodeKind::Expression) => joined("value", " "),
            Some(NodeKind::Value | NodeKind::Arguments) => joined("value", ", "),
            Some(NodeKind::Selector) => joined("elements", ""),
            Some(NodeKind::Call) => format!("{}({})", self.str_field("name"), joined("args", ", ")),
            Some(NodeKind::Paren) => format!("({})", joined("value", "")),
            Some(NodeKind::Url) => format!("url({})", joined("value", "")),
            Some(NodeKind::Operation) => joined("operands", &format!(" {} ", self.str_field("op"))),
            Some(NodeKind::Declaration) => {
                let important = if self.bool_field("important") { " !important" } else { "" };
                format!("{}: {}{important}", self.str_field("name"), joined("value", ""))
            }
            Some(NodeKind::Ruleset) => format!(
                "{} {{ {} }}",
                joined("selectors", ", "),
                self.slot_nodes("rules").iter().map(|n| format!("{};", n.to_css())).join(" ")
            ),
            None => match self.value() {
                Some(value) => self.scalar_text_of(value),
                None => self.children().iter().map(|n| n.to_css()).join(" "),
            },
        };

        if self.bool_field("parens") && self.kind() != Some(NodeKind::Paren) {
            format!("({css})")
        } else {
            css
        }
    }

    fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields = fields;
        self
    }

    fn scalar_text(&self) -> String {
        self.value().map(|v| self.scalar_text_of(v)).unwrap_or_default()
    }

    fn scalar_text_of(&self, value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    fn rgb(&self) -> [f64; 3] {
        let mut rgb = [0.0; 3];
        if let Some(Value::Array(components)) = self.field("rgb") {
            for (slot, component) in rgb.iter_mut().zip(components) {
                *slot = component.as_f64().unwrap_or_default();
            }
        }
        rgb
    }

    fn color_css(&self) -> String {
        let alpha = self.field("alpha").and_then(Value::as_f64).unwrap_or(1.0);
        if alpha >= 1.0
            && let Some(original) = self.field("original").and_then(Value::as_str)
        {
            return original.to_string();
        }

        let [r, g, b] = self.rgb().map(|c| c.round().clamp(0.0, 255.0) as u8);
        if alpha < 1.0 {
            format!("rgba({r}, {g}, {b}, {})", format_number(alpha))
        } else {
            format!("#{r:02x}{g:02x}{b:02x}")
        }
    }
}

fn is_typed(value: &Value) -> bool {
    value.as_object().is_some_and(|map| map.contains_key(TYPE_KEY))
}

fn is_child_field(type_name: &str, key: &str) -> bool {
    match NodeKind::from_str(type_name) {
        Ok(NodeKind::Ruleset) => key == "selectors" || key == "rules",
        Ok(NodeKind::Selector) => key == "elements",
        Ok(NodeKind::Value | NodeKind::Expression | NodeKind::Arguments) => key == "value",
        Ok(NodeKind::Call) => key == "args",
        Ok(NodeKind::Operation) => key == "operands",
        _ => key == "children",
    }
}

fn number(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn properties_to_json(properties: impl IntoIterator<Item = (String, PropertyValue)>) -> Map<String, Value> {
    properties
        .into_iter()
        .map(|(key, value)| (key, value.to_json()))
        .collect()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let text = format!("{value:.8}");
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[cfg(test)]
mod tests {
    use less_flat::{flatten, unflatten};
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case(Node::dimension(10.0, "px"), "10px")]
    #[case(Node::dimension(0.5, "em"), "0.5em")]
    #[case(Node::number(-3.0), "-3")]
    #[case(Node::color([255.0, 0.0, 16.0], 1.0), "#ff0010")]
    #[case(Node::color([0.0, 0.0, 0.0], 0.5), "rgba(0, 0, 0, 0.5)")]
    #[case(Node::quoted('"', "a.png", false), "\"a.png\"")]
    #[case(Node::quoted('\'', "raw", true), "raw")]
    #[case(Node::keyword("solid"), "solid")]
    #[case(Node::expression(vec![Node::dimension(1.0, "px"), Node::keyword("solid")]), "1px solid")]
    #[case(Node::value(vec![Node::keyword("a"), Node::keyword("b")]), "a, b")]
    #[case(Node::call("rgb", vec![Node::number(1.0), Node::number(2.0), Node::number(3.0)]), "rgb(1, 2, 3)")]
    #[case(Node::declaration("width", Node::dimension(10.0, "px")), "width: 10px")]
    #[case(Node::dimension(2.0, "px").with_parens(), "(2px)")]
    #[case(Node::null(), "")]
    fn test_to_css(#[case] node: Node, #[case] expected: &str) {
        assert_eq!(ResultNode::from_node(&node).to_css(), expected);
    }

    #[test]
    fn test_json_form_of_node() {
        let decl = Node::declaration("width", Node::dimension(10.0, "px"));
        let json = ResultNode::from_node(&decl).to_json();
        assert_eq!(
            json,
            json!({
                "_type": "Declaration",
                "name": "width",
                "important": false,
                "value": {"_type": "Dimension", "value": 10.0, "unit": "px"},
            })
        );
    }

    #[test]
    fn test_from_json_restores_slots() {
        let node = Node::expression(vec![Node::keyword("a"), Node::call("f", Vec::new())]);
        let json = ResultNode::from_node(&node).to_json();
        let back = ResultNode::from_json(&json);
        assert_eq!(back.type_name(), "Expression");
        assert_eq!(back.children().len(), 2);
        assert_eq!(back.children()[1].slot("args"), Some(&ChildSlot::Many(Vec::new())));
        assert_eq!(back.to_node(), node);
    }

    #[rstest]
    #[case(json!(null), "Null", "")]
    #[case(json!(true), "Boolean", "true")]
    #[case(json!(4), "Dimension", "4")]
    #[case(json!("bold"), "Anonymous", "bold")]
    #[case(json!(["a", 1]), "Value", "a, 1")]
    #[case(json!({"x": 1}), "Object", "")]
    fn test_from_plain_json(#[case] value: Value, #[case] type_name: &str, #[case] css: &str) {
        let node = ResultNode::from_json(&value);
        assert_eq!(node.type_name(), type_name);
        assert_eq!(node.to_css(), css);
    }

    #[test]
    fn test_from_generic_splits_ruleset() {
        let tree = Node::ruleset(
            vec![Node::keyword(".a"), Node::keyword(".b")],
            vec![Node::declaration("color", Node::keyword("red"))],
        );
        let generic = unflatten(&flatten(&tree).unwrap()).unwrap();
        let node = ResultNode::from_generic(&generic);
        assert_eq!(node.to_css(), ".a, .b { color: red; }");
        assert_eq!(node.to_node(), tree);
    }

    #[test]
    fn test_from_generic_matches_from_node() {
        let tree = Node::call(
            "fade",
            vec![Node::color([1.0, 2.0, 3.0], 1.0), Node::dimension(50.0, "%").with_parens()],
        );
        let generic = unflatten(&flatten(&tree).unwrap()).unwrap();
        assert_eq!(ResultNode::from_generic(&generic), ResultNode::from_node(&tree));
    }

    #[test]
    fn test_from_wire() {
        let value = WireValue::Expression(vec![
            WireValue::Dimension {
                value: 1.5,
                unit: "rem".to_string(),
            },
            WireValue::Quoted {
                quote: b'\'',
                escaped: false,
                value: "x".to_string(),
            },
            WireValue::Boolean(false),
        ]);
        let node = ResultNode::from_wire(&value);
        assert_eq!(node.to_css(), "1.5rem 'x' false");
        assert_eq!(WireValue::from_node(&node.to_node()), WireValue::Expression(vec![
            WireValue::Dimension {
                value: 1.5,
                unit: "rem".to_string(),
            },
            WireValue::Quoted {
                quote: b'\'',
                escaped: false,
                value: "x".to_string(),
            },
            WireValue::Keyword("false".to_string()),
        ]));
    }

    #[test]
    fn test_unknown_type_becomes_extension() {
        let node = ResultNode::from_json(&json!({"_type": "Import", "path": "a.less", "children": [{"_type": "Keyword", "value": "x"}]}));
        let tree = node.to_node();
        assert_eq!(tree.type_name(), "Import");
        assert_eq!(tree.children().len(), 1);
        assert_eq!(node.to_css(), "x");
    }
}
