use less_flat::{FlatAst, Node, NodeData, flatten};
use serde_json::Value;
use tracing::warn;

use super::ResultNode;
use crate::protocol::WireValue;

/// One argument of a plugin call: a typed node, or a plain JSON value passed through as is.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    Node(Node),
    Json(Value),
}

impl CallArg {
    /// Structural form sent on the JSON path.
    pub fn to_json(&self) -> Value {
        match self {
            CallArg::Node(node) => ResultNode::from_node(node).to_json(),
            CallArg::Json(value) => value.clone(),
        }
    }

    pub fn to_node(&self) -> Node {
        match self {
            CallArg::Node(node) => node.clone(),
            CallArg::Json(value) => ResultNode::from_json(value).to_node(),
        }
    }

    /// The tagged-union form, when the argument has one.
    pub fn to_wire(&self) -> Option<WireValue> {
        match self {
            CallArg::Json(Value::Bool(b)) => Some(WireValue::Boolean(*b)),
            CallArg::Json(Value::Number(n)) => n.as_f64().map(WireValue::Number),
            CallArg::Json(Value::Null) => Some(WireValue::Null),
            CallArg::Json(Value::String(s)) => Some(WireValue::Keyword(s.clone())),
            CallArg::Json(_) => None,
            CallArg::Node(node) => WireValue::supports(node).then(|| WireValue::from_node(node)),
        }
    }
}

impl From<Node> for CallArg {
    fn from(node: Node) -> Self {
        CallArg::Node(node)
    }
}

impl From<Value> for CallArg {
    fn from(value: Value) -> Self {
        CallArg::Json(value)
    }
}

impl From<f64> for CallArg {
    fn from(value: f64) -> Self {
        CallArg::Json(value.into())
    }
}

impl From<bool> for CallArg {
    fn from(value: bool) -> Self {
        CallArg::Json(Value::Bool(value))
    }
}

impl From<&str> for CallArg {
    fn from(value: &str) -> Self {
        CallArg::Json(Value::String(value.to_string()))
    }
}

/// Stable text form of the arguments, used in cache keys.
pub(crate) fn args_key(args: &[CallArg]) -> String {
    Value::Array(args.iter().map(CallArg::to_json).collect()).to_string()
}

/// Flattens all arguments under one `Arguments` root.
///
/// An argument that cannot be flattened on its own is sent as a null slot instead of failing
/// the batch.
pub(crate) fn flatten_args(args: &[CallArg]) -> Result<FlatAst, less_flat::CodecError> {
    let items = args
        .iter()
        .enumerate()
        .map(|(index, arg)| {
            let node = arg.to_node();
            match flatten(&node) {
                Ok(_) => node,
                Err(e) => {
                    warn!(index, error = %e, "Argument cannot be encoded, sending null");
                    Node::null()
                }
            }
        })
        .collect();
    flatten(&Node::new(NodeData::Arguments { items }))
}
