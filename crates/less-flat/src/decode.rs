use std::str::FromStr;

use crate::error::CodecError;
use crate::flags::NodeFlags;
use crate::flat::{FlatAst, MAX_TREE_DEPTH, NodeIndex};
use crate::node::NodeKind;
use crate::props::{Properties, PropertyValue};
use crate::registry::TypeRegistry;

/// A kind-agnostic node rebuilt from a FlatAST.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericNode {
    pub type_id: u16,
    pub type_name: String,
    pub kind: Option<NodeKind>,
    pub flags: NodeFlags,
    pub properties: Properties,
    pub index: NodeIndex,
    pub parent: Option<NodeIndex>,
    pub children: Vec<GenericNode>,
}

impl GenericNode {
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn filename(&self) -> Option<&str> {
        self.flags
            .contains(NodeFlags::FILE_INFO)
            .then(|| self.property("filename").and_then(PropertyValue::as_str))
            .flatten()
    }

    pub fn source_index(&self) -> Option<u32> {
        self.flags
            .contains(NodeFlags::EXPLICIT_INDEX)
            .then(|| self.property("index").and_then(PropertyValue::as_f64))
            .flatten()
            .map(|index| index as u32)
    }

    /// Depth-first, pre-order walk of this node and its descendants.
    pub fn walk(&self) -> Vec<&GenericNode> {
        let mut out = vec![self];
        let mut i = 0;
        while i < out.len() {
            let node = out[i];
            out.splice(i + 1..i + 1, node.children.iter());
            i += 1;
        }
        out
    }
}

pub fn unflatten(ast: &FlatAst) -> Result<GenericNode, CodecError> {
    unflatten_with(ast, &TypeRegistry::builtin())
}

pub fn unflatten_with(ast: &FlatAst, registry: &TypeRegistry) -> Result<GenericNode, CodecError> {
    let count = ast.node_count();
    if count == 0 {
        return Err(CodecError::EmptyAst);
    }
    let root = ast.root_index();
    if root.get() >= count {
        return Err(CodecError::InvalidRootIndex {
            root: root.get(),
            node_count: count,
        });
    }

    // Pass 1: one shell per slot with decoded flags and properties.
    let mut shells = Vec::with_capacity(count as usize);
    for (i, record) in ast.nodes().iter().enumerate() {
        let index = NodeIndex::new(i as u32);
        let type_name = resolve_type_name(ast, registry, record.type_id)?;
        shells.push(Some(GenericNode {
            type_id: record.type_id,
            kind: NodeKind::from_str(&type_name).ok(),
            type_name,
            flags: record.flags,
            properties: ast.properties(index)?,
            index,
            parent: None,
            children: Vec::new(),
        }));
    }

    // Pass 2: wire parents and gather each node's sibling chain.
    let mut child_lists = vec![Vec::new(); count as usize];
    for i in 0..count {
        let index = NodeIndex::new(i);
        if let Some(shell) = shells[i as usize].as_mut() {
            shell.parent = ast.parent(index);
            if let Some(parent) = shell.parent
                && parent.get() >= count
            {
                return Err(CodecError::InvalidLink {
                    node: i,
                    field: "parent",
                    target: parent.get(),
                });
            }
        }
        for child in ast.children(index) {
            if child.get() >= count || child == root {
                return Err(CodecError::InvalidLink {
                    node: i,
                    field: "child",
                    target: child.get(),
                });
            }
            child_lists[i as usize].push(child);
        }
    }

    assemble(root, &mut shells, &child_lists, 0)
}

fn resolve_type_name(ast: &FlatAst, registry: &TypeRegistry, type_id: u16) -> Result<String, CodecError> {
    let from_table = ast
        .type_table()
        .and_then(|table| table.get(type_id as usize))
        .filter(|name| !name.is_empty());
    from_table
        .map(String::as_str)
        .or_else(|| registry.name_of(type_id))
        .map(str::to_string)
        .ok_or(CodecError::UnknownTypeId(type_id))
}

fn assemble(
    index: NodeIndex,
    shells: &mut [Option<GenericNode>],
    child_lists: &[Vec<NodeIndex>],
    depth: usize,
) -> Result<GenericNode, CodecError> {
    if depth > MAX_TREE_DEPTH {
        return Err(CodecError::TooDeep(MAX_TREE_DEPTH));
    }
    // Each slot may be claimed once; a second claim means two parents share a child.
    let mut node = shells[index.as_usize()].take().ok_or(CodecError::InvalidLink {
        node: index.get(),
        field: "child",
        target: index.get(),
    })?;
    for child in &child_lists[index.as_usize()] {
        let mut child_node = assemble(*child, shells, child_lists, depth + 1)?;
        child_node.parent = Some(index);
        node.children.push(child_node);
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::encode::{flatten, flatten_with};
    use crate::flat::FlatNode;
    use crate::node::{Node, NodeData, TreeNode};

    #[test]
    fn test_unflatten_rebuilds_topology() {
        let tree = Node::ruleset(
            vec![Node::keyword(".a")],
            vec![
                Node::declaration("color", Node::keyword("red")),
                Node::declaration("width", Node::dimension(10.0, "px").with_parens()),
            ],
        );
        let root = unflatten(&flatten(&tree).unwrap()).unwrap();

        assert_eq!(root.kind, Some(NodeKind::Ruleset));
        assert_eq!(root.parent, None);
        assert_eq!(root.children.len(), 3);
        let width = &root.children[2];
        assert_eq!(width.property("name"), Some(&PropertyValue::from("width")));
        assert_eq!(width.parent, Some(root.index));
        let dim = &width.children[0];
        assert!(dim.flags.contains(NodeFlags::PARENS));
        assert_eq!(dim.property("unit"), Some(&PropertyValue::from("px")));
        assert_eq!(dim.parent, Some(width.index));
    }

    #[test]
    fn test_unflatten_empty() {
        assert!(matches!(unflatten(&FlatAst::new()), Err(CodecError::EmptyAst)));
    }

    #[test]
    fn test_unflatten_invalid_root() {
        let mut ast = flatten(&Node::keyword("a")).unwrap();
        ast.root_index = 5;
        assert!(matches!(
            unflatten(&ast),
            Err(CodecError::InvalidRootIndex { root: 5, node_count: 1 })
        ));
    }

    #[test]
    fn test_unflatten_shared_child_is_rejected() {
        let mut ast = flatten(&Node::value(vec![Node::expression(vec![Node::keyword("a")]), Node::keyword("b")])).unwrap();
        // Point the second child's first-child at node 2, already owned by node 1.
        ast.nodes[3].child_index = 2;
        assert!(matches!(unflatten(&ast), Err(CodecError::InvalidLink { .. })));
    }

    /// A straight parent-to-child chain of `len` expression records rooted at node 0.
    fn chain(len: u32) -> FlatAst {
        let mut ast = FlatAst::new();
        ast.nodes = (0..len)
            .map(|i| FlatNode {
                type_id: NodeKind::Expression.id(),
                child_index: if i + 1 < len { i + 1 } else { 0 },
                parent_index: i.saturating_sub(1),
                ..Default::default()
            })
            .collect();
        ast
    }

    #[rstest]
    #[case::at_limit(MAX_TREE_DEPTH as u32 + 1, true)]
    #[case::past_limit(MAX_TREE_DEPTH as u32 + 2, false)]
    #[case::hostile_chain(100_000, false)]
    fn test_unflatten_bounds_nesting(#[case] len: u32, #[case] accepted: bool) {
        match unflatten(&chain(len)) {
            Ok(root) => {
                assert!(accepted);
                assert_eq!(root.walk().len(), len as usize);
            }
            Err(e) => {
                assert!(!accepted);
                assert!(matches!(e, CodecError::TooDeep(MAX_TREE_DEPTH)));
            }
        }
    }

    #[test]
    fn test_unflatten_non_zero_root() {
        let mut ast = FlatAst::new();
        ast.nodes = vec![
            FlatNode {
                type_id: NodeKind::Keyword.id(),
                parent_index: 1,
                ..Default::default()
            },
            FlatNode {
                type_id: NodeKind::Value.id(),
                child_index: 0,
                parent_index: 1,
                ..Default::default()
            },
        ];
        ast.set_root(NodeIndex::new(1)).unwrap();
        let root = unflatten(&ast).unwrap();
        assert_eq!(root.kind, Some(NodeKind::Value));
        assert_eq!(root.parent, None);
        assert!(root.children.is_empty());
    }

    #[test]
    fn test_unflatten_extension_uses_type_table() {
        let mut registry = TypeRegistry::builtin();
        registry.register("Import").unwrap();
        let tree = Node::new(NodeData::Extension {
            type_name: "Import".to_string(),
            properties: Properties::new(),
            children: vec![Node::quoted('"', "a.less", false)],
        });
        let ast = flatten_with(&tree, &registry).unwrap();

        // The builtin registry does not know "Import"; the type table does.
        let root = unflatten(&ast).unwrap();
        assert_eq!(root.type_name, "Import");
        assert_eq!(root.kind, None);
        assert_eq!(root.children[0].property("value"), Some(&PropertyValue::from("a.less")));
    }

    #[test]
    fn test_file_info_accessors() {
        let tree = Node::keyword("a").with_file_info("main.less").with_index(12);
        assert!(tree.flags().contains(NodeFlags::FILE_INFO));
        let root = unflatten(&flatten(&tree).unwrap()).unwrap();
        assert_eq!(root.filename(), Some("main.less"));
        assert_eq!(root.source_index(), Some(12));
    }

    #[test]
    fn test_walk_is_preorder() {
        let tree = Node::value(vec![Node::expression(vec![Node::keyword("a")]), Node::keyword("b")]);
        let root = unflatten(&flatten(&tree).unwrap()).unwrap();
        let names = root.walk().iter().map(|n| n.type_name.clone()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Value", "Expression", "Keyword", "Keyword"]);
    }
}
