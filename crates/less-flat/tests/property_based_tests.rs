//! Property-based tests for the FlatAST codec.
use less_flat::{FlatAst, GenericNode, Node, NodeData, PropertyValue, TreeNode, flatten, unflatten};
use proptest::prelude::*;

mod strategies {
    use super::*;

    pub fn text() -> impl Strategy<Value = String> {
        "[a-z@$#%.-]{0,8}"
    }

    fn with_flags(node: Node, parens: bool, visibility: Option<bool>, index: Option<u32>, file: Option<String>) -> Node {
        let mut node = node;
        if parens {
            node = node.with_parens();
        }
        if let Some(visible) = visibility {
            node = node.with_visibility(visible);
        }
        if let Some(index) = index {
            node = node.with_index(index);
        }
        if let Some(file) = file {
            node = node.with_file_info(file);
        }
        node
    }

    pub fn leaf() -> impl Strategy<Value = Node> {
        prop_oneof![
            (-1.0e6..1.0e6f64, text()).prop_map(|(v, unit)| Node::dimension(v, unit)),
            text().prop_map(Node::keyword),
            text().prop_map(Node::anonymous),
            (prop::sample::select(vec!['"', '\'']), text(), any::<bool>())
                .prop_map(|(quote, value, escaped)| Node::quoted(quote, value, escaped)),
            (0.0..255.0f64, 0.0..255.0f64, 0.0..255.0f64, 0.0..1.0f64)
                .prop_map(|(r, g, b, a)| Node::color([r, g, b], a)),
            text().prop_map(|name| Node::new(NodeData::Variable { name })),
            Just(Node::null()),
        ]
    }

    pub fn tree() -> impl Strategy<Value = Node> {
        let base = (
            leaf(),
            any::<bool>(),
            prop::option::of(any::<bool>()),
            prop::option::of(0u32..10_000),
            prop::option::of(text()),
        )
            .prop_map(|(node, parens, visibility, index, file)| with_flags(node, parens, visibility, index, file));

        base.prop_recursive(4, 48, 5, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..5).prop_map(Node::expression),
                prop::collection::vec(inner.clone(), 0..5).prop_map(Node::value),
                (text(), inner.clone()).prop_map(|(name, value)| Node::declaration(name, value)),
                (text(), prop::collection::vec(inner.clone(), 0..4)).prop_map(|(name, args)| Node::call(name, args)),
                inner.clone().prop_map(|value| Node::new(NodeData::Paren { value: Box::new(value) })),
                (prop::collection::vec(inner.clone(), 0..3), prop::collection::vec(inner, 0..3))
                    .prop_map(|(selectors, rules)| Node::ruleset(selectors, rules)),
            ]
        })
    }
}

fn preorder(node: &Node) -> Vec<&Node> {
    let mut out = vec![node];
    for child in node.children() {
        out.extend(preorder(child));
    }
    out
}

fn string_props(node: &Node) -> Vec<(String, String)> {
    node.properties()
        .into_iter()
        .filter_map(|(key, value)| match value {
            PropertyValue::String(s) => Some((key, s)),
            _ => None,
        })
        .collect()
}

fn assert_same_shape(original: &Node, decoded: &GenericNode) -> Result<(), TestCaseError> {
    let expected = preorder(original);
    let actual = decoded.walk();
    prop_assert_eq!(expected.len(), actual.len());

    for (want, got) in expected.iter().zip(actual.iter()) {
        let want_type_name = want.type_name();
        prop_assert_eq!(want_type_name.as_ref(), got.type_name.as_str());
        prop_assert_eq!(want.flags(), got.flags);
        prop_assert_eq!(want.children().len(), got.children.len());
        for (key, value) in string_props(want) {
            prop_assert_eq!(got.property(&key), Some(&PropertyValue::String(value)));
        }
        for child in &got.children {
            prop_assert_eq!(child.parent, Some(got.index));
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_unflatten_reproduces_tree(tree in strategies::tree()) {
        let decoded = unflatten(&flatten(&tree).unwrap()).unwrap();
        assert_same_shape(&tree, &decoded)?;
        prop_assert_eq!(decoded.parent, None);
    }

    #[test]
    fn prop_bytes_roundtrip_preserves_tree(tree in strategies::tree()) {
        let ast = flatten(&tree).unwrap();
        let bytes = ast.to_bytes().unwrap();
        let decoded = FlatAst::from_bytes(&bytes).unwrap();
        prop_assert_eq!(decoded.node_count(), ast.node_count());
        assert_same_shape(&tree, &unflatten(&decoded).unwrap())?;
    }

    #[test]
    fn prop_from_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = FlatAst::from_bytes(&data);
    }

    #[test]
    fn prop_corrupted_buffers_fail_cleanly(tree in strategies::tree(), position in any::<prop::sample::Index>(), byte in any::<u8>()) {
        let mut bytes = flatten(&tree).unwrap().to_bytes().unwrap();
        let at = position.index(bytes.len());
        bytes[at] = byte;
        if let Ok(ast) = FlatAst::from_bytes(&bytes) {
            let _ = unflatten(&ast);
        }
    }
}
