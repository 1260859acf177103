use crate::error::CodecError;
use crate::flat::{FlatAst, FlatNode, MAX_TREE_DEPTH, NodeIndex};
use crate::io::to_u32;
use crate::node::TreeNode;
use crate::props;
use crate::registry::TypeRegistry;

/// Flattens a tree of built-in node kinds.
pub fn flatten<T: TreeNode>(root: &T) -> Result<FlatAst, CodecError> {
    flatten_with(root, &TypeRegistry::builtin())
}

/// Flattens a tree, resolving type names through `registry`.
///
/// The first node written is the root, but `root_index` is set explicitly afterwards so
/// callers never have to infer it from position.
pub fn flatten_with<T: TreeNode>(root: &T, registry: &TypeRegistry) -> Result<FlatAst, CodecError> {
    let mut flattener = Flattener {
        ast: FlatAst::new(),
        registry,
        uses_extensions: false,
    };
    let root_index = flattener.push(root, None, 0)?;
    flattener.ast.set_root(root_index)?;

    if flattener.uses_extensions {
        flattener.ast.types = Some(registry.type_table());
    }
    Ok(flattener.ast)
}

struct Flattener<'a> {
    ast: FlatAst,
    registry: &'a TypeRegistry,
    uses_extensions: bool,
}

impl Flattener<'_> {
    fn push<T: TreeNode>(&mut self, node: &T, parent: Option<u32>, depth: usize) -> Result<NodeIndex, CodecError> {
        if depth > MAX_TREE_DEPTH {
            return Err(CodecError::TooDeep(MAX_TREE_DEPTH));
        }
        let type_name = node.type_name();
        let type_id = self
            .registry
            .id_of(&type_name)
            .ok_or_else(|| CodecError::UnknownNodeType(type_name.to_string()))?;
        if TypeRegistry::is_extension(type_id) {
            self.uses_extensions = true;
        }

        let index = to_u32(self.ast.nodes.len())?;
        let encoded = props::encode_properties(&node.properties(), &mut self.ast.strings)?;
        let props_offset = to_u32(self.ast.props.len())?;
        let props_length = to_u32(encoded.len())?;
        self.ast.props.extend_from_slice(&encoded);

        self.ast.nodes.push(FlatNode {
            type_id,
            flags: node.flags(),
            child_index: 0,
            next_index: 0,
            // The root links to itself.
            parent_index: parent.unwrap_or(index),
            props_offset,
            props_length,
        });

        let mut previous: Option<u32> = None;
        for child in node.children() {
            let child_index = self.push(child, Some(index), depth + 1)?.get();
            match previous {
                None => self.ast.nodes[index as usize].child_index = child_index,
                Some(prev) => self.ast.nodes[prev as usize].next_index = child_index,
            }
            previous = Some(child_index);
        }

        Ok(NodeIndex::new(index))
    }
}
