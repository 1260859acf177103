use std::fmt;

use crate::error::CodecError;
use crate::flags::NodeFlags;
use crate::props::{self, Properties};
use crate::strings::StringTable;

/// `"LESS"` read as a little-endian u32.
pub const MAGIC: u32 = 0x4C45_5353;
pub const VERSION: u32 = 1;
/// Magic plus six u32 header fields.
pub const HEADER_SIZE: usize = 28;
pub const NODE_SIZE: usize = 24;
/// Deepest nesting below the root that flattening and unflattening accept.
pub const MAX_TREE_DEPTH: usize = 1024;

/// Position of a node in the FlatAST node array.
///
/// On the wire a link value of `0` means "no link"; past the decode boundary absent links
/// are always `Option<NodeIndex>::None`, never a raw zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(u32);

impl NodeIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[inline]
fn link(raw: u32) -> Option<NodeIndex> {
    (raw != 0).then_some(NodeIndex(raw))
}

/// One fixed-size node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlatNode {
    pub type_id: u16,
    pub flags: NodeFlags,
    pub child_index: u32,
    pub next_index: u32,
    pub parent_index: u32,
    pub props_offset: u32,
    pub props_length: u32,
}

impl FlatNode {
    pub fn first_child(&self) -> Option<NodeIndex> {
        link(self.child_index)
    }

    pub fn next_sibling(&self) -> Option<NodeIndex> {
        link(self.next_index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatAst {
    pub(crate) version: u32,
    pub(crate) root_index: u32,
    pub(crate) nodes: Vec<FlatNode>,
    pub(crate) strings: StringTable,
    pub(crate) types: Option<Vec<String>>,
    pub(crate) props: Vec<u8>,
}

impl Default for FlatAst {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatAst {
    pub fn new() -> Self {
        Self {
            version: VERSION,
            root_index: 0,
            nodes: Vec::new(),
            strings: StringTable::new(),
            types: None,
            props: Vec::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root_index(&self) -> NodeIndex {
        NodeIndex(self.root_index)
    }

    pub fn set_root(&mut self, root: NodeIndex) -> Result<(), CodecError> {
        if root.as_usize() >= self.nodes.len() {
            return Err(CodecError::InvalidRootIndex {
                root: root.get(),
                node_count: self.node_count(),
            });
        }
        self.root_index = root.get();
        Ok(())
    }

    pub fn nodes(&self) -> &[FlatNode] {
        &self.nodes
    }

    pub fn node(&self, index: NodeIndex) -> Option<&FlatNode> {
        self.nodes.get(index.as_usize())
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn add_string(&mut self, value: &str) -> u32 {
        self.strings.intern(value)
    }

    pub fn type_table(&self) -> Option<&[String]> {
        self.types.as_deref()
    }

    pub fn property_blob(&self) -> &[u8] {
        &self.props
    }

    /// The parent of `index`. The designated root has none, whatever its record says.
    pub fn parent(&self, index: NodeIndex) -> Option<NodeIndex> {
        if index.get() == self.root_index {
            return None;
        }
        let node = self.node(index)?;
        (node.parent_index != index.get()).then_some(NodeIndex(node.parent_index))
    }

    pub fn children(&self, index: NodeIndex) -> Children<'_> {
        Children {
            ast: self,
            next: self.node(index).and_then(FlatNode::first_child),
            remaining: self.nodes.len(),
        }
    }

    pub fn properties(&self, index: NodeIndex) -> Result<Properties, CodecError> {
        let node = self.node(index).ok_or(CodecError::InvalidLink {
            node: index.get(),
            field: "self",
            target: index.get(),
        })?;
        props::decode_properties(self.props_slice(node)?, &self.strings)
    }

    pub(crate) fn props_slice(&self, node: &FlatNode) -> Result<&[u8], CodecError> {
        let offset = node.props_offset as usize;
        let length = node.props_length as usize;
        offset
            .checked_add(length)
            .filter(|end| *end <= self.props.len())
            .map(|end| &self.props[offset..end])
            .ok_or(CodecError::OffsetOutOfRange {
                offset,
                length,
                limit: self.props.len(),
            })
    }

    /// Checks every link and property range against the node array and blob.
    pub fn validate(&self) -> Result<(), CodecError> {
        let count = self.node_count();
        if count > 0 && self.root_index >= count {
            return Err(CodecError::InvalidRootIndex {
                root: self.root_index,
                node_count: count,
            });
        }

        for (i, node) in self.nodes.iter().enumerate() {
            let i = i as u32;
            for (field, target) in [
                ("child", node.child_index),
                ("next", node.next_index),
                ("parent", node.parent_index),
            ] {
                if target >= count {
                    return Err(CodecError::InvalidLink { node: i, field, target });
                }
            }
            self.props_slice(node)?;
        }
        Ok(())
    }
}

/// Iterator over a node's children following the sibling chain.
pub struct Children<'a> {
    ast: &'a FlatAst,
    next: Option<NodeIndex>,
    remaining: usize,
}

impl Iterator for Children<'_> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<Self::Item> {
        // A malformed chain may loop; never walk more links than there are nodes.
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next?;
        self.next = self.ast.node(current).and_then(FlatNode::next_sibling);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlatAst {
        let mut ast = FlatAst::new();
        ast.nodes = vec![
            FlatNode {
                child_index: 1,
                ..Default::default()
            },
            FlatNode {
                next_index: 2,
                parent_index: 0,
                ..Default::default()
            },
            FlatNode {
                parent_index: 0,
                ..Default::default()
            },
        ];
        ast
    }

    #[test]
    fn test_children_follow_sibling_chain() {
        let ast = sample();
        let children = ast.children(NodeIndex::new(0)).collect::<Vec<_>>();
        assert_eq!(children, vec![NodeIndex::new(1), NodeIndex::new(2)]);
        assert_eq!(ast.children(NodeIndex::new(1)).count(), 0);
    }

    #[test]
    fn test_parent_of_root_is_none() {
        let ast = sample();
        assert_eq!(ast.parent(NodeIndex::new(0)), None);
        assert_eq!(ast.parent(NodeIndex::new(2)), Some(NodeIndex::new(0)));
    }

    #[test]
    fn test_cyclic_chain_terminates() {
        let mut ast = sample();
        ast.nodes[2].next_index = 1;
        assert_eq!(ast.children(NodeIndex::new(0)).count(), 3);
    }

    #[test]
    fn test_validate_rejects_dangling_link() {
        let mut ast = sample();
        ast.nodes[1].next_index = 9;
        assert!(matches!(
            ast.validate(),
            Err(CodecError::InvalidLink {
                node: 1,
                field: "next",
                target: 9
            })
        ));
    }

    #[test]
    fn test_set_root_out_of_range() {
        let mut ast = sample();
        assert!(ast.set_root(NodeIndex::new(3)).is_err());
        assert!(ast.set_root(NodeIndex::new(2)).is_ok());
        assert_eq!(ast.root_index(), NodeIndex::new(2));
    }
}
