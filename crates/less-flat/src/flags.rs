use bitflags::bitflags;

bitflags! {
    /// Per-node flags carried in the `flags:u16` field of a FlatAST node record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NodeFlags: u16 {
        /// The node was written inside parentheses
        const PARENS = 0x0001;
        /// The parentheses belong to an enclosing operation
        const PARENS_IN_OP = 0x0002;
        const VISIBLE = 0x0004;
        const INVISIBLE = 0x0008;
        /// Visibility was set explicitly rather than inherited
        const VISIBILITY_SET = 0x0010;
        /// A `filename` property is present
        const FILE_INFO = 0x0020;
        /// An `index` property is present
        const EXPLICIT_INDEX = 0x0040;
    }
}

impl NodeFlags {
    /// Flags that describe the node itself, as opposed to the presence of optional properties.
    pub const SYNTAX: NodeFlags = NodeFlags::PARENS
        .union(NodeFlags::PARENS_IN_OP)
        .union(NodeFlags::VISIBLE)
        .union(NodeFlags::INVISIBLE)
        .union(NodeFlags::VISIBILITY_SET);

    pub fn visibility(self) -> Option<bool> {
        if !self.contains(NodeFlags::VISIBILITY_SET) {
            return None;
        }
        Some(self.contains(NodeFlags::VISIBLE) && !self.contains(NodeFlags::INVISIBLE))
    }

    pub fn with_visibility(self, visible: bool) -> Self {
        let flags = (self - NodeFlags::VISIBLE - NodeFlags::INVISIBLE) | NodeFlags::VISIBILITY_SET;
        if visible {
            flags | NodeFlags::VISIBLE
        } else {
            flags | NodeFlags::INVISIBLE
        }
    }
}
