//! `less-flat` turns Less syntax trees into a linear, relocatable binary buffer and back.
//!
//! A FlatAST is an array of fixed 24-byte node records linked by index (first child, next
//! sibling, parent), followed by a deduplicated string table, an optional type-name table,
//! and a blob of per-node property maps. Because nothing in it is a pointer, the buffer can be
//! written into shared memory and read by another process as-is.
//!
//! ## Examples
//!
//! ```rust
//! use less_flat::{FlatAst, Node, NodeFlags, flatten, unflatten};
//!
//! let tree = Node::ruleset(
//!     Vec::new(),
//!     vec![Node::declaration("width", Node::dimension(10.0, "px").with_parens())],
//! );
//! let bytes = flatten(&tree).unwrap().to_bytes().unwrap();
//!
//! let ast = FlatAst::from_bytes(&bytes).unwrap();
//! assert_eq!(ast.node_count(), 3);
//!
//! let root = unflatten(&ast).unwrap();
//! let dimension = &root.children[0].children[0];
//! assert!(dimension.flags.contains(NodeFlags::PARENS));
//! ```
mod bytes;
mod decode;
mod encode;
mod error;
mod flags;
mod flat;
pub mod io;
mod node;
mod props;
mod registry;
mod strings;

pub use decode::{GenericNode, unflatten, unflatten_with};
pub use encode::{flatten, flatten_with};
pub use error::CodecError;
pub use flags::NodeFlags;
pub use flat::{Children, FlatAst, FlatNode, HEADER_SIZE, MAGIC, MAX_TREE_DEPTH, NODE_SIZE, NodeIndex, VERSION};
pub use node::{ChildField, FileInfo, Node, NodeData, NodeKind, TreeNode};
pub use props::{Properties, PropertyValue};
pub use registry::{FIRST_EXTENSION_ID, TypeRegistry};
pub use strings::StringTable;
