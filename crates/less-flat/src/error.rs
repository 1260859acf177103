use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },
    #[error("Invalid magic 0x{0:08X}")]
    InvalidMagic(u32),
    #[error("Unsupported FlatAST version {0}")]
    UnsupportedVersion(u32),
    #[error("Empty AST")]
    EmptyAst,
    #[error("Invalid root index {root} for {node_count} nodes")]
    InvalidRootIndex { root: u32, node_count: u32 },
    #[error("Node {node} has an invalid {field} link to {target}")]
    InvalidLink {
        node: u32,
        field: &'static str,
        target: u32,
    },
    #[error("Offset {offset} with length {length} is out of range ({limit} bytes available)")]
    OffsetOutOfRange {
        offset: usize,
        length: usize,
        limit: usize,
    },
    #[error("Unknown node type \"{0}\"")]
    UnknownNodeType(String),
    #[error("Unknown node type id {0}")]
    UnknownTypeId(u16),
    #[error("String index {0} is out of range")]
    StringIndexOutOfRange(u32),
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("Invalid node properties: {0}")]
    Properties(#[from] serde_json::Error),
    #[error("FlatAST section exceeds the 32-bit offset range")]
    TooLarge,
    #[error("Tree nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("No type ids left for \"{0}\"")]
    TypeIdsExhausted(String),
}
