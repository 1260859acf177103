//! Little-endian wire layout of a FlatAST:
//!
//! ```text
//! magic u32 | version u32 | nodeCount u32 | rootIndex u32 | nodesOffset u32 | stringTableOffset u32 | typeTableOffset u32
//! nodeCount * 24-byte node records
//! string table: count u32, (length u32, bytes)*
//! type table (optional, typeTableOffset = 0 when absent): count u32, (length u32, bytes)*
//! property blob: length u32, bytes
//! ```
use crate::error::CodecError;
use crate::flags::NodeFlags;
use crate::flat::{FlatAst, FlatNode, HEADER_SIZE, MAGIC, NODE_SIZE, VERSION};
use crate::io::{read_bytes_at, read_str_at, read_u16_at, read_u32_at, to_u32, write_str, write_u16, write_u32};
use crate::strings::StringTable;

impl FlatAst {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut table_bytes = Vec::new();
        write_table(&mut table_bytes, self.strings.iter())?;
        let mut type_bytes = Vec::new();
        if let Some(types) = &self.types {
            write_table(&mut type_bytes, types.iter().map(String::as_str))?;
        }

        let nodes_offset = HEADER_SIZE;
        let string_table_offset = nodes_offset + self.nodes.len() * NODE_SIZE;
        let type_table_offset = if self.types.is_some() {
            string_table_offset + table_bytes.len()
        } else {
            0
        };

        let mut out = Vec::with_capacity(
            string_table_offset + table_bytes.len() + type_bytes.len() + 4 + self.props.len(),
        );
        write_u32(&mut out, MAGIC);
        write_u32(&mut out, self.version);
        write_u32(&mut out, self.node_count());
        write_u32(&mut out, self.root_index);
        write_u32(&mut out, to_u32(nodes_offset)?);
        write_u32(&mut out, to_u32(string_table_offset)?);
        write_u32(&mut out, to_u32(type_table_offset)?);

        for node in &self.nodes {
            write_u16(&mut out, node.type_id);
            write_u16(&mut out, node.flags.bits());
            write_u32(&mut out, node.child_index);
            write_u32(&mut out, node.next_index);
            write_u32(&mut out, node.parent_index);
            write_u32(&mut out, node.props_offset);
            write_u32(&mut out, node.props_length);
        }

        out.extend_from_slice(&table_bytes);
        out.extend_from_slice(&type_bytes);
        write_u32(&mut out, to_u32(self.props.len())?);
        out.extend_from_slice(&self.props);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_SIZE {
            return Err(CodecError::BufferTooSmall {
                needed: HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut offset = 0;
        let magic = read_u32_at(data, &mut offset)?;
        if magic != MAGIC {
            return Err(CodecError::InvalidMagic(magic));
        }
        let version = read_u32_at(data, &mut offset)?;
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let node_count = read_u32_at(data, &mut offset)?;
        let root_index = read_u32_at(data, &mut offset)?;
        let nodes_offset = read_u32_at(data, &mut offset)? as usize;
        let string_table_offset = read_u32_at(data, &mut offset)? as usize;
        let type_table_offset = read_u32_at(data, &mut offset)? as usize;

        let nodes_len = (node_count as usize)
            .checked_mul(NODE_SIZE)
            .ok_or(CodecError::TooLarge)?;
        check_range(data, nodes_offset, nodes_len)?;
        let mut offset = nodes_offset;
        let mut nodes = Vec::with_capacity(node_count as usize);
        for _ in 0..node_count {
            nodes.push(FlatNode {
                type_id: read_u16_at(data, &mut offset)?,
                flags: NodeFlags::from_bits_retain(read_u16_at(data, &mut offset)?),
                child_index: read_u32_at(data, &mut offset)?,
                next_index: read_u32_at(data, &mut offset)?,
                parent_index: read_u32_at(data, &mut offset)?,
                props_offset: read_u32_at(data, &mut offset)?,
                props_length: read_u32_at(data, &mut offset)?,
            });
        }

        check_range(data, string_table_offset, 4)?;
        let mut offset = string_table_offset;
        let strings = read_table(data, &mut offset, "string table")?
            .into_iter()
            .collect::<StringTable>();

        let types = if type_table_offset != 0 {
            check_range(data, type_table_offset, 4)?;
            offset = type_table_offset;
            Some(read_table(data, &mut offset, "type table")?)
        } else {
            None
        };

        let props_len = read_u32_at(data, &mut offset)? as usize;
        let props = read_bytes_at(data, &mut offset, props_len)?.to_vec();

        let ast = FlatAst {
            version,
            root_index,
            nodes,
            strings,
            types,
            props,
        };
        ast.validate()?;
        Ok(ast)
    }
}

fn check_range(data: &[u8], offset: usize, length: usize) -> Result<(), CodecError> {
    match offset.checked_add(length) {
        Some(end) if end <= data.len() => Ok(()),
        _ => Err(CodecError::OffsetOutOfRange {
            offset,
            length,
            limit: data.len(),
        }),
    }
}

fn write_table<'a>(out: &mut Vec<u8>, entries: impl ExactSizeIterator<Item = &'a str>) -> Result<(), CodecError> {
    write_u32(out, to_u32(entries.len())?);
    for entry in entries {
        write_str(out, entry)?;
    }
    Ok(())
}

fn read_table(data: &[u8], offset: &mut usize, what: &'static str) -> Result<Vec<String>, CodecError> {
    let count = read_u32_at(data, offset)? as usize;
    // Every entry needs at least its 4-byte length prefix.
    check_range(data, *offset, count.saturating_mul(4))?;
    (0..count).map(|_| read_str_at(data, offset, what)).collect()
}
