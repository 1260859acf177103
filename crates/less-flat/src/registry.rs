use rustc_hash::FxHashMap;
use strum::IntoEnumIterator;

use crate::error::CodecError;
use crate::node::NodeKind;

/// First type id handed out to host-defined kinds. Ids below it are reserved for built-ins.
pub const FIRST_EXTENSION_ID: u16 = 0x100;

/// Maps node type names to the `u16` ids stored in FlatAST records.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    ids: FxHashMap<String, u16>,
    names: FxHashMap<u16, String>,
    next_extension_id: u32,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TypeRegistry {
    /// A registry containing every built-in [`NodeKind`].
    pub fn builtin() -> Self {
        let mut registry = Self {
            ids: FxHashMap::default(),
            names: FxHashMap::default(),
            next_extension_id: u32::from(FIRST_EXTENSION_ID),
        };
        for kind in NodeKind::iter() {
            registry.insert(kind.name(), kind.id());
        }
        registry
    }

    /// Registers a host-defined kind and returns its id. Registering a known name is a no-op.
    pub fn register(&mut self, name: &str) -> Result<u16, CodecError> {
        if let Some(id) = self.ids.get(name) {
            return Ok(*id);
        }

        let id = u16::try_from(self.next_extension_id).map_err(|_| CodecError::TypeIdsExhausted(name.to_string()))?;
        self.next_extension_id += 1;
        self.insert(name, id);
        Ok(id)
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.ids.get(name).copied()
    }

    pub fn name_of(&self, id: u16) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn is_extension(id: u16) -> bool {
        NodeKind::from_repr(id).is_none()
    }

    /// Dense id-indexed name list, as written to the FlatAST type table.
    pub fn type_table(&self) -> Vec<String> {
        let len = self.names.keys().max().map(|max| *max as usize + 1).unwrap_or(0);
        let mut table = vec![String::new(); len];
        for (id, name) in &self.names {
            table[*id as usize] = name.clone();
        }
        table
    }

    fn insert(&mut self, name: &str, id: u16) {
        self.ids.insert(name.to_string(), id);
        self.names.insert(id, name.to_string());
    }
}
