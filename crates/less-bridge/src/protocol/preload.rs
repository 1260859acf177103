use less_flat::io::{read_str_at, read_u8_at, read_u32_at, to_u32, write_str, write_u32};

use super::ProtocolError;
use super::value::WireValue;

/// A variable pushed into the preload section ahead of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadedVariable {
    pub name: String,
    pub important: bool,
    pub value: WireValue,
}

impl PreloadedVariable {
    /// `nameLen:u32 | name | important:u8 | value`
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        write_str(out, &self.name)?;
        out.push(u8::from(self.important));
        self.value.encode(out)
    }

    pub fn decode(data: &[u8], offset: &mut usize) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: read_str_at(data, offset, "variable name")?,
            important: read_u8_at(data, offset)? != 0,
            value: WireValue::decode(data, offset)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }
}

/// `count:u32` followed by `count` entries.
pub fn encode_preload(vars: &[PreloadedVariable]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    write_u32(&mut out, to_u32(vars.len())?);
    for var in vars {
        var.encode(&mut out)?;
    }
    Ok(out)
}

pub fn decode_preload(data: &[u8]) -> Result<Vec<PreloadedVariable>, ProtocolError> {
    let mut offset = 0;
    let count = read_u32_at(data, &mut offset)? as usize;
    if count > data.len() {
        return Err(ProtocolError::Malformed(format!("preload claims {count} entries")));
    }
    (0..count)
        .map(|_| PreloadedVariable::decode(data, &mut offset))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, important: bool, value: WireValue) -> PreloadedVariable {
        PreloadedVariable {
            name: name.to_string(),
            important,
            value,
        }
    }

    #[test]
    fn test_preload_section() {
        let vars = vec![
            var("@primary", false, WireValue::Color { rgb: [0.0, 0.0, 255.0], alpha: None }),
            var("@spacing", true, WireValue::Dimension { value: 4.0, unit: "px".to_string() }),
        ];
        let bytes = encode_preload(&vars).unwrap();
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(decode_preload(&bytes).unwrap(), vars);
    }

    #[test]
    fn test_empty_section() {
        assert!(decode_preload(&0u32.to_le_bytes()).unwrap().is_empty());
        // A zeroed region reads as an empty preload section.
        assert!(decode_preload(&[0u8; 64]).unwrap().is_empty());
    }

    #[test]
    fn test_entry_layout() {
        let bytes = var("@a", true, WireValue::Null).to_bytes().unwrap();
        assert_eq!(bytes, vec![2, 0, 0, 0, b'@', b'a', 1, 0]);
    }

    #[test]
    fn test_bogus_count() {
        let mut bytes = 1000u32.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(decode_preload(&bytes).is_err());
    }
}
