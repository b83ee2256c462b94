//! In-memory value representation and its on-disk codec.

/// Kind of an in-memory value.
///
/// Only [`ValueKind::Raw`] values have an on-disk encoding; `Ephemeral`
/// values are server-local and cannot be swapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Raw,
    Ephemeral,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    kind: ValueKind,
    bytes: Vec<u8>,
}

impl Value {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ValueKind::Raw,
            bytes: bytes.into(),
        }
    }

    pub fn ephemeral(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ValueKind::Ephemeral,
            bytes: bytes.into(),
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether this value kind supports being swapped to the persistent store.
    pub fn swappable(&self) -> bool {
        matches!(self.kind, ValueKind::Raw)
    }
}

const KIND_RAW: u8 = 0;

/// Encode a value for the persistent store (kind tag + length-prefixed bytes).
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + value.bytes.len());
    out.push(KIND_RAW);
    out.extend_from_slice(&(value.bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&value.bytes);
    out
}

/// Decode a value previously written by [`encode_value`].
pub fn decode_value(data: &[u8]) -> anyhow::Result<Value> {
    let mut offset = 0usize;
    let kind = read_u8(data, &mut offset)?;
    anyhow::ensure!(kind == KIND_RAW, "unknown value kind tag {kind}");
    let len = read_u32(data, &mut offset)? as usize;
    anyhow::ensure!(offset + len <= data.len(), "short value payload");
    Ok(Value::raw(data[offset..offset + len].to_vec()))
}

fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_codec_roundtrip() {
        let value = Value::raw(b"payload".to_vec());
        let encoded = encode_value(&value);
        let decoded = decode_value(&encoded).expect("decode value");
        assert_eq!(decoded, value);
    }

    #[test]
    fn decode_rejects_short_payload() {
        let value = Value::raw(b"payload".to_vec());
        let mut encoded = encode_value(&value);
        encoded.truncate(encoded.len() - 1);
        assert!(decode_value(&encoded).is_err());
    }

    #[test]
    fn ephemeral_values_are_not_swappable() {
        assert!(Value::raw(b"x".to_vec()).swappable());
        assert!(!Value::ephemeral(b"x".to_vec()).swappable());
    }
}
