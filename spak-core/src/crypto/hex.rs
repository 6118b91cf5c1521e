use crate::error::{Result, SpakError};

pub fn parse_hex_array<const N: usize>(hex_str: &str) -> Result<[u8; N]> {
    let bytes =
        hex::decode(hex_str.trim()).map_err(|e| SpakError::Key(format!("invalid hex: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        SpakError::Key(format!(
            "expected {N} bytes ({} hex chars), got {}",
            N * 2,
            bytes.len()
        ))
    })
}
