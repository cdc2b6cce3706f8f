use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid hex input")]
    InvalidHex,

    #[error("odd-length UTF-16 input")]
    OddLength,
}

/// Encode text as UTF-16 big-endian bytes. Code points beyond the BMP become
/// surrogate pairs, which text-mode SMS accepts as paired units.
pub fn encode_ucs2(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

/// Encode text as the upper-case hex form the modem expects in UCS-2 mode.
pub fn ucs2_hex(text: &str) -> String {
    hex::encode_upper(encode_ucs2(text))
}

/// Decode a hex string carrying UTF-16 big-endian text. Unpaired surrogates
/// decode to U+FFFD rather than failing the whole message.
pub fn decode_ucs2_hex(hex_text: &str) -> Result<String, CodecError> {
    let bytes = hex::decode(hex_text.trim()).map_err(|_| CodecError::InvalidHex)?;
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength);
    }

    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    Ok(char::decode_utf16(units)
        .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}
