//! Bit/byte primitives shared by the crypto and framing layers.
//!
//! LoRaWAN transmits DevAddr and EUI fields little-endian on the wire but the
//! rest of this crate (and the store records) treat them as big-endian byte
//! strings, so `reverse` sits at every wire boundary.

/// Byte-reverse a buffer. Used to flip between the wire's little-endian
/// DevAddr/EUI encoding and the big-endian form used everywhere else.
pub fn reverse(b: &[u8]) -> Vec<u8> {
    b.iter().rev().copied().collect()
}

/// Right-pad `m` with zero bytes to the next multiple of `n` bytes.
pub fn padded(n: usize, m: &[u8]) -> Vec<u8> {
    let mut out = m.to_vec();
    let rem = out.len() % n;
    if rem != 0 {
        out.extend(std::iter::repeat(0u8).take(n - rem));
    }
    out
}

/// Upper-case hex encoding, no separator.
pub fn to_hex(b: &[u8]) -> String {
    let mut out = String::with_capacity(b.len() * 2);
    for byte in b {
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Decode an upper- or lower-case hex string into bytes.
pub fn from_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s)
}
