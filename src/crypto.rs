//! LoRaWAN 1.0 cryptography: AES-128-ECB block primitive, AES-CMAC (for the
//! 4-byte MIC), the LoRaWAN payload cipher, and session-key derivation.
//!
//! See LoRaWAN specification §4.3.3 (MIC) and §6.2.5 (payload cipher).

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::codec::{padded, reverse};

pub type AesKey = [u8; 16];

/// Uplink direction byte used in `b0`/`a_i` blocks.
pub const DIR_UP: u8 = 0;
/// Downlink direction byte used in `b0`/`a_i` blocks.
pub const DIR_DOWN: u8 = 1;

fn aes_ecb_encrypt_block(key: &AesKey, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = *block;
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut buf));
    buf
}

fn aes_ecb_decrypt_block(key: &AesKey, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = *block;
    cipher.decrypt_block(GenericArray::from_mut_slice(&mut buf));
    buf
}

/// AES-CMAC over an arbitrary-length message, returning the full 16-byte tag.
pub fn aes_cmac(key: &AesKey, msg: &[u8]) -> [u8; 16] {
    let mut mac = Cmac::<Aes128>::new(GenericArray::from_slice(key));
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Builds the `B0` block used for MIC computation:
/// `0x49 00 00 00 00 dir reverse(devaddr) fcnt_le:u32 0x00 len:u8`.
fn b0(dir: u8, devaddr: [u8; 4], fcnt: u32, len: u8) -> [u8; 16] {
    let mut b = [0u8; 16];
    b[0] = 0x49;
    // bytes 1..5 stay zero
    b[5] = dir;
    b[6..10].copy_from_slice(&reverse(&devaddr));
    b[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b[14] = 0x00;
    b[15] = len;
    b
}

/// Builds the `A_i` keystream block:
/// `0x01 00 00 00 00 dir reverse(devaddr) fcnt_le:u32 0x00 i:u8`.
fn a_block(dir: u8, devaddr: [u8; 4], fcnt: u32, i: u8) -> [u8; 16] {
    let mut a = [0u8; 16];
    a[0] = 0x01;
    a[5] = dir;
    a[6..10].copy_from_slice(&reverse(&devaddr));
    a[10..14].copy_from_slice(&fcnt.to_le_bytes());
    a[14] = 0x00;
    a[15] = i;
    a
}

/// `MIC = aes_cmac(key, b0 || msg)[0..4]`.
pub fn compute_mic(key: &AesKey, dir: u8, devaddr: [u8; 4], fcnt: u32, msg: &[u8]) -> [u8; 4] {
    let b0 = b0(dir, devaddr, fcnt, msg.len() as u8);
    let mut buf = Vec::with_capacity(16 + msg.len());
    buf.extend_from_slice(&b0);
    buf.extend_from_slice(msg);
    let tag = aes_cmac(key, &buf);
    [tag[0], tag[1], tag[2], tag[3]]
}

/// The LoRaWAN payload cipher (an AES-CTR variant with the block counter
/// starting at 1). It is its own inverse: calling `cipher` again on its own
/// output with the same key/dir/devaddr/fcnt reproduces the input, since each
/// block is XORed in place against a keystream block that depends only on
/// `dir`/`devaddr`/`fcnt`/block-index, never on the data itself.
///
/// Each 16-byte block `i` (1-indexed) is XORed, byte for byte and in order,
/// against the keystream block `S_i = AES_ECB_encrypt(key, A_i)`; the final
/// partial block truncates the keystream to the remaining byte count. The
/// result is the wire-ready FRMPayload as-is — callers must not reverse or
/// otherwise reorder it, since doing so would desynchronize the byte order
/// from what a real device's AES-CTR engine produces.
pub fn cipher(data: &[u8], key: &AesKey, dir: u8, devaddr: [u8; 4], fcnt: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i: u8 = 1;
    for chunk in data.chunks(16) {
        let s_i = aes_ecb_encrypt_block(key, &a_block(dir, devaddr, fcnt, i));
        out.extend(chunk.iter().zip(s_i.iter()).map(|(x, y)| x ^ y));
        i = i.wrapping_add(1);
    }
    out
}

/// Derives a session key: `AES_ECB_encrypt(appkey, pad16(prefix || app_nonce || net_id || dev_nonce))`.
/// `prefix` is `0x01` for NwkSKey, `0x02` for AppSKey.
pub fn derive_session_key(
    appkey: &AesKey,
    prefix: u8,
    app_nonce: [u8; 3],
    net_id: [u8; 3],
    dev_nonce: [u8; 2],
) -> AesKey {
    let mut msg = Vec::with_capacity(9);
    msg.push(prefix);
    msg.extend_from_slice(&app_nonce);
    msg.extend_from_slice(&net_id);
    msg.extend_from_slice(&dev_nonce);
    let buf = padded(16, &msg);
    let block: [u8; 16] = buf[..16].try_into().expect("padded to 16 bytes");
    aes_ecb_encrypt_block(appkey, &block)
}

/// Join-accept "encryption": unlike data frames, the server runs
/// `AES_ECB_decrypt(appkey, zero-padded(macpayload || mic))` to produce the
/// wire bytes, and the device reverses it with a plain encrypt. This
/// asymmetry is specified by LoRaWAN and must be matched bit-for-bit.
pub fn encrypt_join_accept(appkey: &AesKey, macpayload_and_mic: &[u8]) -> Vec<u8> {
    ecb_whole_buffer(appkey, macpayload_and_mic, aes_ecb_decrypt_block)
}

/// The device-side (and test-side) inverse of [`encrypt_join_accept`]: a
/// plain AES-ECB encrypt of the padded ciphertext reproduces the plaintext.
pub fn decrypt_join_accept(appkey: &AesKey, ciphertext: &[u8]) -> Vec<u8> {
    ecb_whole_buffer(appkey, ciphertext, aes_ecb_encrypt_block)
}

fn ecb_whole_buffer(
    key: &AesKey,
    data: &[u8],
    block_fn: fn(&AesKey, &[u8; 16]) -> [u8; 16],
) -> Vec<u8> {
    let original_len = data.len();
    let buf = padded(16, data);
    let mut out = Vec::with_capacity(buf.len());
    for chunk in buf.chunks(16) {
        let block: [u8; 16] = chunk.try_into().expect("chunk is 16 bytes");
        out.extend_from_slice(&block_fn(key, &block));
    }
    out.truncate(original_len);
    out
}
