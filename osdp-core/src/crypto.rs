//! Secure channel cryptography
//!
//! All primitives are AES-128 based:
//! - Session keys are single-block encryptions of a derivation block under the base key
//! - Cryptograms are single-block encryptions of the two random numbers
//! - The MAC is a CBC-MAC keyed with S-MAC1 for all but the last block and
//!   S-MAC2 for the last block
//! - Data is AES-CBC encrypted with S-ENC after `0x80 00..` padding

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use tracing::trace;
use zeroize::Zeroizing;

use crate::{
    constants::BLOCK_SIZE,
    error::{Error, Result},
    keys::{SecretKey, SessionKeys},
};

/// One AES block
pub type Block = [u8; BLOCK_SIZE];

const PAD_MARKER: u8 = 0x80;

fn cipher(key: &SecretKey) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

fn to_block(bytes: &[u8]) -> Block {
    let mut block = [0u8; BLOCK_SIZE];
    block.copy_from_slice(bytes);
    block
}

/// Encrypt a single block (AES-128 ECB)
pub fn encrypt_block(key: &SecretKey, block: &Block) -> Block {
    let mut out = GenericArray::clone_from_slice(block);
    cipher(key).encrypt_block(&mut out);
    to_block(&out)
}

fn derive_key(scbk: &SecretKey, tag: [u8; 2], rnd_a: &[u8; 8]) -> SecretKey {
    let mut input = Zeroizing::new([0u8; BLOCK_SIZE]);
    input[..2].copy_from_slice(&tag);
    input[2..8].copy_from_slice(&rnd_a[..6]);
    SecretKey::new(encrypt_block(scbk, &input))
}

/// Derive S-ENC, S-MAC1 and S-MAC2 from the base key and RND.A
pub fn derive_session_keys(scbk: &SecretKey, rnd_a: &[u8; 8]) -> SessionKeys {
    trace!("Deriving session keys");

    SessionKeys {
        enc: derive_key(scbk, [0x01, 0x82], rnd_a),
        mac1: derive_key(scbk, [0x01, 0x01], rnd_a),
        mac2: derive_key(scbk, [0x01, 0x02], rnd_a),
    }
}

fn concat(first: &[u8; 8], second: &[u8; 8]) -> Block {
    let mut block = [0u8; BLOCK_SIZE];
    block[..8].copy_from_slice(first);
    block[8..].copy_from_slice(second);
    block
}

/// Client cryptogram: AES(S-ENC, RND.A || RND.B)
pub fn client_cryptogram(keys: &SessionKeys, rnd_a: &[u8; 8], rnd_b: &[u8; 8]) -> Block {
    encrypt_block(&keys.enc, &concat(rnd_a, rnd_b))
}

/// Server cryptogram: AES(S-ENC, RND.B || RND.A)
pub fn server_cryptogram(keys: &SessionKeys, rnd_a: &[u8; 8], rnd_b: &[u8; 8]) -> Block {
    encrypt_block(&keys.enc, &concat(rnd_b, rnd_a))
}

/// Initial R-MAC: AES(S-MAC2, AES(S-MAC1, server cryptogram))
pub fn initial_rmac(keys: &SessionKeys, server_cryptogram: &Block) -> Block {
    let inner = encrypt_block(&keys.mac1, server_cryptogram);
    encrypt_block(&keys.mac2, &inner)
}

fn xor_into(block: &mut Block, other: &Block) {
    for (b, o) in block.iter_mut().zip(other) {
        *b ^= o;
    }
}

/// Compute the full 16-byte MAC of `data` chained from `iv`
///
/// Frames carry only the first 4 bytes; the full value becomes the IV of
/// the next MAC in the opposite direction.
pub fn compute_mac(keys: &SessionKeys, iv: &Block, data: &[u8]) -> Block {
    let mut padded = data.to_vec();
    if padded.is_empty() || padded.len() % BLOCK_SIZE != 0 {
        padded.push(PAD_MARKER);
        padded.resize(padded.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
    }

    let mac1 = cipher(&keys.mac1);
    let mac2 = cipher(&keys.mac2);

    let block_count = padded.len() / BLOCK_SIZE;
    let mut chain = *iv;

    for (i, chunk) in padded.chunks_exact(BLOCK_SIZE).enumerate() {
        let mut block = to_block(chunk);
        xor_into(&mut block, &chain);

        let mut ga = GenericArray::from(block);
        if i + 1 == block_count {
            mac2.encrypt_block(&mut ga);
        } else {
            mac1.encrypt_block(&mut ga);
        }
        chain = to_block(&ga);
    }

    chain
}

/// Bitwise NOT of a block, used to derive the data encryption IV from a MAC
pub fn invert(block: &Block) -> Block {
    let mut out = *block;
    for b in out.iter_mut() {
        *b = !*b;
    }
    out
}

/// Pad and AES-CBC encrypt data with S-ENC
pub fn encrypt_data(keys: &SessionKeys, iv: &Block, data: &[u8]) -> Vec<u8> {
    let mut buf = data.to_vec();
    buf.push(PAD_MARKER);
    buf.resize(buf.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);

    let enc = cipher(&keys.enc);
    let mut chain = *iv;

    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        let mut block = to_block(chunk);
        xor_into(&mut block, &chain);

        let mut ga = GenericArray::from(block);
        enc.encrypt_block(&mut ga);
        chain = to_block(&ga);
        chunk.copy_from_slice(&chain);
    }

    buf
}

/// AES-CBC decrypt data with S-ENC and strip the padding
///
/// # Errors
///
/// Returns `MalformedFrame` if the ciphertext is not block aligned or the
/// padding marker is missing.
pub fn decrypt_data(keys: &SessionKeys, iv: &Block, data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(Error::MalformedFrame(format!(
            "encrypted data length {} is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }

    let dec = cipher(&keys.enc);
    let mut chain = *iv;
    let mut out = Vec::with_capacity(data.len());

    for chunk in data.chunks_exact(BLOCK_SIZE) {
        let mut ga = GenericArray::clone_from_slice(chunk);
        dec.decrypt_block(&mut ga);

        let mut block = to_block(&ga);
        xor_into(&mut block, &chain);
        out.extend_from_slice(&block);

        chain.copy_from_slice(chunk);
    }

    while out.last() == Some(&0) {
        out.pop();
    }
    if out.pop() != Some(PAD_MARKER) {
        return Err(Error::MalformedFrame("missing encryption padding marker".into()));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RND_A: [u8; 8] = [0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7];
    const RND_B: [u8; 8] = [0xC0, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7];

    fn keys() -> SessionKeys {
        derive_session_keys(&SecretKey::install_mode(), &RND_A)
    }

    #[test]
    fn test_aes_known_answer() {
        // FIPS-197 appendix C.1
        let key = SecretKey::from_hex("000102030405060708090a0b0c0d0e0f").unwrap();
        let plain: Block = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        let expected = hex::decode("69c4e0d86a7b0430d8cdb78070b4c55a").unwrap();

        assert_eq!(encrypt_block(&key, &plain).to_vec(), expected);
    }

    #[test]
    fn test_session_keys_are_distinct() {
        let keys = keys();
        assert_ne!(keys.enc, keys.mac1);
        assert_ne!(keys.mac1, keys.mac2);
        assert_ne!(keys.enc, keys.mac2);
    }

    #[test]
    fn test_session_keys_depend_on_rnd_a() {
        let other = derive_session_keys(&SecretKey::install_mode(), &[0u8; 8]);
        assert_ne!(keys().enc, other.enc);
    }

    #[test]
    fn test_cryptograms_differ_by_direction() {
        let keys = keys();
        assert_ne!(
            client_cryptogram(&keys, &RND_A, &RND_B),
            server_cryptogram(&keys, &RND_A, &RND_B)
        );
    }

    #[test]
    fn test_encrypt_decrypt() {
        let keys = keys();
        let iv = [0x5A; BLOCK_SIZE];

        for len in [1usize, 15, 16, 17, 40] {
            let data: Vec<u8> = (0..len as u8).collect();
            let encrypted = encrypt_data(&keys, &iv, &data);

            assert_eq!(encrypted.len() % BLOCK_SIZE, 0);
            assert!(encrypted.len() > data.len());
            assert_eq!(decrypt_data(&keys, &iv, &encrypted).unwrap(), data);
        }
    }

    #[test]
    fn test_decrypt_with_wrong_iv_fails_or_differs() {
        let keys = keys();
        let data = b"card data".to_vec();
        let encrypted = encrypt_data(&keys, &[0u8; BLOCK_SIZE], &data);

        let result = decrypt_data(&keys, &[1u8; BLOCK_SIZE], &encrypted);
        assert!(result.map(|d| d != data).unwrap_or(true));
    }

    #[test]
    fn test_decrypt_rejects_unaligned() {
        assert!(decrypt_data(&keys(), &[0u8; BLOCK_SIZE], &[0u8; 15]).is_err());
    }

    #[test]
    fn test_mac_depends_on_iv_and_data() {
        let keys = keys();
        let data = [0x53, 0x01, 0x0E, 0x00, 0x0D, 0x02, 0x15, 0x60];

        let mac = compute_mac(&keys, &[0u8; BLOCK_SIZE], &data);
        assert_eq!(mac, compute_mac(&keys, &[0u8; BLOCK_SIZE], &data));
        assert_ne!(mac, compute_mac(&keys, &[1u8; BLOCK_SIZE], &data));
        assert_ne!(mac, compute_mac(&keys, &[0u8; BLOCK_SIZE], &data[..7]));
    }

    #[test]
    fn test_mac_multi_block() {
        let keys = keys();
        let data = [0xAB; 40];
        let mac = compute_mac(&keys, &[0u8; BLOCK_SIZE], &data);

        let mut tampered = data;
        tampered[3] ^= 0x01;
        assert_ne!(mac, compute_mac(&keys, &[0u8; BLOCK_SIZE], &tampered));
    }

    #[test]
    fn test_invert() {
        assert_eq!(invert(&[0x0F; BLOCK_SIZE]), [0xF0; BLOCK_SIZE]);
    }
}
