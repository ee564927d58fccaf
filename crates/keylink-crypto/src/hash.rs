//! BLAKE3-based key derivation.

/// BLAKE3 output size.
pub const HASH_SIZE: usize = 32;

/// Derive a 32-byte key from input key material under a context label.
///
/// Uses BLAKE3's keyed-hash mode: the label is hashed into a derivation key,
/// which is then used to key a hash of `ikm`. This gives domain separation
/// between differently-labeled derivations from the same input.
pub fn hkdf(context: &[u8], ikm: &[u8], salt: &[u8], out: &mut [u8; 32]) {
    let mut context_key = [0u8; 32];
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(context);
    context_key.copy_from_slice(hasher.finalize().as_bytes());

    let mut keyed = blake3::Hasher::new_keyed(&context_key);
    keyed.update(ikm);
    out.copy_from_slice(keyed.finalize().as_bytes());
}

/// Compute a plain BLAKE3 hash of `data`.
#[must_use]
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}
