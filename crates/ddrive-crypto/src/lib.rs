//! Per-chunk authenticated encryption for the storage engine.
//!
//! Each chunk is encrypted independently with its own salt and nonce, so
//! that chunks can be uploaded, fetched and retried out of order without
//! any shared encryption state. See [`encrypt_chunk`] and [`decrypt_chunk`].

use aes_gcm::{
	aead::{Aead, KeyInit, Payload},
	Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

/// Maximum size of a plaintext chunk before encryption.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Bytes added to a chunk by [`encrypt_chunk`]: `salt(16) + nonce(12) + tag(16)`.
pub const ENC_OVERHEAD: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

/// The largest plaintext chunk that still fits in [`CHUNK_SIZE`] once encrypted.
pub const EFFECTIVE_CHUNK_SIZE: usize = CHUNK_SIZE - ENC_OVERHEAD;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const KDF_ITERATIONS: u32 = 100_000;

/// Ciphertexts shorter than this cannot possibly carry our envelope, and are
/// treated by [`decrypt_chunk`] as legacy unencrypted data.
const MIN_ENVELOPE_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN + 1;

/// Errors produced by the crypto primitive.
#[derive(Debug, Error)]
pub enum CryptoError {
	/// The chunk's authentication tag failed to verify under the derived key.
	/// The caller must treat this as corruption, not as a benign mismatch.
	#[error("chunk failed authenticated decryption")]
	AuthenticationFailed,

	/// A plaintext chunk larger than [`EFFECTIVE_CHUNK_SIZE`] was passed to
	/// [`encrypt_chunk`]; the resulting ciphertext would exceed the
	/// substrate's attachment limit.
	#[error("plaintext chunk of {0} bytes exceeds the effective chunk size of {EFFECTIVE_CHUNK_SIZE} bytes")]
	PlaintextTooLarge(usize),
}

/// A per-user encryption key. Opaque outside this crate; held by the caller
/// as raw bytes (typically fetched from, or lazily generated into, the
/// metadata store's `User.encryptionKey` column) and zeroized on drop.
#[derive(Clone)]
pub struct UserKey(Vec<u8>);

impl UserKey {
	pub fn from_bytes(bytes: Vec<u8>) -> Self {
		Self(bytes)
	}

	pub fn generate() -> Self {
		let mut bytes = vec![0u8; KEY_LEN];
		rand::thread_rng().fill_bytes(&mut bytes);
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}
}

impl Drop for UserKey {
	fn drop(&mut self) {
		self.0.zeroize();
	}
}

/// Encrypt one plaintext chunk for storage.
///
/// Draws a fresh random salt and nonce, derives a 32-byte key from `key` and
/// the salt via PBKDF2-HMAC-SHA256 ([`KDF_ITERATIONS`] rounds), and encrypts
/// with AES-256-GCM. The returned buffer is `salt ‖ nonce ‖ tag ‖ ciphertext`
/// — exactly [`ENC_OVERHEAD`] bytes larger than `plaintext`.
pub fn encrypt_chunk(plaintext: &[u8], key: &UserKey) -> Result<Vec<u8>, CryptoError> {
	if plaintext.len() > EFFECTIVE_CHUNK_SIZE {
		return Err(CryptoError::PlaintextTooLarge(plaintext.len()));
	}

	let mut salt = [0u8; SALT_LEN];
	let mut nonce_bytes = [0u8; NONCE_LEN];
	let mut rng = rand::thread_rng();
	rng.fill_bytes(&mut salt);
	rng.fill_bytes(&mut nonce_bytes);

	let derived = derive_key(key, &salt);
	let cipher = Aes256Gcm::new_from_slice(&derived).expect("key is exactly 32 bytes");
	let nonce = Nonce::from_slice(&nonce_bytes);

	// AES-GCM in the `aes-gcm` crate appends the 16-byte tag to the ciphertext.
	let ciphertext = cipher
		.encrypt(
			nonce,
			Payload {
				msg: plaintext,
				aad: &[],
			},
		)
		.map_err(|_| CryptoError::AuthenticationFailed)?;

	let mut out = Vec::with_capacity(ENC_OVERHEAD + plaintext.len());
	out.extend_from_slice(&salt);
	out.extend_from_slice(&nonce_bytes);
	out.extend_from_slice(&ciphertext);
	Ok(out)
}

/// Decrypt one chunk previously produced by [`encrypt_chunk`].
///
/// Buffers shorter than the envelope header are passed through unchanged —
/// this is the legacy-data safety net for pre-existing unencrypted chunks, and must only ever
/// be hit for chunks whose file is *not* marked `encrypted`. Any buffer that
/// looks like an envelope but fails authentication returns
/// [`CryptoError::AuthenticationFailed`].
pub fn decrypt_chunk(data: &[u8], key: &UserKey) -> Result<Vec<u8>, CryptoError> {
	if data.len() < MIN_ENVELOPE_LEN {
		return Ok(data.to_vec());
	}

	let (salt, rest) = data.split_at(SALT_LEN);
	let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

	let derived = derive_key(key, salt);
	let cipher = Aes256Gcm::new_from_slice(&derived).expect("key is exactly 32 bytes");
	let nonce = Nonce::from_slice(nonce_bytes);

	cipher
		.decrypt(
			nonce,
			Payload {
				msg: ciphertext,
				aad: &[],
			},
		)
		.map_err(|_| CryptoError::AuthenticationFailed)
}

fn derive_key(key: &UserKey, salt: &[u8]) -> [u8; KEY_LEN] {
	let mut out = [0u8; KEY_LEN];
	pbkdf2_hmac::<Sha256>(key.as_bytes(), salt, KDF_ITERATIONS, &mut out);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip() {
		let key = UserKey::generate();
		let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();
		let encrypted = encrypt_chunk(&plaintext, &key).unwrap();
		assert_eq!(encrypted.len(), plaintext.len() + ENC_OVERHEAD);
		let decrypted = decrypt_chunk(&encrypted, &key).unwrap();
		assert_eq!(decrypted, plaintext);
	}

	#[test]
	fn wrong_key_fails_auth() {
		let key = UserKey::generate();
		let other = UserKey::generate();
		let encrypted = encrypt_chunk(b"hello", &key).unwrap();
		let err = decrypt_chunk(&encrypted, &other).unwrap_err();
		assert!(matches!(err, CryptoError::AuthenticationFailed));
	}

	#[test]
	fn short_buffer_passes_through() {
		let key = UserKey::generate();
		let legacy = b"tiny";
		let result = decrypt_chunk(legacy, &key).unwrap();
		assert_eq!(result, legacy);
	}

	#[test]
	fn oversize_plaintext_rejected() {
		let key = UserKey::generate();
		let plaintext = vec![0u8; EFFECTIVE_CHUNK_SIZE + 1];
		let err = encrypt_chunk(&plaintext, &key).unwrap_err();
		assert!(matches!(err, CryptoError::PlaintextTooLarge(_)));
	}

	#[test]
	fn empty_chunk_round_trips() {
		let key = UserKey::generate();
		let encrypted = encrypt_chunk(&[], &key).unwrap();
		assert_eq!(encrypted.len(), ENC_OVERHEAD);
		assert_eq!(decrypt_chunk(&encrypted, &key).unwrap(), Vec::<u8>::new());
	}
}
