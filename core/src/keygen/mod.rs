use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use zeroize::Zeroize;

use crate::error::MigrationError;

/// P-256 public-key multicodec prefix (two bytes), per the directory
/// ecosystem's did:key convention (§4.4).
const P256_PUBLIC_MULTICODEC: [u8; 2] = [0x80, 0x24];
/// P-256 private-key multicodec prefix (two bytes).
const P256_PRIVATE_MULTICODEC: [u8; 2] = [0x86, 0x26];

/// A generated rotation keypair (§4.4, §2 component 8). The private scalar
/// is zeroed on drop; `Debug` omits it.
pub struct RotationKeypair {
    public_did_key: String,
    private_multibase: Zeroizing32,
}

/// 32-byte private scalar wrapper that zeroizes on drop, following the
/// struct-shape + Drop pattern used for post-quantum secret keys elsewhere
/// in the pack.
struct Zeroizing32(Vec<u8>);

impl Drop for Zeroizing32 {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for RotationKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationKeypair")
            .field("public_did_key", &self.public_did_key)
            .field("private_multibase", &"<redacted>")
            .finish()
    }
}

impl RotationKeypair {
    pub fn public_did_key(&self) -> &str {
        &self.public_did_key
    }

    /// Private key encoded as `z`-prefixed base58btc multibase, to be sealed
    /// into the vault and eventually delivered to the user once (§3.2).
    pub fn private_multibase(&self) -> &str {
        std::str::from_utf8(&self.private_multibase.0).unwrap_or_default()
    }
}

/// Generates a P-256 keypair and encodes both halves in did:key multibase
/// form, verifying the derived public key matches the encoded one before
/// returning (§4.4, §8 round-trip law).
pub fn generate() -> Result<RotationKeypair, MigrationError> {
    let signing_key = SigningKey::random(&mut OsRng);
    let verifying_key = VerifyingKey::from(&signing_key);

    let encoded_point = verifying_key.to_encoded_point(true);
    let compressed = encoded_point.as_bytes();
    if compressed.len() != 33 {
        return Err(MigrationError::Unknown(
            "unexpected compressed point length".to_string(),
        ));
    }

    let mut public_prefixed = Vec::with_capacity(2 + compressed.len());
    public_prefixed.extend_from_slice(&P256_PUBLIC_MULTICODEC);
    public_prefixed.extend_from_slice(compressed);
    let public_did_key = format!("did:key:z{}", bs58::encode(&public_prefixed).into_string());

    let scalar_bytes = signing_key.to_bytes();
    let mut private_prefixed = Vec::with_capacity(2 + scalar_bytes.len());
    private_prefixed.extend_from_slice(&P256_PRIVATE_MULTICODEC);
    private_prefixed.extend_from_slice(&scalar_bytes);
    let private_multibase = format!("z{}", bs58::encode(&private_prefixed).into_string());

    // Verify the derived public key matches the encoded one (§4.4).
    let rederived = verify_public_from_private(&private_multibase)?;
    if rederived != public_did_key {
        return Err(MigrationError::Unknown(
            "rotation keypair self-check failed: public key mismatch".to_string(),
        ));
    }

    Ok(RotationKeypair {
        public_did_key,
        private_multibase: Zeroizing32(private_multibase.into_bytes()),
    })
}

/// Re-derives the did:key-encoded public key from a multibase-encoded
/// private scalar. Used both by [`generate`]'s self-check and by the §8
/// round-trip property test.
pub fn verify_public_from_private(private_multibase: &str) -> Result<String, MigrationError> {
    let body = private_multibase
        .strip_prefix('z')
        .ok_or_else(|| MigrationError::Unknown("missing multibase prefix".to_string()))?;
    let decoded = bs58::decode(body)
        .into_vec()
        .map_err(|e| MigrationError::Unknown(format!("base58 decode failed: {e}")))?;
    let (prefix, scalar_bytes) = decoded.split_at(2.min(decoded.len()));
    if prefix != P256_PRIVATE_MULTICODEC {
        return Err(MigrationError::Unknown(
            "unexpected private-key multicodec prefix".to_string(),
        ));
    }
    let signing_key = SigningKey::from_slice(scalar_bytes)
        .map_err(|e| MigrationError::Unknown(format!("invalid private scalar: {e}")))?;
    let verifying_key = VerifyingKey::from(&signing_key);
    let compressed = verifying_key.to_encoded_point(true);

    let mut public_prefixed = Vec::with_capacity(2 + compressed.as_bytes().len());
    public_prefixed.extend_from_slice(&P256_PUBLIC_MULTICODEC);
    public_prefixed.extend_from_slice(compressed.as_bytes());
    Ok(format!("did:key:z{}", bs58::encode(&public_prefixed).into_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keypair_has_did_key_prefix() {
        let kp = generate().unwrap();
        assert!(kp.public_did_key().starts_with("did:key:z"));
    }

    #[test]
    fn private_key_rederives_matching_public_key() {
        let kp = generate().unwrap();
        let rederived = verify_public_from_private(kp.private_multibase()).unwrap();
        assert_eq!(rederived, kp.public_did_key());
    }

    #[test]
    fn debug_impl_redacts_private_key() {
        let kp = generate().unwrap();
        let debug_str = format!("{kp:?}");
        assert!(!debug_str.contains(kp.private_multibase()));
    }
}
