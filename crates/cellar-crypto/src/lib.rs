//! # cellar-crypto
//!
//! Credential hashing and URL signing for cellar.
//!
//! Everything here is deterministic material derived with SHA-256 / HMAC-SHA256:
//! API-key hashes, workspace password hashes, pre-signed URL signatures, and
//! idempotency request fingerprints. Plaintext secrets never leave the caller;
//! this crate only ever stores or compares digests.

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

use cellar_core::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Hex SHA-256 of a plaintext credential. The only form keys are stored in.
pub fn key_hash(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time equality of two secrets, compared through their digests.
///
/// Hashing first makes the comparison length-independent; the final digest
/// comparison walks all 32 bytes unconditionally.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    let mut diff = 0u8;
    for (x, y) in da.iter().zip(db.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a project API key with the human-readable prefix.
///
/// Returns `(plaintext, hash)`. The plaintext is shown exactly once.
pub fn generate_project_key(project_id: &str) -> (String, String) {
    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();
    let plaintext = format!("proj_{project_id}_admin_{secret}");
    let hash = key_hash(&plaintext);
    (plaintext, hash)
}

/// Generate workspace credentials: `(username, password, password_hash)`.
///
/// The password is shown once at creation; only the hash is stored.
pub fn generate_workspace_credentials(workspace_id: &str) -> (String, String, String) {
    let mut rng = rand::thread_rng();
    let user_suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let password: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    let username = format!("ws_{workspace_id}_{user_suffix}");
    let hash = key_hash(&password);
    (username, password, hash)
}

/// Verify a presented password against a stored hash, constant time.
pub fn verify_password(presented: &str, stored_hash: &str) -> bool {
    constant_time_eq(&key_hash(presented), stored_hash)
}

// =============================================================================
// PRE-SIGNED URLS
// =============================================================================

/// HMAC-SHA256 signature over `(method, bucket, key, expires)`, keyed by the
/// owning project's API key. Hex-encoded.
pub fn presign_signature(
    api_key: &str,
    method: &str,
    bucket: &str,
    object_key: &str,
    expires: i64,
) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .map_err(|e| Error::Internal(format!("hmac key: {e}")))?;
    mac.update(method.to_ascii_uppercase().as_bytes());
    mac.update(b"\n");
    mac.update(bucket.as_bytes());
    mac.update(b"\n");
    mac.update(object_key.as_bytes());
    mac.update(b"\n");
    mac.update(expires.to_string().as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Validate a pre-signed URL signature in constant time.
pub fn presign_verify(
    api_key: &str,
    method: &str,
    bucket: &str,
    object_key: &str,
    expires: i64,
    presented: &str,
) -> Result<bool> {
    let expected = presign_signature(api_key, method, bucket, object_key, expires)?;
    Ok(constant_time_eq(&expected, presented))
}

// =============================================================================
// IDEMPOTENCY FINGERPRINTS
// =============================================================================

/// Stable fingerprint over method, normalized path, authenticated project id,
/// and the canonicalised body.
///
/// Bodies are canonicalised by round-tripping through `serde_json::Value`:
/// object keys serialize in sorted order, so two requests that differ only in
/// key ordering or whitespace fingerprint identically.
pub fn request_fingerprint(
    method: &str,
    path: &str,
    project_id: Option<&str>,
    body: &[u8],
) -> String {
    let canonical_body = match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => serde_json::to_string(&value).unwrap_or_default(),
        // Non-JSON bodies fingerprint over raw bytes.
        Err(_) => hex::encode(Sha256::digest(body)),
    };

    let normalized_path = path.trim_end_matches('/');
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(normalized_path.as_bytes());
    hasher.update(b"\n");
    hasher.update(project_id.unwrap_or("").as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_body.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_is_hex_sha256() {
        let h = key_hash("secret");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        // Golden vector so external callers can validate independently.
        assert_eq!(
            key_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("same", "same"));
        assert!(!constant_time_eq("same", "other"));
        assert!(!constant_time_eq("same", "same-but-longer"));
    }

    #[test]
    fn test_generate_project_key_prefix_and_hash() {
        let (plaintext, hash) = generate_project_key("p1");
        assert!(plaintext.starts_with("proj_p1_admin_"));
        assert_eq!(key_hash(&plaintext), hash);
    }

    #[test]
    fn test_workspace_credentials_verify() {
        let (username, password, hash) = generate_workspace_credentials("w1");
        assert!(username.starts_with("ws_w1_"));
        assert!(verify_password(&password, &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn test_presign_roundtrip() {
        let sig = presign_signature("key", "GET", "project_p1", "data/a.csv", 1700000000).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(presign_verify("key", "get", "project_p1", "data/a.csv", 1700000000, &sig).unwrap());
        assert!(!presign_verify("key", "PUT", "project_p1", "data/a.csv", 1700000000, &sig).unwrap());
        assert!(!presign_verify("other", "GET", "project_p1", "data/a.csv", 1700000000, &sig).unwrap());
    }

    #[test]
    fn test_fingerprint_canonicalises_json_bodies() {
        let a = request_fingerprint("POST", "/p/x", Some("p1"), br#"{"b":1,"a":2}"#);
        let b = request_fingerprint("POST", "/p/x/", Some("p1"), br#"{ "a": 2, "b": 1 }"#);
        assert_eq!(a, b);

        let c = request_fingerprint("POST", "/p/x", Some("p1"), br#"{"a":2,"b":9}"#);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_scopes_by_project() {
        let a = request_fingerprint("POST", "/p/x", Some("p1"), b"{}");
        let b = request_fingerprint("POST", "/p/x", Some("p2"), b"{}");
        assert_ne!(a, b);
    }
}
