use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute the HMAC-SHA256 signature of a webhook body, hex-encoded.
pub fn sign_body(secret: &str, body: &str) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(body.as_bytes());
    let result = mac.finalize();
    Ok(hex::encode(result.into_bytes()))
}

/// Verify an HMAC-SHA256 body signature using constant-time comparison.
pub fn verify_body_signature(
    secret: &str,
    body: &str,
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected = sign_body(secret, body)?;

    let expected_bytes = expected.as_bytes();
    let signature_bytes = signature.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let secret = "whsec_9f8e7d";
        let body = r#"{"connection_id":"abc","event":"new_transactions"}"#;

        let signature = sign_body(secret, body).unwrap();
        assert!(!signature.is_empty());
        assert!(verify_body_signature(secret, body, &signature).unwrap());
    }

    #[test]
    fn rejects_tampered_body() {
        let secret = "whsec_9f8e7d";
        let body = r#"{"connection_id":"abc","event":"new_transactions"}"#;
        let signature = sign_body(secret, body).unwrap();

        let tampered = r#"{"connection_id":"abc","event":"account_updated"}"#;
        assert!(!verify_body_signature(secret, tampered, &signature).unwrap());
    }

    #[test]
    fn rejects_wrong_length_signature() {
        let secret = "whsec_9f8e7d";
        let body = "{}";
        assert!(!verify_body_signature(secret, body, "deadbeef").unwrap());
    }
}
