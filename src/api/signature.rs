use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-loanflow-signature-256";

/// Verify the HMAC-SHA256 signature of a control request.
///
/// Callers send the signature in the `X-Loanflow-Signature-256` header as `sha256=<hex>`.
pub fn verify_signature(secret: &str, payload: &[u8], signature_header: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(AppError::RequestVerification(
            "No API secret configured".to_string(),
        ));
    }

    let signature_hex = signature_header
        .strip_prefix("sha256=")
        .ok_or_else(|| AppError::RequestVerification("Missing sha256= prefix".to_string()))?;

    let signature_bytes = hex::decode(signature_hex)
        .map_err(|e| AppError::RequestVerification(format!("Invalid hex in signature: {e}")))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::RequestVerification(format!("Invalid HMAC key: {e}")))?;

    mac.update(payload);

    mac.verify_slice(&signature_bytes)
        .map_err(|_| AppError::RequestVerification("Signature mismatch".to_string()))
}

/// Header value for `payload`, as a client would compute it.
pub fn sign(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::RequestVerification(format!("Invalid HMAC key: {e}")))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_signature() {
        let secret = "test-secret";
        let payload = br#"{"entity_id":"app-1"}"#;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let expected_hex = hex::encode(mac.finalize().into_bytes());

        let header = format!("sha256={expected_hex}");
        assert!(verify_signature(secret, payload, &header).is_ok());
        assert_eq!(sign(secret, payload).unwrap(), header);
    }

    #[test]
    fn test_invalid_signature() {
        let header = "sha256=0000000000000000000000000000000000000000000000000000000000000000";
        assert!(verify_signature("test-secret", b"{}", header).is_err());
    }

    #[test]
    fn test_missing_prefix() {
        assert!(verify_signature("test-secret", b"{}", "abcdef1234567890").is_err());
    }

    #[test]
    fn test_empty_secret_rejects_everything() {
        let header = sign("", b"{}").unwrap();
        assert!(verify_signature("", b"{}", &header).is_err());
    }
}
