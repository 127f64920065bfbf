use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Canonical body bytes for a payload.
///
/// `serde_json` keeps object keys sorted, so equal payloads always
/// produce identical bytes. These exact bytes are both signed and sent.
pub fn canonical_payload(payload: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(payload)
}

/// Hex-encoded HMAC-SHA256 of `body` keyed with `secret`.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a received hex signature in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Find the signature header in a list of headers, ignoring case.
pub fn parse_signature_header<'a, I>(headers: I, signature_header: &str) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(signature_header))
        .map(|(_, value)| value.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
///
/// Intended for receivers: pass the raw request headers and the exact
/// body bytes as received.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    body: &[u8],
    secret: &[u8],
    signature_header: &str,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let signature = parse_signature_header(headers, signature_header)
        .ok_or(VerificationError::MissingSignature)?;

    if verify_signature(secret, body, &signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &[u8] = b"whsec_test";

    #[test]
    fn signature_matches_receiver_computation() {
        let body = canonical_payload(&json!({"process_id": "p-1", "score": 87})).unwrap();
        let signature = compute_signature(SECRET, &body).unwrap();

        assert_eq!(signature.len(), 64);
        assert!(verify_signature(SECRET, &body, &signature));
    }

    #[test]
    fn any_single_byte_mutation_invalidates() {
        let body = canonical_payload(&json!({"process_id": "p-1"})).unwrap();
        let signature = compute_signature(SECRET, &body).unwrap();

        for i in 0..body.len() {
            let mut tampered = body.clone();
            tampered[i] ^= 0x01;
            assert!(!verify_signature(SECRET, &tampered, &signature), "byte {i}");
        }
    }

    #[test]
    fn wrong_secret_does_not_verify() {
        let body = b"{}";
        let signature = compute_signature(SECRET, body).unwrap();
        assert!(!verify_signature(b"other", body, &signature));
        assert!(!verify_signature(SECRET, body, "not-hex"));
    }

    #[test]
    fn signing_accepts_keys_of_any_length() {
        let long_key = [0x5a_u8; 200];
        for key in [&b""[..], &b"k"[..], &long_key[..]] {
            let signature = compute_signature(key, b"{}").unwrap();
            assert!(verify_signature(key, b"{}", &signature));
        }
    }

    #[test]
    fn canonical_payload_is_key_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":{"d":2,"c":3}}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":{"c":3,"d":2},"b":1}"#).unwrap();
        assert_eq!(canonical_payload(&a).unwrap(), canonical_payload(&b).unwrap());
    }

    #[test]
    fn verify_request_looks_up_header_case_insensitively() {
        let body = br#"{"id":1}"#;
        let signature = compute_signature(SECRET, body).unwrap();
        let headers = [("x-webhook-signature", signature.as_str())];

        assert_eq!(
            verify_webhook_request(headers, body, SECRET, "X-Webhook-Signature"),
            Ok(())
        );
        assert_eq!(
            verify_webhook_request([("Content-Type", "application/json")], body, SECRET, "X-Webhook-Signature"),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_webhook_request(headers, br#"{"id":2}"#, SECRET, "X-Webhook-Signature"),
            Err(VerificationError::InvalidSignature)
        );
    }
}
