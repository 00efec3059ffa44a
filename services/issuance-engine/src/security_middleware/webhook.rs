use crate::errors::{IssuanceError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Verifies PSP deposit callbacks signed with a shared secret.
///
/// The signature is the hex HMAC-SHA256 of the raw request body.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl WebhookVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| IssuanceError::Internal(format!("hmac key: {}", e)))
    }

    pub fn sign(&self, body: &[u8]) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of `signature` against the body digest
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<()> {
        let signature = match signature.map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => {
                warn!("Webhook rejected: missing signature");
                return Err(IssuanceError::Unauthorized);
            }
        };

        let supplied = hex::decode(signature).map_err(|_| {
            warn!("Webhook rejected: signature is not hex");
            IssuanceError::Unauthorized
        })?;

        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(&supplied).map_err(|_| {
            warn!("Webhook rejected: signature mismatch");
            IssuanceError::Unauthorized
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] =
        br#"{"depositId":"psp-1","userAccountId":"0.0.4821","amountFloat":12.34,"fiatCurrency":"NGN"}"#;

    #[test]
    fn test_known_digest() {
        let verifier = WebhookVerifier::new("key");
        assert_eq!(
            verifier
                .sign(b"The quick brown fox jumps over the lazy dog")
                .unwrap(),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_valid_signature_is_accepted() {
        let verifier = WebhookVerifier::new("whsec");
        let signature = verifier.sign(BODY).unwrap();

        assert!(verifier.verify(BODY, Some(&signature)).is_ok());
        assert!(verifier
            .verify(BODY, Some(&signature.to_uppercase()))
            .is_ok());
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let verifier = WebhookVerifier::new("whsec");
        let signature = verifier.sign(BODY).unwrap();
        let tampered = String::from_utf8_lossy(BODY).replace("12.34", "1234");

        assert!(matches!(
            verifier.verify(tampered.as_bytes(), Some(&signature)),
            Err(IssuanceError::Unauthorized)
        ));
    }

    #[test]
    fn test_missing_or_malformed_signature_is_rejected() {
        let verifier = WebhookVerifier::new("whsec");
        assert!(verifier.verify(BODY, None).is_err());
        assert!(verifier.verify(BODY, Some("")).is_err());
        assert!(verifier.verify(BODY, Some("not-hex")).is_err());
        assert!(verifier.verify(BODY, Some("abcd")).is_err());
    }

    #[test]
    fn test_other_secret_is_rejected() {
        let signer = WebhookVerifier::new("other");
        let verifier = WebhookVerifier::new("whsec");
        let signature = signer.sign(BODY).unwrap();
        assert!(verifier.verify(BODY, Some(&signature)).is_err());
    }
}
