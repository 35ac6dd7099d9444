use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Signature headers attached to an outgoing delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub signature: String,
    pub timestamp: String,
}

impl SignatureHeaders {
    pub fn into_pairs(self) -> [(&'static str, String); 2] {
        [(SIGNATURE_HEADER, self.signature), (TIMESTAMP_HEADER, self.timestamp)]
    }
}

/// Sign `body` with the subscription secret at `timestamp_secs`.
pub fn build_signature_headers(secret: &str, body: &[u8], timestamp_secs: i64) -> SignatureHeaders {
    let timestamp = timestamp_secs.to_string();
    let signature = compute_signature(secret.as_bytes(), body, Some(&timestamp));
    SignatureHeaders { signature, timestamp }
}

fn mac_over(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> Hmac<Sha256> {
    // HMAC accepts keys of any length.
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key of any length is valid"),
    };
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
    }
    mac.update(payload);
    mac
}

/// Hex HMAC-SHA256 over `timestamp || payload`.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    hex::encode(mac_over(secret, payload, timestamp).finalize().into_bytes())
}

/// Verify a received signature with optional timestamp.
pub fn verify_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    mac_over(secret, payload, timestamp).verify_slice(&signature).is_ok()
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    now_secs >= timestamp_secs && now_secs - timestamp_secs <= max_age_secs
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

/// Pick the signature and timestamp headers out of a header list.
pub fn parse_signature_headers<'a, I>(headers: I) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parsed = ParsedSignature::default();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            parsed.signature = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(TIMESTAMP_HEADER) {
            parsed.timestamp = Some(value.to_string());
        }
    }
    parsed
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("missing timestamp header")]
    MissingTimestamp,
    #[error("timestamp is not a number")]
    InvalidTimestamp,
    #[error("timestamp outside the accepted window")]
    StaleTimestamp,
    #[error("signature mismatch")]
    InvalidSignature,
}

/// Check an incoming delivery on the receiver side.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp_str = parsed.timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = timestamp_str
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, payload, Some(&timestamp_str), &signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
