/**
 * Token Codec
 *
 * Symmetric encode/decode of bearer tokens. A token is an opaque string:
 *
 * ```text
 * "LV " + base62(nonce || XChaCha20(plaintext)) + "." + base64url(HMAC-SHA256(ciphertext))
 * ```
 *
 * where the plaintext is `"{user_id}.{expiration_unix}.{secret}"` and
 * `secret` is the rotating nonce bound to a credential-store row. The
 * signature is detached and covers the ciphertext only, so tampering is
 * rejected before any decryption work.
 *
 * Access tokens live 12 hours; refresh tokens live 30 days and are
 * encrypted under a distinct key. Email-verification tokens use the
 * separate `"LV-E "` form.
 *
 * # Security
 *
 * - The signature check uses a constant-time comparison.
 * - Expiry is reported as a flag (`is_expired`) instead of an error so
 *   callers can distinguish "bad token" from "good but expired".
 */

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{Key, XChaCha20, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ApiError, ErrorCode};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of access/refresh tokens.
const TOKEN_PREFIX: &str = "LV ";
/// Prefix of email-verification tokens.
const EMAIL_TOKEN_PREFIX: &str = "LV-E ";

/// Access-token lifetime: 12 hours.
pub const ACCESS_TOKEN_TTL_SECS: i64 = 12 * 60 * 60;
/// Refresh-token lifetime: 30 days.
pub const REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

const NONCE_LEN: usize = 24;

/// Decoded contents of a well-formed, correctly signed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    pub user_id: i64,
    /// Expiration as a Unix timestamp (seconds)
    pub expiration: i64,
    /// Rotating secret bound to the credential-store row
    pub secret: String,
    /// True when `expiration` has passed; the token is otherwise valid
    pub is_expired: bool,
}

/// Encode a token for `user_id` carrying `secret`.
///
/// `is_long_term` selects the refresh lifetime (30 d) over the access
/// lifetime (12 h); callers pass the matching key for the token class.
pub fn encode_token(user_id: i64, secret: &str, is_long_term: bool, key: &str, signing_key: &str) -> String {
    let ttl = if is_long_term {
        REFRESH_TOKEN_TTL_SECS
    } else {
        ACCESS_TOKEN_TTL_SECS
    };
    let expiration = chrono::Utc::now().timestamp() + ttl;
    encode_token_raw(user_id, expiration, secret, key, signing_key)
}

/// Encode with an explicit expiration timestamp. Used by `encode_token`
/// and by tests that need control over expiry.
pub fn encode_token_raw(
    user_id: i64,
    expiration: i64,
    secret: &str,
    key: &str,
    signing_key: &str,
) -> String {
    let plaintext = format!("{user_id}.{expiration}.{secret}");

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher_key = derive_key(key);
    let mut cipher = XChaCha20::new(Key::from_slice(&cipher_key), XNonce::from_slice(&nonce));
    let mut body = plaintext.into_bytes();
    cipher.apply_keystream(&mut body);

    let mut ciphertext = Vec::with_capacity(NONCE_LEN + body.len());
    ciphertext.extend_from_slice(&nonce);
    ciphertext.extend_from_slice(&body);

    let signature = sign(&ciphertext, signing_key);

    format!(
        "{TOKEN_PREFIX}{}.{}",
        base62_encode(&ciphertext),
        URL_SAFE_NO_PAD.encode(signature)
    )
}

/// Decode and verify a token.
///
/// # Errors
///
/// - `INVALID_TOKEN_FORMAT` — missing prefix or unexpected dot layout
/// - `DECODE_ERROR` — ciphertext or signature not decodable, or the
///   decrypted plaintext does not split into its three fields
/// - `INVALID_SIGNATURE` — the detached HMAC does not match
pub fn decode_token(token: &str, key: &str, signing_key: &str) -> Result<DecodedToken, ApiError> {
    let rest = token
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidTokenFormat))?;

    let (ct_part, sig_part) = match rest.split_once('.') {
        Some(parts) if !parts.0.is_empty() && !parts.1.is_empty() && !parts.1.contains('.') => {
            parts
        }
        _ => return Err(ApiError::new(ErrorCode::InvalidTokenFormat)),
    };

    let ciphertext =
        base62_decode(ct_part).ok_or_else(|| ApiError::new(ErrorCode::DecodeError))?;
    let signature = URL_SAFE_NO_PAD
        .decode(sig_part)
        .map_err(|_| ApiError::new(ErrorCode::DecodeError))?;

    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|e| ApiError::internal(e))?;
    mac.update(&ciphertext);
    mac.verify_slice(&signature)
        .map_err(|_| ApiError::new(ErrorCode::InvalidSignature))?;

    if ciphertext.len() <= NONCE_LEN {
        return Err(ApiError::new(ErrorCode::DecodeError));
    }
    let (nonce, body) = ciphertext.split_at(NONCE_LEN);

    let cipher_key = derive_key(key);
    let mut cipher = XChaCha20::new(Key::from_slice(&cipher_key), XNonce::from_slice(nonce));
    let mut plaintext = body.to_vec();
    cipher.apply_keystream(&mut plaintext);

    let plaintext =
        String::from_utf8(plaintext).map_err(|_| ApiError::new(ErrorCode::DecodeError))?;
    let mut fields = plaintext.splitn(3, '.');
    let user_id: i64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| ApiError::new(ErrorCode::DecodeError))?;
    let expiration: i64 = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| ApiError::new(ErrorCode::DecodeError))?;
    let secret = fields
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::new(ErrorCode::DecodeError))?
        .to_string();

    Ok(DecodedToken {
        user_id,
        expiration,
        secret,
        is_expired: expiration <= chrono::Utc::now().timestamp(),
    })
}

/// Encode an email-verification token: `"LV-E " + base64url(email \0 exp) + "." + base64url(hmac)`.
pub fn encode_email_token(email: &str, expiration: i64, key: &str) -> String {
    let payload = format!("{email}\0{expiration}");
    let signature = sign(payload.as_bytes(), key);
    format!(
        "{EMAIL_TOKEN_PREFIX}{}.{}",
        URL_SAFE_NO_PAD.encode(payload.as_bytes()),
        URL_SAFE_NO_PAD.encode(signature)
    )
}

/// Decode an email-verification token, returning `(email, expiration)`.
pub fn decode_email_token(token: &str, key: &str) -> Result<(String, i64), ApiError> {
    let rest = token
        .strip_prefix(EMAIL_TOKEN_PREFIX)
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidTokenFormat))?;
    let (payload_part, sig_part) = rest
        .split_once('.')
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidTokenFormat))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_part)
        .map_err(|_| ApiError::new(ErrorCode::DecodeError))?;
    let signature = URL_SAFE_NO_PAD
        .decode(sig_part)
        .map_err(|_| ApiError::new(ErrorCode::DecodeError))?;

    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).map_err(|e| ApiError::internal(e))?;
    mac.update(&payload);
    mac.verify_slice(&signature)
        .map_err(|_| ApiError::new(ErrorCode::InvalidSignature))?;

    let payload =
        String::from_utf8(payload).map_err(|_| ApiError::new(ErrorCode::DecodeError))?;
    let (email, exp) = payload
        .split_once('\0')
        .ok_or_else(|| ApiError::new(ErrorCode::DecodeError))?;
    let expiration: i64 = exp
        .parse()
        .map_err(|_| ApiError::new(ErrorCode::DecodeError))?;
    Ok((email.to_string(), expiration))
}

/// Generate a fresh rotating secret (16 alphanumeric characters).
pub fn generate_secret() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Derive a 32-byte cipher key from arbitrary key material.
fn derive_key(key: &str) -> [u8; 32] {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn sign(data: &[u8], key: &str) -> Vec<u8> {
    // new_from_slice only fails for invalid lengths, which HMAC accepts all of.
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ---------------------------------------------------------------------------
// Base62 codec (wire format for the ciphertext half of a token)
// ---------------------------------------------------------------------------

const BASE62_ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Encode bytes as base62. Leading zero bytes are preserved as leading '0's.
fn base62_encode(data: &[u8]) -> String {
    let zeros = data.iter().take_while(|&&b| b == 0).count();
    let mut digits: Vec<u8> = Vec::new();
    let mut num: Vec<u8> = data[zeros..].to_vec();

    while !num.is_empty() {
        let mut remainder: u32 = 0;
        let mut next: Vec<u8> = Vec::with_capacity(num.len());
        for &byte in &num {
            let acc = (remainder << 8) | u32::from(byte);
            let q = (acc / 62) as u8;
            remainder = acc % 62;
            if !next.is_empty() || q != 0 {
                next.push(q);
            }
        }
        digits.push(BASE62_ALPHABET[remainder as usize]);
        num = next;
    }

    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat('0').take(zeros));
    out.extend(digits.iter().rev().map(|&d| d as char));
    out
}

/// Decode a base62 string back into bytes. Returns `None` on any character
/// outside the alphabet.
fn base62_decode(text: &str) -> Option<Vec<u8>> {
    let bytes = text.as_bytes();
    let zeros = bytes.iter().take_while(|&&c| c == b'0').count();

    let mut num: Vec<u8> = Vec::new();
    for &c in &bytes[zeros..] {
        let digit = BASE62_ALPHABET.iter().position(|&a| a == c)? as u32;
        // num = num * 62 + digit
        let mut carry = digit;
        for byte in num.iter_mut().rev() {
            let acc = u32::from(*byte) * 62 + carry;
            *byte = (acc & 0xFF) as u8;
            carry = acc >> 8;
        }
        while carry > 0 {
            num.insert(0, (carry & 0xFF) as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend_from_slice(&num);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEY: &str = "test-access-key";
    const SIGNING_KEY: &str = "test-signing-key";

    #[test]
    fn test_base62_roundtrip() {
        for data in [
            &b""[..],
            &b"\x00"[..],
            &b"\x00\x00hello"[..],
            &b"arbitrary bytes \xff\xfe\x01"[..],
        ] {
            let encoded = base62_encode(data);
            assert_eq!(base62_decode(&encoded).unwrap(), data.to_vec());
        }
    }

    #[test]
    fn test_base62_rejects_invalid_chars() {
        assert!(base62_decode("abc!def").is_none());
        assert!(base62_decode("with space").is_none());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let token = encode_token(42, "s3cr3tnonce", false, KEY, SIGNING_KEY);
        assert!(token.starts_with("LV "));

        let decoded = decode_token(&token, KEY, SIGNING_KEY).unwrap();
        assert_eq!(decoded.user_id, 42);
        assert_eq!(decoded.secret, "s3cr3tnonce");
        assert!(!decoded.is_expired);
        let remaining = decoded.expiration - chrono::Utc::now().timestamp();
        assert!(remaining > ACCESS_TOKEN_TTL_SECS - 60 && remaining <= ACCESS_TOKEN_TTL_SECS);
    }

    #[test]
    fn test_refresh_token_lifetime() {
        let token = encode_token(7, "nonce", true, KEY, SIGNING_KEY);
        let decoded = decode_token(&token, KEY, SIGNING_KEY).unwrap();
        let remaining = decoded.expiration - chrono::Utc::now().timestamp();
        assert!(remaining > REFRESH_TOKEN_TTL_SECS - 60);
    }

    #[test]
    fn test_expired_token_reports_flag_not_error() {
        let past = chrono::Utc::now().timestamp() - 10;
        let token = encode_token_raw(9, past, "nonce", KEY, SIGNING_KEY);
        let decoded = decode_token(&token, KEY, SIGNING_KEY).unwrap();
        assert!(decoded.is_expired);
        assert_eq!(decoded.user_id, 9);
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let token = encode_token(1, "n", false, KEY, SIGNING_KEY);
        let stripped = token.trim_start_matches("LV ");
        let err = decode_token(stripped, KEY, SIGNING_KEY).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTokenFormat);
    }

    #[test]
    fn test_tampered_ciphertext_fails_signature() {
        let token = encode_token(1, "nonce", false, KEY, SIGNING_KEY);
        let body = token.strip_prefix("LV ").unwrap();
        let (ct, sig) = body.split_once('.').unwrap();

        // Swap one ciphertext character for a different valid base62 char.
        let mut chars: Vec<char> = ct.chars().collect();
        let i = chars.len() / 2;
        chars[i] = if chars[i] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();

        let err = decode_token(&format!("LV {tampered}.{sig}"), KEY, SIGNING_KEY).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSignature);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let token = encode_token(1, "nonce", false, KEY, SIGNING_KEY);
        let err = decode_token(&format!("{token}x"), KEY, SIGNING_KEY).unwrap_err();
        assert!(matches!(
            err.code,
            ErrorCode::InvalidSignature | ErrorCode::DecodeError
        ));
    }

    #[test]
    fn test_wrong_cipher_key_fails_decode() {
        // Same signing key, wrong cipher key: the signature passes but the
        // plaintext is garbage and must not parse.
        let token = encode_token(1, "nonce", false, KEY, SIGNING_KEY);
        let err = decode_token(&token, "another-key", SIGNING_KEY).unwrap_err();
        assert_eq!(err.code, ErrorCode::DecodeError);
    }

    #[test]
    fn test_email_token_roundtrip() {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = encode_email_token("user@example.com", exp, KEY);
        assert!(token.starts_with("LV-E "));

        let (email, decoded_exp) = decode_email_token(&token, KEY).unwrap();
        assert_eq!(email, "user@example.com");
        assert_eq!(decoded_exp, exp);
    }

    #[test]
    fn test_email_token_tamper_rejected() {
        let token = encode_email_token("user@example.com", 12345, KEY);
        let err = decode_email_token(&token, "other-key").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSignature);
    }

    #[test]
    fn test_generated_secrets_are_distinct() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
