use anyhow::{bail, Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

const TOKEN_LIFETIME_SECS: i64 = 24 * 3600;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub(crate) wallet: String,
    pub(crate) nbf: i64,
    pub(crate) exp: i64,
}

pub(crate) fn generate_token(secret: &str, wallet: &str) -> Result<String> {
    if wallet.is_empty() {
        bail!("cannot issue a token without a wallet");
    }
    let now = Utc::now().timestamp();
    let claims = Claims {
        wallet: wallet.to_string(),
        nbf: now,
        exp: now + TOKEN_LIFETIME_SECS,
    };
    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

pub(crate) fn validate_token(secret: &str, token: &str) -> Result<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_nbf = true;
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .context("invalid JWT token")?;
    Ok(decoded.claims.wallet)
}

/// SIWE nonce for the HTTP handshake endpoint.
pub(crate) fn make_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Verifies an EIP-191 personal-sign signature over a SIWE message and
/// returns the checksummed signer address. The recovered key must match the
/// address embedded in the message's account line.
pub(crate) fn verify_eip191(message: &str, signature: &str) -> Result<String> {
    let raw = hex::decode(signature.strip_prefix("0x").unwrap_or(signature))
        .context("signature is not hex")?;
    if raw.len() != 65 {
        bail!("signature must be 65 bytes");
    }

    let recid_byte = match raw[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - 27,
        v => bail!("unsupported recovery byte {v}"),
    };
    let recovery_id = RecoveryId::from_byte(recid_byte).context("invalid recovery id")?;
    let sig = EcdsaSignature::from_slice(&raw[..64]).context("malformed signature")?;

    let digest = personal_message_hash(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id)
        .context("signature recovery failed")?;
    let recovered = address_of_key(&key);

    let claimed = siwe_address(message).context("message carries no account address")?;
    if !claimed.eq_ignore_ascii_case(&recovered) {
        bail!("recovered address does not match the message account");
    }

    Ok(recovered)
}

/// keccak256("\x19Ethereum Signed Message:\n" + len + message).
pub(crate) fn personal_message_hash(message: &str) -> [u8; 32] {
    let mut data = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    data.extend_from_slice(message.as_bytes());
    keccak256(&data)
}

/// The account line of a SIWE message is the second line.
pub(crate) fn siwe_address(message: &str) -> Option<String> {
    let line = message.lines().nth(1)?.trim();
    let hex_part = line.strip_prefix("0x")?;
    if hex_part.len() == 40 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(line.to_string())
    } else {
        None
    }
}

pub(crate) fn address_of_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..]);
    eip55_checksum(&addr)
}

pub(crate) fn eip55_checksum(addr: &[u8; 20]) -> String {
    let lower = hex::encode(addr);
    let digest = keccak256(lower.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            digest[i / 2] >> 4
        } else {
            digest[i / 2] & 0xf
        };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}
