use tracing::debug;

// For signature verification
use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use sha2::Sha256;
type HmacSha256 = Hmac<Sha256>;

/// The only digest algorithm accepted in the signature header.
pub const SIGNATURE_ALGORITHM: &str = "sha256";

/// Helper function for verifying GitHub webhook signature
///
/// Expects `header_value` in the form `sha256=<hex digest>` and checks it
/// against the HMAC of the exact `payload` bytes. Every malformed input
/// (empty header, missing `=`, other algorithm, non-hex digest, wrong
/// length) yields `false`.
pub fn verify_github_signature(secret: &[u8], payload: &[u8], header_value: &str) -> bool {
    if header_value.is_empty() {
        return false;
    }

    let Some((algorithm, digest)) = header_value.split_once('=') else {
        debug!("Signature header has no '=' separator");
        return false;
    };
    if algorithm != SIGNATURE_ALGORITHM {
        debug!("Unsupported signature algorithm {:?}", algorithm);
        return false;
    }

    // GitHub provides the signature as hex
    let Ok(expected) = hex_decode(digest) else {
        debug!("Signature digest is not valid hex");
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    // Constant-time comparison, also rejects length mismatches
    mac.verify_slice(&expected).is_ok()
}

/// Derives a project name from a clone URL such as `git@host:org/app.git`
/// or `https://host/org/app.git`.
pub fn project_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "project".to_string()
    } else {
        name.to_string()
    }
}

/// Restricts a value to characters that are safe inside a single path
/// component. Anything else becomes `-`.
pub fn sanitize_path_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}
