//! Token guarding the cooperative shutdown endpoint

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Generate the shutdown token for one server run
///
/// # Arguments
/// * `port` - Port the run is bound to
/// * `started_at` - When the run started
/// * `secret` - Process-wide secret
///
/// # Returns
/// * 32-character hexadecimal token
pub fn generate_shutdown_token(port: u16, started_at: DateTime<Utc>, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(port.to_be_bytes());
    hasher.update(started_at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hasher.update(secret.as_bytes());
    let result = hasher.finalize();

    hex::encode(&result[..16])
}

/// Verify a shutdown token against the current run
pub fn verify_shutdown_token(
    token: &str,
    port: u16,
    started_at: DateTime<Utc>,
    secret: &str,
) -> bool {
    let expected = generate_shutdown_token(port, started_at, secret);
    token.len() == expected.len()
        && token
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
