//! Header-encoding variants for `mining.notify` and nonce composition.
//!
//! Two ASIC families speak slightly different dialects of the kaspa stratum
//! wire. The default "big header" form carries the pre-PoW hash as hex; the
//! Bitmain-compatible form carries it as four little-endian u64 words,
//! appends the header timestamp, and submits nonces in decimal.

use kaspa_math::Uint256;
use serde_json::{json, Value};

use crate::stratum::messages::ErrorCode;

/// Downstream header-encoding dialect, detected from the subscribe
/// user-agent string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerEncoding {
    /// Default dialect: pre-PoW hash as a 64-character hex string.
    BigHeader,
    /// Bitmain dialect: hash words plus timestamp, decimal nonces.
    Bitmain,
}

impl MinerEncoding {
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        if ua.contains("bitmain") || ua.contains("antminer") {
            MinerEncoding::Bitmain
        } else {
            MinerEncoding::BigHeader
        }
    }
}

/// `mining.notify` params for a job under the given encoding.
pub fn notify_params(
    encoding: MinerEncoding,
    job_id: &str,
    pre_pow_hash: Uint256,
    timestamp: u64,
) -> Value {
    match encoding {
        MinerEncoding::BigHeader => {
            json!([job_id, hex::encode(pre_pow_hash.to_be_bytes())])
        }
        MinerEncoding::Bitmain => {
            json!([job_id, hash_words_le(pre_pow_hash), timestamp])
        }
    }
}

/// Split a 256-bit hash into four little-endian u64 words.
fn hash_words_le(hash: Uint256) -> [u64; 4] {
    let bytes = hash.to_le_bytes();
    let mut words = [0u64; 4];
    for (i, chunk) in bytes.chunks_exact(8).enumerate() {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        words[i] = u64::from_le_bytes(word);
    }
    words
}

/// Compose the full 64-bit nonce from a submit parameter.
///
/// With an extranonce in play the submitted value is only the miner-chosen
/// suffix: the server prefix and the suffix are concatenated and the result
/// padded to 16 hex digits. Bitmain firmware sends the complete nonce as a
/// decimal string instead.
pub fn compose_nonce(
    encoding: MinerEncoding,
    extranonce: Option<&str>,
    submitted: &str,
) -> Result<u64, ErrorCode> {
    match encoding {
        MinerEncoding::Bitmain => submitted
            .trim()
            .parse::<u64>()
            .map_err(|_| ErrorCode::Unknown),
        MinerEncoding::BigHeader => {
            let suffix = submitted.trim_start_matches("0x");
            let full = match extranonce {
                Some(prefix) if !prefix.is_empty() => {
                    let width = 16usize.saturating_sub(prefix.len());
                    if suffix.len() > width {
                        return Err(ErrorCode::Unknown);
                    }
                    format!("{prefix}{suffix:0>width$}")
                }
                _ => suffix.to_string(),
            };
            u64::from_str_radix(&full, 16).map_err(|_| ErrorCode::Unknown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_bitmain_family() {
        assert_eq!(
            MinerEncoding::from_user_agent("Antminer KS5/gideon"),
            MinerEncoding::Bitmain
        );
        assert_eq!(
            MinerEncoding::from_user_agent("bitmain-ks3"),
            MinerEncoding::Bitmain
        );
        assert_eq!(
            MinerEncoding::from_user_agent("IceRiverMiner/1.2"),
            MinerEncoding::BigHeader
        );
        assert_eq!(
            MinerEncoding::from_user_agent("BzMiner/v21"),
            MinerEncoding::BigHeader
        );
    }

    #[test]
    fn big_header_params_carry_hex_hash() {
        let hash = Uint256::from_u64(0x2a);
        let params = notify_params(MinerEncoding::BigHeader, "5", hash, 1_700_000_000_000);
        let arr = params.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0], "5");
        let hex_hash = arr[1].as_str().unwrap();
        assert_eq!(hex_hash.len(), 64);
        assert!(hex_hash.ends_with("2a"));
    }

    #[test]
    fn bitmain_params_append_timestamp() {
        let hash = Uint256::from_u64(7);
        let params = notify_params(MinerEncoding::Bitmain, "5", hash, 1_700_000_000_000);
        let arr = params.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[2], 1_700_000_000_000u64);
        let words = arr[1].as_array().unwrap();
        assert_eq!(words.len(), 4);
        assert_eq!(words[0], 7);
    }

    #[test]
    fn composes_prefixed_nonce_padded_to_16_digits() {
        // 4-hex-digit prefix, short suffix padded to 12 digits
        let nonce = compose_nonce(MinerEncoding::BigHeader, Some("ab12"), "2a").unwrap();
        assert_eq!(nonce, 0xab12_0000_0000_002a);
    }

    #[test]
    fn composes_bare_nonce_without_extranonce() {
        let nonce = compose_nonce(MinerEncoding::BigHeader, None, "0xdeadbeef").unwrap();
        assert_eq!(nonce, 0xdead_beef);
    }

    #[test]
    fn bitmain_nonce_is_decimal() {
        let nonce = compose_nonce(MinerEncoding::Bitmain, Some("ab12"), "123456789").unwrap();
        assert_eq!(nonce, 123_456_789);
    }

    #[test]
    fn oversized_suffix_is_rejected() {
        let err = compose_nonce(MinerEncoding::BigHeader, Some("ab12"), "0123456789abcdef");
        assert_eq!(err, Err(ErrorCode::Unknown));
    }
}
