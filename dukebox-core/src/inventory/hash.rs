//! Streaming digests selected by the algorithm name a descriptor
//! declares.

use digest::DynDigest;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

/// Buffer size for all streaming hash/copy loops. Memory use stays
/// O(buffer) no matter how large the archive is.
pub(crate) const STREAM_BUF_SIZE: usize = 64 * 1024;

/// Returns a fresh streaming digest for `algorithm` (the uppercase
/// name recorded in a descriptor's archive hash, e.g. `SHA-256`).
pub(crate) fn digest_for(algorithm: &str) -> Result<Box<dyn DynDigest + Send>> {
    match algorithm {
        "SHA-256" | "SHA256" => Ok(Box::new(Sha256::new())),
        "SHA-384" | "SHA384" => Ok(Box::new(Sha384::new())),
        "SHA-512" | "SHA512" => Ok(Box::new(Sha512::new())),
        "SHA-1" | "SHA1" => Ok(Box::new(Sha1::new())),
        "MD5" => Ok(Box::new(Md5::new())),
        other => Err(Error::UnsupportedAlgorithm {
            algorithm: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_algorithms_resolve() {
        for name in ["SHA-256", "SHA-512", "SHA-384", "SHA-1", "MD5"] {
            assert!(digest_for(name).is_ok(), "no digest for {name}");
        }
    }

    #[test]
    fn unknown_algorithm_is_an_error() {
        assert!(matches!(
            digest_for("WHIRLPOOL"),
            Err(Error::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn sha256_matches_known_vector() {
        let mut digest = digest_for("SHA-256").unwrap();
        digest.update(b"abc");
        let out = hex::encode(digest.finalize());
        assert_eq!(
            out,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
