//! Cryptographic collaborators used by the parser and the application verifier.

use crc::{Crc, CRC_32_ISO_HDLC};

/// CRC used by GBL end tags and CRC32-signed applications.
pub(crate) static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Residue left by running [`CRC32`] over data followed by its own checksum.
pub(crate) const CRC32_RESIDUE: u32 = 0x2144_DF1C;

/// Verifies an ECDSA P-256 signature over a SHA-256 digest.
pub trait SignatureVerifier {
    /// `public_key` is the uncompressed point `X || Y`, `signature` is `r || s`.
    fn verify(&self, public_key: &[u8; 64], digest: &[u8; 32], signature: &[u8; 64]) -> bool;
}

/// Software verifier backed by the `p256` crate.
#[cfg(feature = "p256")]
#[derive(Clone, Copy, Debug, Default)]
pub struct P256Verifier;

#[cfg(feature = "p256")]
impl SignatureVerifier for P256Verifier {
    fn verify(&self, public_key: &[u8; 64], digest: &[u8; 32], signature: &[u8; 64]) -> bool {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;
        use p256::ecdsa::{Signature, VerifyingKey};

        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(public_key);
        let Ok(key) = VerifyingKey::from_sec1_bytes(&sec1) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_prehash(digest, &signature).is_ok()
    }
}

/// Stream decryption for encrypted GBL containers.
pub trait ImageDecryptor {
    /// Starts a new stream from the nonce in the encryption init tag.
    fn start(&mut self, nonce: &[u8; 12]);
    /// Decrypts `data` in place, continuing the keystream.
    fn apply(&mut self, data: &mut [u8]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn crc_residue() {
        let data = b"123456789";
        let crc = CRC32.checksum(data);
        assert_eq!(crc, 0xCBF4_3926);

        let mut digest = CRC32.digest();
        digest.update(data);
        digest.update(&crc.to_le_bytes());
        assert_eq!(digest.finalize(), CRC32_RESIDUE);
    }

    #[cfg(feature = "p256")]
    #[test]
    fn p256_accepts_valid_and_rejects_tampered() {
        let digest = [0x5Au8; 32];
        let mut signature = testutil::sign(&digest);
        let key = testutil::public_key();

        assert!(P256Verifier.verify(&key, &digest, &signature));

        signature[10] ^= 0x04;
        assert!(!P256Verifier.verify(&key, &digest, &signature));
        assert!(!P256Verifier.verify(&[0u8; 64], &digest, &testutil::sign(&digest)));
    }
}
