// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image and payload authentication.
//!
//! Images are signed with ECDSA over NIST P-256, the signature covering a
//! SHA-256 digest of the image (see [`crate::image::signed_digest`]). The
//! public key lives in a certificate element baked into the boot manager,
//! together with an 8-byte signer identifier that every signed image must
//! repeat.
//!
//! Coordinates and signature scalars are big-endian, as in SEC1.

use hex_literal::hex;
use p256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use p256::EncodedPoint;
use sha2::{Digest, Sha256};

pub const SIGNER_INFO_LEN: usize = 8;
pub const ECDSA_KEY_LEN: usize = 32;

/// Version of the only certificate element format we know.
pub const CERT_VERSION: u8 = 1;
pub const CERT_TYPE_ECC_P256: u8 = 1;

/// The only OTA payload signature version we know.
pub const PAYLOAD_SIG_VERSION: u8 = 1;

/// The on-device certificate: who is allowed to sign images, and their key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CertElement {
    pub version: u8,
    pub cert_type: u8,
    pub signer_info: [u8; SIGNER_INFO_LEN],
    pub pub_key_x: [u8; ECDSA_KEY_LEN],
    pub pub_key_y: [u8; ECDSA_KEY_LEN],
}

/// Development signing identity. Production devices are expected to replace
/// this with their own.
pub const DEFAULT_CERT: CertElement = CertElement {
    version: CERT_VERSION,
    cert_type: CERT_TYPE_ECC_P256,
    signer_info: hex!("b0177d511dec108b"),
    pub_key_x: hex!("d851bca2ed3d9e19b733a52f33da05404d1376503d88df5cd0e2f2583053c42a"),
    pub_key_y: hex!("b92abeef665feccf5616cc36ef2dc95e462b7c3b09c19956d9af958163237be7"),
};

impl CertElement {
    pub fn from_verifying_key(signer_info: [u8; SIGNER_INFO_LEN], key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let mut pub_key_x = [0; ECDSA_KEY_LEN];
        let mut pub_key_y = [0; ECDSA_KEY_LEN];
        // Uncompressed points always carry both coordinates.
        if let (Some(x), Some(y)) = (point.x(), point.y()) {
            pub_key_x.copy_from_slice(x);
            pub_key_y.copy_from_slice(y);
        }
        Self {
            version: CERT_VERSION,
            cert_type: CERT_TYPE_ECC_P256,
            signer_info,
            pub_key_x,
            pub_key_y,
        }
    }
}

/// Whoever checks signatures on behalf of the boot manager.
pub trait Authenticator {
    /// Identifier that signed images must carry.
    fn signer_info(&self) -> &[u8; SIGNER_INFO_LEN];

    /// Checks `signature` (r then s) over a precomputed SHA-256 `digest`.
    fn verify_digest(&self, digest: &[u8; 32], signature: &[u8; 64]) -> bool;

    /// Signer check followed by signature check, in that order, so that
    /// images from somebody else don't cost an ECDSA verification.
    fn verify_image(
        &self,
        signer_info: &[u8; SIGNER_INFO_LEN],
        digest: &[u8; 32],
        signature: &[u8; 64],
    ) -> bool {
        if signer_info != self.signer_info() {
            log::warn!("image signed by someone else");
            return false;
        }
        self.verify_digest(digest, signature)
    }
}

/// P-256 ECDSA in software.
pub struct P256Authenticator {
    cert: CertElement,
}

impl P256Authenticator {
    pub const fn new(cert: CertElement) -> Self {
        Self { cert }
    }

    fn verifying_key(&self) -> Option<VerifyingKey> {
        if self.cert.version != CERT_VERSION || self.cert.cert_type != CERT_TYPE_ECC_P256 {
            return None;
        }
        let point = EncodedPoint::from_affine_coordinates(
            (&self.cert.pub_key_x).into(),
            (&self.cert.pub_key_y).into(),
            false,
        );
        VerifyingKey::from_encoded_point(&point).ok()
    }
}

impl Authenticator for P256Authenticator {
    fn signer_info(&self) -> &[u8; SIGNER_INFO_LEN] {
        &self.cert.signer_info
    }

    fn verify_digest(&self, digest: &[u8; 32], signature: &[u8; 64]) -> bool {
        let Some(key) = self.verifying_key() else {
            log::error!("certificate element doesn't hold a usable key");
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_prehash(digest, &signature).is_ok()
    }
}

/// Signature block attached to an OTA command payload.
#[derive(Copy, Clone, Debug)]
pub struct SignPayload {
    pub signer_info: [u8; SIGNER_INFO_LEN],
    pub signature: [u8; 64],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuthError {
    UnsupportedVersion,
    BadSignature,
}

/// Authenticates an OTA command payload on behalf of the application.
///
/// `counter` is the sender's replay counter. It is part of the calling
/// convention but the check against previously seen values belongs to the
/// caller, so it isn't consulted here.
pub fn payload_verify(
    auth: &impl Authenticator,
    version: u8,
    _counter: u32,
    payload: &[u8],
    sign: &SignPayload,
) -> Result<(), AuthError> {
    if version != PAYLOAD_SIG_VERSION {
        return Err(AuthError::UnsupportedVersion);
    }
    let digest: [u8; 32] = Sha256::digest(payload).into();
    if auth.verify_image(&sign.signer_info, &digest, &sign.signature) {
        Ok(())
    } else {
        Err(AuthError::BadSignature)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use p256::ecdsa::{signature::hazmat::PrehashSigner, SigningKey};

    pub const SIGNER_INFO: [u8; 8] = hex!("0102030405060708");

    pub fn signing_key() -> SigningKey {
        SigningKey::from_bytes(
            &hex!("c9afa9d845ba75166b5c215767b1d6934e50c3db36e89b127b8a622b120f6721").into(),
        )
        .unwrap()
    }

    pub fn authenticator() -> P256Authenticator {
        P256Authenticator::new(CertElement::from_verifying_key(
            SIGNER_INFO,
            signing_key().verifying_key(),
        ))
    }

    fn sign(payload: &[u8]) -> SignPayload {
        let digest = Sha256::digest(payload);
        let sig: Signature = signing_key().sign_prehash(&digest).unwrap();
        let mut signature = [0; 64];
        signature.copy_from_slice(&sig.to_bytes());
        SignPayload {
            signer_info: SIGNER_INFO,
            signature,
        }
    }

    #[test]
    fn default_cert_is_a_curve_point() {
        assert!(P256Authenticator::new(DEFAULT_CERT).verifying_key().is_some());
    }

    #[test]
    fn payload_round_trip() {
        let auth = authenticator();
        let payload = b"OAD_CMD_START 0x0003";
        assert_eq!(payload_verify(&auth, 1, 7, payload, &sign(payload)), Ok(()));
    }

    #[test]
    fn payload_tampering() {
        let auth = authenticator();
        let sig = sign(b"erase slot two");
        assert_eq!(
            payload_verify(&auth, 1, 0, b"erase slot one", &sig),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn payload_version() {
        let auth = authenticator();
        let payload = b"hello";
        assert_eq!(
            payload_verify(&auth, 2, 0, payload, &sign(payload)),
            Err(AuthError::UnsupportedVersion)
        );
    }

    #[test]
    fn wrong_signer_is_refused_before_ecdsa() {
        let auth = authenticator();
        let payload = b"hello";
        let mut sig = sign(payload);
        sig.signer_info[0] ^= 0xFF;
        assert_eq!(
            payload_verify(&auth, 1, 0, payload, &sig),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn garbage_signature() {
        let auth = authenticator();
        assert!(!auth.verify_digest(&[0x55; 32], &[0; 64]));
        assert!(!auth.verify_digest(&[0x55; 32], &[0xFF; 64]));
    }

    #[test]
    fn wrong_key() {
        let other = P256Authenticator::new(CertElement {
            signer_info: SIGNER_INFO,
            ..DEFAULT_CERT
        });
        let payload = b"hello";
        assert_eq!(
            payload_verify(&other, 1, 0, payload, &sign(payload)),
            Err(AuthError::BadSignature)
        );
    }
}
