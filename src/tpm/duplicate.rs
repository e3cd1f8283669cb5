//! Protection of sensitive areas, both under a storage parent and in transit
//! to a parent whose public key is all we have.
//!
//! A protected blob is an HMAC over the ciphertext and the object's name,
//! followed by the ciphertext. The name binding stops a private area from
//! being loaded with a different public area.

use super::types::{Digest, EncryptedSecret, HashAlg, Name, Private, Public};
use super::{ResponseCode, Result, TpmError};
use crate::mu::{self, ErrorKind, Marshal, Reader, Unmarshal, Writer};
use hmac::digest::generic_array::GenericArray;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use p256::ecdh::{diffie_hellman, EphemeralSecret};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

const TAG_SIZE: usize = 32;
const SENSITIVE_KEYEDHASH: u16 = 0x0008;

/// The sensitive area of a sealed data object.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Sensitive {
    pub auth_value: Vec<u8>,
    pub seed_value: Vec<u8>,
    pub data: Vec<u8>,
}

impl Sensitive {
    /// A sealed data object holding `data`, with a fresh obfuscation value.
    pub fn sealed(name_alg: HashAlg, auth_value: &[u8], data: &[u8]) -> Self {
        let mut seed_value = vec![0u8; name_alg.size()];
        OsRng.fill_bytes(&mut seed_value);
        Self {
            auth_value: auth_value.to_vec(),
            seed_value,
            data: data.to_vec(),
        }
    }

    /// The `unique` field of the matching public area.
    pub fn unique(&self, name_alg: HashAlg) -> Digest {
        name_alg.hash(&[&self.seed_value, &self.data])
    }

    pub fn to_bytes(&self) -> mu::Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(mu::marshal_to_vec(self)?))
    }
}

impl Marshal for Sensitive {
    fn marshal(&self, w: &mut Writer) {
        w.write_u16(SENSITIVE_KEYEDHASH);
        w.write_sized("Auth", &self.auth_value);
        w.write_sized("Digest", &self.seed_value);
        w.write_sized("SensitiveData", &self.data);
    }
}

impl Unmarshal for Sensitive {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        const T: &str = "Sensitive";
        if r.read_field::<u16>(T, "sensitive_type")? != SENSITIVE_KEYEDHASH {
            return Err(mu::Error::new(T, ErrorKind::InvalidValue("unsupported sensitive type")));
        }
        Ok(Self {
            auth_value: r.field(T, "auth_value", |r| Ok(r.read_sized("Auth")?.to_vec()))?,
            seed_value: r.field(T, "seed_value", |r| Ok(r.read_sized("Digest")?.to_vec()))?,
            data: r.field(T, "sensitive", |r| Ok(r.read_sized("SensitiveData")?.to_vec()))?,
        })
    }
}

/// Symmetric and integrity keys derived from a protection seed.
pub struct ProtectionKeys {
    sym: Zeroizing<Vec<u8>>,
    hmac: Zeroizing<Vec<u8>>,
}

impl ProtectionKeys {
    pub fn derive(seed: &[u8]) -> Self {
        Self {
            sym: Zeroizing::new(HashAlg::Sha256.hash(&[b"STORAGE\0", seed]).into_inner()),
            hmac: Zeroizing::new(HashAlg::Sha256.hash(&[b"INTEGRITY\0", seed]).into_inner()),
        }
    }

    fn keystream_xor(&self, name: &Name, data: &mut [u8]) {
        for (counter, chunk) in data.chunks_mut(32).enumerate() {
            let block = HashAlg::Sha256.hash(&[&self.sym, name, &(counter as u32).to_be_bytes()]);
            for (b, k) in chunk.iter_mut().zip(block.iter()) {
                *b ^= k;
            }
        }
    }

    fn mac(&self, name: &Name, ciphertext: &[u8]) -> HmacSha256 {
        // zero padding to the block size leaves the HMAC key unchanged
        let mut key = Zeroizing::new([0u8; 64]);
        key[..self.hmac.len()].copy_from_slice(&self.hmac);
        let mut mac = <HmacSha256 as KeyInit>::new(GenericArray::from_slice(&key[..]));
        mac.update(ciphertext);
        mac.update(name);
        mac
    }

    pub fn protect(&self, name: &Name, plaintext: &[u8]) -> Private {
        let mut ciphertext = plaintext.to_vec();
        self.keystream_xor(name, &mut ciphertext);
        let tag = self.mac(name, &ciphertext).finalize().into_bytes();
        let mut out = tag.to_vec();
        out.extend_from_slice(&ciphertext);
        Private::new(out)
    }

    /// Returns `None` if the blob wasn't protected with these keys for `name`.
    pub fn unprotect(&self, name: &Name, private: &Private) -> Option<Zeroizing<Vec<u8>>> {
        if private.len() < TAG_SIZE {
            return None;
        }
        let (tag, ciphertext) = private.split_at(TAG_SIZE);
        self.mac(name, ciphertext).verify_slice(tag).ok()?;
        let mut plaintext = Zeroizing::new(ciphertext.to_vec());
        self.keystream_xor(name, &mut plaintext);
        Some(plaintext)
    }
}

fn seed_from_shared_secret(shared: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(HashAlg::Sha256.hash(&[b"DUPLICATE\0", shared]).into_inner())
}

fn marshal_point(key: &PublicKey) -> mu::Result<EncryptedSecret> {
    let point = key.to_encoded_point(false);
    let mut w = Writer::new();
    w.write_sized("EccParameter", point.x().map(|x| x.as_slice()).unwrap_or_default());
    w.write_sized("EccParameter", point.y().map(|y| y.as_slice()).unwrap_or_default());
    Ok(EncryptedSecret::new(w.into_bytes()?))
}

fn unmarshal_point(seed: &EncryptedSecret) -> Option<PublicKey> {
    let mut r = Reader::new(seed);
    let x = r.read_sized("EccParameter").ok()?;
    let y = r.read_sized("EccParameter").ok()?;
    if x.len() != 32 || y.len() != 32 || !r.is_empty() {
        return None;
    }
    let point = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(x),
        FieldBytes::from_slice(y),
        false,
    );
    PublicKey::from_sec1_bytes(point.as_bytes()).ok()
}

/// Wraps `sensitive` so that only the holder of `new_parent`'s private key
/// can import it. Returns the duplicate and the encrypted seed.
pub fn create_duplication_object(
    new_parent: &Public,
    public: &Public,
    sensitive: &Sensitive,
) -> Result<(Private, EncryptedSecret)> {
    let parent_key = new_parent
        .ecc_public_key()
        .filter(|_| new_parent.is_storage_parent())
        .ok_or_else(|| TpmError::response("Import", ResponseCode::Attributes))?;
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let shared = ephemeral.diffie_hellman(&parent_key);
    let seed = seed_from_shared_secret(shared.raw_secret_bytes());
    let name = public.name()?;
    let duplicate = ProtectionKeys::derive(&seed).protect(&name, &sensitive.to_bytes()?);
    Ok((duplicate, marshal_point(&ephemeral.public_key())?))
}

/// Recovers the sensitive area of a duplicate, given the new parent's key.
pub fn unwrap_duplication_object(
    parent: &SecretKey,
    public: &Public,
    duplicate: &Private,
    seed: &EncryptedSecret,
) -> Result<Sensitive> {
    let ephemeral = unmarshal_point(seed)
        .ok_or_else(|| TpmError::response("Import", ResponseCode::Value))?;
    let shared = diffie_hellman(parent.to_nonzero_scalar(), ephemeral.as_affine());
    let seed = seed_from_shared_secret(shared.raw_secret_bytes());
    let plaintext = ProtectionKeys::derive(&seed)
        .unprotect(&public.name()?, duplicate)
        .ok_or_else(|| TpmError::response("Import", ResponseCode::Integrity))?;
    Ok(mu::unmarshal_from_bytes("Sensitive", &plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::srk_template;
    use eyre::Result;

    #[test]
    fn protect_binds_name() -> Result<()> {
        let keys = ProtectionKeys::derive(b"seed");
        let a = Name::new(vec![0, 0x0b, 1]);
        let b = Name::new(vec![0, 0x0b, 2]);
        let private = keys.protect(&a, b"some secret data that spans more than one block");
        assert_eq!(
            keys.unprotect(&a, &private).as_deref().map(|v| v.as_slice()),
            Some(&b"some secret data that spans more than one block"[..])
        );
        assert!(keys.unprotect(&b, &private).is_none());
        assert!(ProtectionKeys::derive(b"other").unprotect(&a, &private).is_none());
        Ok(())
    }

    #[test]
    fn duplicate_round_trip() -> Result<()> {
        let parent_secret = SecretKey::random(&mut OsRng);
        let parent = srk_template().with_ecc_point(&parent_secret.public_key());
        let sensitive = Sensitive::sealed(HashAlg::Sha256, b"1234", b"the key");
        let public = Public::sealed_object(HashAlg::Sha256, Digest::default(), true);
        let (duplicate, seed) = create_duplication_object(&parent, &public, &sensitive)?;
        let recovered = unwrap_duplication_object(&parent_secret, &public, &duplicate, &seed)?;
        assert!(recovered == sensitive);

        let other = SecretKey::random(&mut OsRng);
        assert!(unwrap_duplication_object(&other, &public, &duplicate, &seed).is_err());
        Ok(())
    }
}
