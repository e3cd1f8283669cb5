use crate::mu::{self, ErrorKind, Marshal, Reader, Unmarshal, Writer};
use p256::ecdsa::VerifyingKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{EncodedPoint, FieldBytes, PublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use std::fmt;
use std::ops::Deref;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub const NULL_ID: u16 = 0x0010;

    pub const fn id(self) -> u16 {
        match self {
            HashAlg::Sha256 => 0x000b,
            HashAlg::Sha384 => 0x000c,
            HashAlg::Sha512 => 0x000d,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x000b => Some(HashAlg::Sha256),
            0x000c => Some(HashAlg::Sha384),
            0x000d => Some(HashAlg::Sha512),
            _ => None,
        }
    }

    pub const fn size(self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashAlg::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlg::Sha384 => Hasher::Sha384(Sha384::new()),
            HashAlg::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    /// Digest of the concatenation of `parts`.
    pub fn hash(self, parts: &[&[u8]]) -> Digest {
        let mut h = self.hasher();
        for p in parts {
            h.update(p);
        }
        h.finalize()
    }

    pub fn zero_digest(self) -> Digest {
        Digest(vec![0; self.size()])
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(HashAlg::Sha256),
            "sha384" => Some(HashAlg::Sha384),
            "sha512" => Some(HashAlg::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashAlg::Sha256 => "sha256",
            HashAlg::Sha384 => "sha384",
            HashAlg::Sha512 => "sha512",
        })
    }
}

impl Marshal for HashAlg {
    fn marshal(&self, w: &mut Writer) {
        w.write_u16(self.id())
    }
}

impl Unmarshal for HashAlg {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        let id = r.read_u16()?;
        HashAlg::from_id(id)
            .ok_or_else(|| mu::Error::new("HashAlg", ErrorKind::InvalidValue("unsupported digest algorithm")))
    }
}

pub enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
        self
    }

    pub fn finalize(self) -> Digest {
        Digest(match self {
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        })
    }
}

/// Byte buffers that travel on the wire with a `u16` size prefix.
macro_rules! sized_buffer {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(#[serde(with = "hex")] Vec<u8>);

        impl $name {
            pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
                Self(bytes.into())
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn into_inner(self) -> Vec<u8> {
                self.0
            }
        }

        impl Deref for $name {
            type Target = [u8];
            fn deref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(v: Vec<u8>) -> Self {
                Self(v)
            }
        }

        impl From<&[u8]> for $name {
            fn from(v: &[u8]) -> Self {
                Self(v.to_vec())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0))
            }
        }

        impl Marshal for $name {
            fn marshal(&self, w: &mut Writer) {
                w.write_sized(stringify!($name), &self.0)
            }
        }

        impl Unmarshal for $name {
            fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
                Ok(Self(r.read_sized(stringify!($name))?.to_vec()))
            }
        }
    };
}

sized_buffer!(Digest);
sized_buffer!(
    /// Name of an entity: the name algorithm identifier followed by the
    /// digest of its public area, or the 4 byte handle for permanent entities.
    Name
);
sized_buffer!(
    /// Encrypted private area of an object.
    Private
);
sized_buffer!(
    /// Seed for importing a duplicated object, encrypted to the new parent.
    EncryptedSecret
);

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl Name {
    pub fn of_handle(handle: Handle) -> Self {
        Self(handle.0.to_be_bytes().to_vec())
    }

    fn from_public(name_alg: HashAlg, marshalled: &[u8]) -> Self {
        let mut name = name_alg.id().to_be_bytes().to_vec();
        name.extend_from_slice(&name_alg.hash(&[marshalled]));
        Self(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl Handle {
    pub const OWNER: Handle = Handle(0x4000_0001);
    pub const NULL: Handle = Handle(0x4000_0007);
    pub const PASSWORD: Handle = Handle(0x4000_0009);
    pub const SRK: Handle = Handle(0x8100_0001);

    pub const TYPE_NV_INDEX: u8 = 0x01;
    pub const TYPE_POLICY_SESSION: u8 = 0x03;
    pub const TYPE_TRANSIENT: u8 = 0x80;
    pub const TYPE_PERSISTENT: u8 = 0x81;

    pub fn handle_type(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn is_null(self) -> bool {
        self == Handle::NULL
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Marshal for Handle {
    fn marshal(&self, w: &mut Writer) {
        w.write_u32(self.0)
    }
}

impl Unmarshal for Handle {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        Ok(Handle(r.read_u32()?))
    }
}

macro_rules! attribute_bits {
    ($name:ident { $($flag:ident = $bit:expr,)* }) => {
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            $(pub const $flag: $name = $name(1 << $bit);)*

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn without(self, other: $name) -> $name {
                $name(self.0 & !other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl Marshal for $name {
            fn marshal(&self, w: &mut Writer) {
                w.write_u32(self.0)
            }
        }

        impl Unmarshal for $name {
            fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
                Ok($name(r.read_u32()?))
            }
        }
    };
}

attribute_bits!(ObjectAttributes {
    FIXED_TPM = 1,
    FIXED_PARENT = 4,
    SENSITIVE_DATA_ORIGIN = 5,
    USER_WITH_AUTH = 6,
    ADMIN_WITH_POLICY = 7,
    NO_DA = 10,
    ENCRYPTED_DUPLICATION = 11,
    RESTRICTED = 16,
    DECRYPT = 17,
    SIGN = 18,
});

attribute_bits!(NvAttributes {
    OWNERWRITE = 1,
    AUTHWRITE = 2,
    POLICYWRITE = 3,
    TYPE_COUNTER = 4,
    POLICY_DELETE = 10,
    WRITEDEFINE = 13,
    OWNERREAD = 17,
    AUTHREAD = 18,
    POLICYREAD = 19,
    NO_DA = 25,
    WRITTEN = 29,
});

const ALG_KEYEDHASH: u16 = 0x0008;
const ALG_ECC: u16 = 0x0023;
const ALG_AES: u16 = 0x0006;
const ALG_CFB: u16 = 0x0043;
const ALG_ECDSA: u16 = 0x0018;
const ALG_NULL: u16 = 0x0010;
const ECC_NIST_P256: u16 = 0x0003;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicParams {
    /// Sealed data object. `unique` is the digest binding the public area to
    /// the sealed data.
    KeyedHash { unique: Digest },
    /// NIST P-256 key.
    Ecc {
        #[serde(with = "hex")]
        x: Vec<u8>,
        #[serde(with = "hex")]
        y: Vec<u8>,
    },
}

/// Public area of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Public {
    pub name_alg: HashAlg,
    pub attributes: ObjectAttributes,
    pub auth_policy: Digest,
    pub params: PublicParams,
}

impl Public {
    /// Template for a sealed data object whose use is gated on `auth_policy`.
    pub fn sealed_object(name_alg: HashAlg, auth_policy: Digest, with_pin: bool) -> Self {
        let mut attributes = ObjectAttributes::FIXED_TPM | ObjectAttributes::FIXED_PARENT;
        if !with_pin {
            attributes = attributes | ObjectAttributes::NO_DA;
        }
        Self {
            name_alg,
            attributes,
            auth_policy,
            params: PublicParams::KeyedHash {
                unique: Digest::default(),
            },
        }
    }

    /// Public area for an externally held P-256 signing key.
    pub fn ecc_signing_key(key: &VerifyingKey) -> Self {
        Self {
            name_alg: HashAlg::Sha256,
            attributes: ObjectAttributes::SIGN | ObjectAttributes::USER_WITH_AUTH,
            auth_policy: Digest::default(),
            params: PublicParams::Ecc {
                x: Vec::new(),
                y: Vec::new(),
            },
        }
        .with_ecc_point(&PublicKey::from(key))
    }

    pub fn is_ecc(&self) -> bool {
        matches!(self.params, PublicParams::Ecc { .. })
    }

    pub fn is_sealed_object(&self) -> bool {
        matches!(self.params, PublicParams::KeyedHash { .. })
    }

    pub fn is_storage_parent(&self) -> bool {
        self.attributes
            .contains(ObjectAttributes::RESTRICTED | ObjectAttributes::DECRYPT)
            && !self.attributes.contains(ObjectAttributes::SIGN)
    }

    fn encoded_point(&self) -> Option<EncodedPoint> {
        match &self.params {
            PublicParams::Ecc { x, y } if x.len() == 32 && y.len() == 32 => {
                Some(EncodedPoint::from_affine_coordinates(
                    FieldBytes::from_slice(x),
                    FieldBytes::from_slice(y),
                    false,
                ))
            }
            _ => None,
        }
    }

    /// The P-256 public key, if this is a well formed ECC public area.
    pub fn ecc_public_key(&self) -> Option<PublicKey> {
        PublicKey::from_sec1_bytes(self.encoded_point()?.as_bytes()).ok()
    }

    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(self.encoded_point()?.as_bytes()).ok()
    }

    /// Fills in the public point of an ECC template.
    pub fn with_ecc_point(mut self, key: &PublicKey) -> Self {
        let point = key.to_encoded_point(false);
        self.params = PublicParams::Ecc {
            x: point.x().map(|x| x.to_vec()).unwrap_or_default(),
            y: point.y().map(|y| y.to_vec()).unwrap_or_default(),
        };
        self
    }

    pub fn name(&self) -> mu::Result<Name> {
        Ok(Name::from_public(self.name_alg, &mu::marshal_to_vec(self)?))
    }
}

impl Marshal for Public {
    fn marshal(&self, w: &mut Writer) {
        let ty = match self.params {
            PublicParams::KeyedHash { .. } => ALG_KEYEDHASH,
            PublicParams::Ecc { .. } => ALG_ECC,
        };
        w.write_u16(ty);
        self.name_alg.marshal(w);
        self.attributes.marshal(w);
        self.auth_policy.marshal(w);
        match &self.params {
            PublicParams::KeyedHash { unique } => {
                w.write_u16(ALG_NULL);
                unique.marshal(w);
            }
            PublicParams::Ecc { x, y } => {
                if self.is_storage_parent() {
                    w.write_u16(ALG_AES);
                    w.write_u16(128);
                    w.write_u16(ALG_CFB);
                } else {
                    w.write_u16(ALG_NULL);
                }
                if self.attributes.contains(ObjectAttributes::SIGN) {
                    w.write_u16(ALG_ECDSA);
                    w.write_u16(HashAlg::Sha256.id());
                } else {
                    w.write_u16(ALG_NULL);
                }
                w.write_u16(ECC_NIST_P256);
                w.write_u16(ALG_NULL);
                w.write_sized("EccParameter", x);
                w.write_sized("EccParameter", y);
            }
        }
    }
}

fn expect_u16(r: &mut Reader<'_>, ty: &'static str, want: u16, what: &'static str) -> mu::Result<()> {
    if r.read_u16()? != want {
        return Err(mu::Error::new(ty, ErrorKind::InvalidValue(what)));
    }
    Ok(())
}

impl Unmarshal for Public {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        const T: &str = "Public";
        let ty: u16 = r.read_field(T, "type")?;
        let name_alg: u16 = r.read_field(T, "name_alg")?;
        let attributes: ObjectAttributes = r.read_field(T, "attributes")?;
        let auth_policy: Digest = r.read_field(T, "auth_policy")?;
        let name_alg = HashAlg::from_id(name_alg).ok_or_else(|| {
            mu::Error::new(T, ErrorKind::InvalidValue("unsupported name algorithm"))
        })?;

        let params = match ty {
            ALG_KEYEDHASH => r.field(T, "parameters", |r| {
                expect_u16(r, "KeyedHashScheme", ALG_NULL, "unsupported keyed hash scheme")?;
                Ok(PublicParams::KeyedHash {
                    unique: r.read_field(T, "unique")?,
                })
            })?,
            ALG_ECC => r.field(T, "parameters", |r| {
                let symmetric = r.read_u16()?;
                if symmetric != ALG_NULL {
                    if symmetric != ALG_AES {
                        return Err(mu::Error::new(
                            "SymDefObject",
                            ErrorKind::InvalidValue("unsupported symmetric algorithm"),
                        ));
                    }
                    expect_u16(r, "SymDefObject", 128, "unsupported key size")?;
                    expect_u16(r, "SymDefObject", ALG_CFB, "unsupported mode")?;
                }
                let scheme = r.read_u16()?;
                if scheme != ALG_NULL {
                    if scheme != ALG_ECDSA {
                        return Err(mu::Error::new(
                            "EccScheme",
                            ErrorKind::InvalidValue("unsupported signing scheme"),
                        ));
                    }
                    expect_u16(r, "EccScheme", HashAlg::Sha256.id(), "unsupported scheme digest")?;
                }
                expect_u16(r, "EccCurve", ECC_NIST_P256, "unsupported curve")?;
                expect_u16(r, "KdfScheme", ALG_NULL, "unsupported KDF")?;
                let x = r.field(T, "unique.x", |r| Ok(r.read_sized("EccParameter")?.to_vec()))?;
                let y = r.field(T, "unique.y", |r| Ok(r.read_sized("EccParameter")?.to_vec()))?;
                Ok(PublicParams::Ecc { x, y })
            })?,
            _ => {
                return Err(mu::Error::new(
                    T,
                    ErrorKind::InvalidValue("unsupported object type"),
                ))
            }
        };

        Ok(Self {
            name_alg,
            attributes,
            auth_policy,
            params,
        })
    }
}

/// Public area of an NV index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvPublic {
    pub index: Handle,
    pub name_alg: HashAlg,
    pub attributes: NvAttributes,
    pub auth_policy: Digest,
    pub size: u16,
}

impl NvPublic {
    pub fn name(&self) -> mu::Result<Name> {
        Ok(Name::from_public(self.name_alg, &mu::marshal_to_vec(self)?))
    }
}

impl Marshal for NvPublic {
    fn marshal(&self, w: &mut Writer) {
        self.index.marshal(w);
        self.name_alg.marshal(w);
        self.attributes.marshal(w);
        self.auth_policy.marshal(w);
        w.write_u16(self.size);
    }
}

impl Unmarshal for NvPublic {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        const T: &str = "NvPublic";
        Ok(Self {
            index: r.read_field(T, "index")?,
            name_alg: r.read_field(T, "name_alg")?,
            attributes: r.read_field(T, "attributes")?,
            auth_policy: r.read_field(T, "auth_policy")?,
            size: r.read_field(T, "size")?,
        })
    }
}

/// ECDSA signature in TPM form, with `r` and `s` as big-endian integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub hash: HashAlg,
    #[serde(with = "hex")]
    pub r: Vec<u8>,
    #[serde(with = "hex")]
    pub s: Vec<u8>,
}

impl Signature {
    pub fn from_p256(sig: &p256::ecdsa::Signature) -> Self {
        let bytes = sig.to_bytes();
        let (r, s) = bytes.split_at(32);
        Self {
            hash: HashAlg::Sha256,
            r: r.to_vec(),
            s: s.to_vec(),
        }
    }

    pub fn to_p256(&self) -> Option<p256::ecdsa::Signature> {
        if self.r.len() > 32 || self.s.len() > 32 {
            return None;
        }
        let mut bytes = [0u8; 64];
        bytes[32 - self.r.len()..32].copy_from_slice(&self.r);
        bytes[64 - self.s.len()..].copy_from_slice(&self.s);
        p256::ecdsa::Signature::from_slice(&bytes).ok()
    }
}

impl Marshal for Signature {
    fn marshal(&self, w: &mut Writer) {
        w.write_u16(ALG_ECDSA);
        self.hash.marshal(w);
        w.write_sized("EccParameter", &self.r);
        w.write_sized("EccParameter", &self.s);
    }
}

impl Unmarshal for Signature {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        const T: &str = "Signature";
        r.field(T, "sig_alg", |r| {
            expect_u16(r, "SigScheme", ALG_ECDSA, "unsupported signature scheme")
        })?;
        Ok(Self {
            hash: r.read_field(T, "hash")?,
            r: r.field(T, "signature_r", |r| Ok(r.read_sized("EccParameter")?.to_vec()))?,
            s: r.field(T, "signature_s", |r| Ok(r.read_sized("EccParameter")?.to_vec()))?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCode(pub u32);

impl CommandCode {
    pub const NV_INCREMENT: CommandCode = CommandCode(0x0000_0134);
    pub const NV_READ: CommandCode = CommandCode(0x0000_014e);
    pub const POLICY_NV: CommandCode = CommandCode(0x0000_0149);
    pub const UNSEAL: CommandCode = CommandCode(0x0000_015e);
    pub const POLICY_SIGNED: CommandCode = CommandCode(0x0000_0160);
    pub const POLICY_AUTHORIZE: CommandCode = CommandCode(0x0000_016a);
    pub const POLICY_AUTH_VALUE: CommandCode = CommandCode(0x0000_016b);
    pub const POLICY_COMMAND_CODE: CommandCode = CommandCode(0x0000_016c);
    pub const POLICY_OR: CommandCode = CommandCode(0x0000_0171);
    pub const POLICY_PCR: CommandCode = CommandCode(0x0000_017f);

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

/// Comparison performed by PolicyNV between the index contents (A) and the
/// operand (B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvOperation {
    Eq = 0,
    Neq = 1,
    SignedGt = 2,
    UnsignedGt = 3,
    SignedLt = 4,
    UnsignedLt = 5,
    SignedGe = 6,
    UnsignedGe = 7,
    SignedLe = 8,
    UnsignedLe = 9,
}

impl NvOperation {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Evaluates the comparison for big-endian operands of equal length.
    pub fn compare(self, a: &[u8], b: &[u8]) -> bool {
        use std::cmp::Ordering;
        let unsigned = a.cmp(b);
        let signed = match (a.first(), b.first()) {
            (Some(x), Some(y)) if (x & 0x80) != (y & 0x80) => {
                if x & 0x80 != 0 {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            _ => unsigned,
        };
        match self {
            NvOperation::Eq => a == b,
            NvOperation::Neq => a != b,
            NvOperation::SignedGt => signed == Ordering::Greater,
            NvOperation::UnsignedGt => unsigned == Ordering::Greater,
            NvOperation::SignedLt => signed == Ordering::Less,
            NvOperation::UnsignedLt => unsigned == Ordering::Less,
            NvOperation::SignedGe => signed != Ordering::Less,
            NvOperation::UnsignedGe => unsigned != Ordering::Less,
            NvOperation::SignedLe => signed != Ordering::Greater,
            NvOperation::UnsignedLe => unsigned != Ordering::Greater,
        }
    }
}

/// Proof produced by the TPM that it verified a signature over a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTicket {
    pub hierarchy: Handle,
    pub digest: Digest,
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use p256::ecdsa::SigningKey;

    #[test]
    fn public_round_trip_keeps_name() -> Result<()> {
        let key = SigningKey::from_slice(&[7u8; 32])?;
        let public = Public::ecc_signing_key(key.verifying_key());
        let bytes = mu::marshal_to_vec(&public)?;
        let decoded: Public = mu::unmarshal_from_bytes("Public", &bytes)?;
        assert_eq!(decoded, public);
        assert_eq!(decoded.name()?, public.name()?);
        assert_eq!(&public.name()?[..2], &[0x00, 0x0b]);
        assert_eq!(public.name()?.len(), 34);
        assert_eq!(decoded.verifying_key().as_ref(), Some(key.verifying_key()));
        Ok(())
    }

    #[test]
    fn unknown_object_type_is_rejected() {
        let mut bytes = vec![0x00, 0x01, 0x00, 0x0b, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0x00, 0x10, 0x00, 0x00]);
        let err = mu::unmarshal_from_bytes::<Public>("Public", &bytes)
            .err()
            .map(|e| e.kind());
        assert_eq!(
            err,
            Some(ErrorKind::InvalidValue("unsupported object type"))
        );
    }

    #[test]
    fn signature_leading_zeros_are_restored() -> Result<()> {
        let key = SigningKey::from_slice(&[3u8; 32])?;
        let digest = HashAlg::Sha256.hash(&[b"data"]);
        let sig: p256::ecdsa::Signature =
            p256::ecdsa::signature::hazmat::PrehashSigner::sign_prehash(&key, &digest)?;
        let mut tpm_sig = Signature::from_p256(&sig);
        while tpm_sig.r.first() == Some(&0) {
            tpm_sig.r.remove(0);
        }
        assert_eq!(tpm_sig.to_p256(), Some(sig));
        Ok(())
    }

    #[test]
    fn nv_operations() {
        let one = 1u64.to_be_bytes();
        let two = 2u64.to_be_bytes();
        assert!(NvOperation::UnsignedLe.compare(&one, &two));
        assert!(NvOperation::UnsignedLe.compare(&two, &two));
        assert!(!NvOperation::UnsignedLe.compare(&two, &one));
        let negative = u64::MAX.to_be_bytes();
        assert!(NvOperation::SignedLt.compare(&negative, &one));
        assert!(NvOperation::UnsignedGt.compare(&negative, &one));
    }
}
