//! Sealed key data and the key file that carries it.
//!
//! Three versions of the record exist. Version 0 stores the branches of the
//! revocation counter's policy and uses no policyRef; version 1 derives both
//! from the counter's name; version 2 is version 1 plus the seed needed to
//! import a key sealed to a TPM's storage key without access to that TPM.
//! Once imported, a version 2 record is written out as version 1.

use crate::mu::{self, ErrorKind, Marshal, Reader, Unmarshal, Writer};
use crate::policy::counter::CounterError;
use crate::policy::{DynamicPolicyData, PolicyError, StaticPolicyData};
use crate::tpm::types::{EncryptedSecret, HashAlg, Private, Public};
use crate::tpm::TpmError;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

pub use self::v0::KeyDataV0;
pub use self::v1::KeyDataV1;
pub use self::v2::KeyDataV2;

mod v0;
mod v1;
mod v2;
mod validate;

/// "USK$"
pub const KEY_DATA_HEADER: u32 = 0x5553_4b24;
pub const CURRENT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum KeyDataError {
    #[error("unrecognized version {0}")]
    UnrecognizedVersion(u32),
    #[error("cannot decode key data: {0}")]
    Format(#[from] mu::Error),
    #[error("cannot validate importable key data")]
    Importable,
    #[error("key data does not need to be imported")]
    NotImportable,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KeyDataError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        KeyDataError::Invalid(msg.into())
    }
}

pub type Result<T, E = KeyDataError> = core::result::Result<T, E>;

fn write_sized_public(w: &mut Writer, public: &Public) {
    w.write_sized_value("Public", public)
}

fn read_sized_public(r: &mut Reader<'_>) -> mu::Result<Public> {
    let bytes = r.read_sized("Public")?;
    mu::unmarshal_from_bytes("Public", bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyData {
    V0(KeyDataV0),
    V1(KeyDataV1),
    V2(KeyDataV2),
}

impl KeyData {
    /// Decodes a version tag and the record that follows it.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let data = Self::read_from(&mut r)?;
        if !r.is_empty() {
            return Err(mu::Error::new("KeyData", ErrorKind::TrailingBytes).into());
        }
        Ok(data)
    }

    fn read_from(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.read_u32()?;
        Ok(match version {
            0 => KeyData::V0(KeyDataV0::unmarshal(r)?),
            1 => KeyData::V1(KeyDataV1::unmarshal(r)?),
            2 => KeyData::V2(KeyDataV2::unmarshal(r)?),
            v => return Err(KeyDataError::UnrecognizedVersion(v)),
        })
    }

    /// Reads a version 0 record without its version tag.
    pub fn read_v0(body: &[u8]) -> Result<Self> {
        Ok(KeyData::V0(mu::unmarshal_from_bytes("KeyDataV0", body)?))
    }

    pub fn read_v1(body: &[u8]) -> Result<Self> {
        Ok(KeyData::V1(mu::unmarshal_from_bytes("KeyDataV1", body)?))
    }

    pub fn read_v2(body: &[u8]) -> Result<Self> {
        Ok(KeyData::V2(mu::unmarshal_from_bytes("KeyDataV2", body)?))
    }

    /// Version tag followed by the record.
    pub fn write(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        w.write_u32(self.version());
        self.marshal_body(&mut w);
        Ok(w.into_bytes()?)
    }

    /// The record without its version tag.
    pub fn write_body(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        self.marshal_body(&mut w);
        Ok(w.into_bytes()?)
    }

    fn marshal_body(&self, w: &mut Writer) {
        match self {
            KeyData::V0(d) => d.marshal(w),
            KeyData::V1(d) => d.marshal(w),
            KeyData::V2(d) => match d.as_v1() {
                Some(v1) => v1.marshal(w),
                None => d.marshal(w),
            },
        }
    }

    /// The version this record is written as.
    pub fn version(&self) -> u32 {
        match self {
            KeyData::V0(_) => 0,
            KeyData::V1(_) => 1,
            KeyData::V2(d) if d.import_sym_seed.is_empty() => 1,
            KeyData::V2(_) => 2,
        }
    }

    pub fn private(&self) -> &Private {
        match self {
            KeyData::V0(d) => &d.key_private,
            KeyData::V1(d) => &d.key_private,
            KeyData::V2(d) => &d.key_private,
        }
    }

    pub fn public(&self) -> &Public {
        match self {
            KeyData::V0(d) => &d.key_public,
            KeyData::V1(d) => &d.key_public,
            KeyData::V2(d) => &d.key_public,
        }
    }

    /// The seed of an importable record that hasn't been imported yet.
    pub fn import_sym_seed(&self) -> Option<&EncryptedSecret> {
        match self {
            KeyData::V2(d) if !d.import_sym_seed.is_empty() => Some(&d.import_sym_seed),
            _ => None,
        }
    }

    pub fn is_importable(&self) -> bool {
        self.import_sym_seed().is_some()
    }

    /// Replaces the duplicate with the private area returned by the TPM's
    /// Import, discarding the seed.
    pub fn imported(&mut self, private: Private) -> Result<()> {
        match self {
            KeyData::V2(d) if !d.import_sym_seed.is_empty() => {
                d.key_private = private;
                d.import_sym_seed = EncryptedSecret::default();
                Ok(())
            }
            _ => Err(KeyDataError::NotImportable),
        }
    }

    pub fn static_policy(&self) -> &StaticPolicyData {
        match self {
            KeyData::V0(d) => &d.static_policy_data,
            KeyData::V1(d) => &d.static_policy_data,
            KeyData::V2(d) => &d.static_policy_data,
        }
    }

    pub fn dynamic_policy(&self) -> &DynamicPolicyData {
        match self {
            KeyData::V0(d) => &d.dynamic_policy_data,
            KeyData::V1(d) => &d.dynamic_policy_data,
            KeyData::V2(d) => &d.dynamic_policy_data,
        }
    }

    pub fn set_dynamic_policy(&mut self, dynamic: DynamicPolicyData) {
        match self {
            KeyData::V0(d) => d.dynamic_policy_data = dynamic,
            KeyData::V1(d) => d.dynamic_policy_data = dynamic,
            KeyData::V2(d) => d.dynamic_policy_data = dynamic,
        }
    }

    /// Digest algorithm of the sealed object's policy.
    pub fn policy_alg(&self) -> HashAlg {
        self.public().name_alg
    }
}

/// How the user authenticates to the sealed object besides the PCR policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    None,
    Pin,
}

impl AuthMode {
    fn from_byte(b: u8) -> mu::Result<Self> {
        match b {
            0 => Ok(AuthMode::None),
            1 => Ok(AuthMode::Pin),
            _ => Err(mu::Error::new("AuthMode", ErrorKind::InvalidValue("unknown auth mode"))),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            AuthMode::None => 0,
            AuthMode::Pin => 1,
        }
    }
}

/// A key file: header, versioned key data and the auth mode hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedKeyObject {
    data: KeyData,
    auth_mode: AuthMode,
    // files written before the hint existed end with the key data
    has_auth_mode_byte: bool,
}

impl SealedKeyObject {
    pub fn new(data: KeyData, auth_mode: AuthMode) -> Self {
        Self {
            data,
            auth_mode,
            has_auth_mode_byte: true,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u32()?;
        if magic != KEY_DATA_HEADER {
            return Err(mu::Error::new(
                "SealedKeyObject",
                ErrorKind::InvalidValue("unexpected header"),
            )
            .into());
        }
        let data = KeyData::read_from(&mut r)?;
        let (auth_mode, has_auth_mode_byte) = match r.remaining() {
            0 => (AuthMode::None, false),
            1 => (AuthMode::from_byte(r.read_u8()?)?, true),
            _ => return Err(mu::Error::new("SealedKeyObject", ErrorKind::TrailingBytes).into()),
        };
        Ok(Self {
            data,
            auth_mode,
            has_auth_mode_byte,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = KEY_DATA_HEADER.to_be_bytes().to_vec();
        bytes.extend(self.data.write()?);
        if self.has_auth_mode_byte {
            bytes.push(self.auth_mode.to_byte());
        }
        Ok(bytes)
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Replaces `path` atomically, so a crash never leaves a partial key file.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes()?)?;
        Ok(())
    }

    pub fn data(&self) -> &KeyData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut KeyData {
        &mut self.data
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    pub fn requires_pin(&self) -> bool {
        self.auth_mode == AuthMode::Pin
    }

    pub fn version(&self) -> u32 {
        self.data.version()
    }
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mu::ErrorKind;
    use crate::policy::or_tree::PolicyOrTree;
    use crate::tpm::pcr::PcrSelectionList;
    use crate::tpm::types::{Digest, Handle, Signature};
    use eyre::Result;
    use p256::ecdsa::SigningKey;

    pub(crate) fn mock_static(counter: Handle) -> Result<StaticPolicyData> {
        let key = SigningKey::from_slice(&[0x5a; 32])?;
        let mut auth_public_key = Public::ecc_signing_key(key.verifying_key());
        // keeps the v1-as-v2 misread deterministic
        auth_public_key.auth_policy = Digest::new(vec![0xff; 32]);
        Ok(StaticPolicyData {
            auth_public_key,
            pcr_policy_counter_handle: counter,
            v0_counter_auth_policies: Vec::new(),
        })
    }

    pub(crate) fn mock_dynamic() -> DynamicPolicyData {
        DynamicPolicyData {
            pcr_selection: PcrSelectionList::default(),
            pcr_or_data: PolicyOrTree::new(HashAlg::Sha256, &[]).flatten(),
            policy_count: 3,
            authorized_policy: Digest::new(vec![0; 32]),
            authorized_policy_signature: Signature {
                hash: HashAlg::Sha256,
                r: vec![0; 32],
                s: vec![0; 32],
            },
        }
    }

    fn sealed_public() -> Public {
        let mut public = Public::sealed_object(HashAlg::Sha256, Digest::new(vec![1; 32]), false);
        public.params = crate::tpm::types::PublicParams::KeyedHash {
            unique: Digest::new(vec![2; 32]),
        };
        public
    }

    fn v2(seed: &[u8]) -> Result<KeyDataV2> {
        Ok(KeyDataV2 {
            key_private: Private::new(vec![9; 40]),
            key_public: sealed_public(),
            import_sym_seed: EncryptedSecret::new(seed.to_vec()),
            static_policy_data: mock_static(Handle(0x0180_0000))?,
            dynamic_policy_data: mock_dynamic(),
        })
    }

    #[test]
    fn bound_v2_is_written_as_v1() -> Result<()> {
        let data = KeyData::V2(v2(&[])?);
        assert_eq!(data.version(), 1);
        let body = data.write_body()?;
        let read = KeyData::read_v1(&body)?;
        let expected = match &data {
            KeyData::V2(d) => d.as_v1().map(KeyData::V1),
            _ => None,
        };
        assert_eq!(Some(read.clone()), expected);
        assert_eq!(KeyData::read(&data.write()?)?, read);
        Ok(())
    }

    #[test]
    fn importable_v2_round_trip() -> Result<()> {
        let data = KeyData::V2(v2(&[7; 70])?);
        assert_eq!(data.version(), 2);
        let bytes = data.write()?;
        let read = KeyData::read(&bytes)?;
        assert_eq!(read, data);
        assert_eq!(read.write()?, bytes);
        Ok(())
    }

    #[test]
    fn v1_read_as_v2_reports_field_path() -> Result<()> {
        let body = KeyData::V2(v2(&[])?).write_body()?;
        let err = match KeyData::read_v2(&body) {
            Err(KeyDataError::Format(e)) => e,
            other => eyre::bail!("unexpected result {:?}", other),
        };
        assert_eq!(err.kind(), ErrorKind::SizeTooLarge);
        assert_eq!(
            err.path().as_deref(),
            Some("KeyDataV2.static_policy_data.auth_public_key.auth_policy")
        );
        assert_eq!(
            err.to_string(),
            "cannot unmarshal Digest in KeyDataV2.static_policy_data.auth_public_key.auth_policy: \
             sized value has a size larger than the remaining bytes"
        );
        Ok(())
    }

    #[test]
    fn v2_with_empty_seed_is_not_readable_as_v2() -> Result<()> {
        let mut w = Writer::new();
        v2(&[])?.marshal(&mut w);
        let err = KeyData::read_v2(&w.into_bytes()?).err();
        assert!(matches!(err, Some(KeyDataError::Format(_))));
        Ok(())
    }

    #[test]
    fn unknown_version() -> Result<()> {
        let mut bytes = KeyData::V2(v2(&[])?).write()?;
        bytes[..4].copy_from_slice(&5u32.to_be_bytes());
        assert!(matches!(
            KeyData::read(&bytes),
            Err(KeyDataError::UnrecognizedVersion(5))
        ));
        Ok(())
    }

    #[test]
    fn trailing_bytes_are_rejected() -> Result<()> {
        let mut bytes = KeyData::V2(v2(&[])?).write()?;
        bytes.push(0);
        let err = match KeyData::read(&bytes) {
            Err(KeyDataError::Format(e)) => Some(e.kind()),
            _ => None,
        };
        assert_eq!(err, Some(ErrorKind::TrailingBytes));
        Ok(())
    }

    #[test]
    fn imported_discards_seed() -> Result<()> {
        let mut data = KeyData::V2(v2(&[7; 70])?);
        assert!(data.is_importable());
        data.imported(Private::new(vec![1, 2, 3]))?;
        assert!(!data.is_importable());
        assert_eq!(data.version(), 1);
        assert_eq!(data.private(), &Private::new(vec![1, 2, 3]));
        assert!(matches!(
            data.imported(Private::default()),
            Err(KeyDataError::NotImportable)
        ));
        Ok(())
    }

    #[test]
    fn key_file_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("key");
        let object = SealedKeyObject::new(KeyData::V2(v2(&[])?), AuthMode::Pin);
        object.write_to_file(&path)?;
        let bytes = fs::read(&path)?;
        assert_eq!(&bytes[..4], b"USK$");
        assert_eq!(bytes.last(), Some(&1));

        let read = SealedKeyObject::read_from_file(&path)?;
        assert!(read.requires_pin());
        assert_eq!(read.version(), 1);

        // files written before the auth mode hint existed
        let legacy = SealedKeyObject::from_bytes(&bytes[..bytes.len() - 1])?;
        assert_eq!(legacy.auth_mode(), AuthMode::None);
        Ok(())
    }

    #[test]
    fn legacy_key_file_is_written_back_unchanged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("key");
        let mut bytes = SealedKeyObject::new(KeyData::V2(v2(&[])?), AuthMode::None).to_bytes()?;
        assert_eq!(bytes.pop(), Some(0));
        fs::write(&path, &bytes)?;

        let mut legacy = SealedKeyObject::read_from_file(&path)?;
        legacy.write_to_file(&path)?;
        assert_eq!(fs::read(&path)?, bytes);

        // a changed policy still leaves the hint out
        let dynamic = legacy.data().dynamic_policy().clone();
        legacy.data_mut().set_dynamic_policy(dynamic);
        assert_eq!(legacy.to_bytes()?, bytes);
        Ok(())
    }

    #[test]
    fn bad_header() {
        let err = SealedKeyObject::from_bytes(b"XXXX\0\0\0\x01").err();
        assert!(matches!(err, Some(KeyDataError::Format(_))));
    }
}
