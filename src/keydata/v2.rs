use super::v1::{read_static, write_static};
use super::{read_sized_public, write_sized_public, KeyDataV1};
use crate::mu::{self, ErrorKind, Marshal, Reader, Unmarshal, Writer};
use crate::policy::{DynamicPolicyData, StaticPolicyData};
use crate::tpm::types::{EncryptedSecret, Private, Public};

/// Version 1 plus an import seed. While the seed is present `key_private` is
/// a duplicate protected for the target storage key rather than a private
/// area the TPM can load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDataV2 {
    pub key_private: Private,
    pub key_public: Public,
    pub import_sym_seed: EncryptedSecret,
    pub static_policy_data: StaticPolicyData,
    pub dynamic_policy_data: DynamicPolicyData,
}

impl KeyDataV2 {
    /// The equivalent version 1 record, once there is no seed left.
    pub fn as_v1(&self) -> Option<KeyDataV1> {
        if !self.import_sym_seed.is_empty() {
            return None;
        }
        Some(KeyDataV1 {
            key_private: self.key_private.clone(),
            key_public: self.key_public.clone(),
            static_policy_data: self.static_policy_data.clone(),
            dynamic_policy_data: self.dynamic_policy_data.clone(),
        })
    }
}

fn read_seed(r: &mut Reader<'_>) -> mu::Result<EncryptedSecret> {
    let seed = EncryptedSecret::unmarshal(r)?;
    if seed.is_empty() {
        return Err(mu::Error::new(
            "EncryptedSecret",
            ErrorKind::InvalidValue("empty import seed"),
        ));
    }
    Ok(seed)
}

impl Marshal for KeyDataV2 {
    fn marshal(&self, w: &mut Writer) {
        self.key_private.marshal(w);
        write_sized_public(w, &self.key_public);
        self.import_sym_seed.marshal(w);
        write_static(w, &self.static_policy_data);
        self.dynamic_policy_data.marshal(w);
    }
}

impl Unmarshal for KeyDataV2 {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        const T: &str = "KeyDataV2";
        Ok(Self {
            key_private: r.read_field(T, "key_private")?,
            key_public: r.field(T, "key_public", read_sized_public)?,
            import_sym_seed: r.field(T, "import_sym_seed", read_seed)?,
            static_policy_data: r.field(T, "static_policy_data", read_static)?,
            dynamic_policy_data: r.read_field(T, "dynamic_policy_data")?,
        })
    }
}
