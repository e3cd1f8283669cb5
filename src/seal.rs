//! Creating sealed keys and maintaining their PCR policies.

use crate::keydata::{
    AuthMode, KeyData, KeyDataError, KeyDataV1, KeyDataV2, SealedKeyObject, CURRENT_VERSION,
};
use crate::policy::counter::{create_pcr_policy_counter, CounterError, PcrPolicyCounterHandle};
use crate::policy::{
    compute_dynamic_policy, compute_static_policy, AuthPrivateKey, DynamicPolicyComputeParams,
    PolicyError,
};
use crate::tpm::duplicate::{create_duplication_object, Sensitive};
use crate::tpm::pcr::{PcrError, PcrProfile};
use crate::tpm::types::{EncryptedSecret, Handle, HashAlg, Name, NvPublic, ObjectAttributes, Public, PublicParams};
use crate::tpm::{get_or_create_srk, Tpm, TpmError};
use rand::rngs::OsRng;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("cannot provision storage root key: {0}")]
    Provisioning(#[source] TpmError),
    #[error("the storage key is not a valid storage parent")]
    InvalidStorageKey,
    #[error("an importable sealed key cannot have a PCR policy counter")]
    CounterOnImportable,
    #[error("the supplied key is not the authorization key for this sealed key")]
    WrongAuthKey,
    #[error(transparent)]
    KeyData(#[from] KeyDataError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error(transparent)]
    Pcr(#[from] PcrError),
    #[error(transparent)]
    Tpm(#[from] TpmError),
}

pub type Result<T, E = SealError> = core::result::Result<T, E>;

const POLICY_ALG: HashAlg = HashAlg::Sha256;

#[derive(Debug, Clone)]
pub struct KeyCreationParams {
    /// The PCR values under which the key may be unsealed.
    pub pcr_profile: PcrProfile,
    /// Where to create the revocation counter, or [`Handle::NULL`] for none.
    pub pcr_policy_counter_handle: Handle,
    pub pin: Option<String>,
}

impl KeyCreationParams {
    fn auth_mode(&self) -> AuthMode {
        match self.pin {
            Some(_) => AuthMode::Pin,
            None => AuthMode::None,
        }
    }

    fn pin_bytes(&self) -> &[u8] {
        self.pin.as_deref().map(str::as_bytes).unwrap_or_default()
    }
}

fn dynamic_policy(
    version: u32,
    auth_key: &AuthPrivateKey,
    profile: &PcrProfile,
    counter_name: Option<Name>,
    policy_count: u64,
) -> Result<crate::policy::DynamicPolicyData> {
    let (pcrs, pcr_digests) = profile.compute_pcr_digests(POLICY_ALG)?;
    Ok(compute_dynamic_policy(
        version,
        POLICY_ALG,
        DynamicPolicyComputeParams {
            auth_key,
            pcrs,
            pcr_digests,
            counter_name,
            policy_count,
        },
    )?)
}

/// Seals `key` with the storage root key of `tpm` and writes the key file to
/// `path`. Returns the private part of the new authorization key, which is
/// needed to update or revoke the key's PCR policy later.
pub fn seal_key_to_tpm(
    tpm: &mut dyn Tpm,
    key: &[u8],
    path: &Path,
    params: &KeyCreationParams,
) -> Result<AuthPrivateKey> {
    get_or_create_srk(tpm, b"").map_err(SealError::Provisioning)?;

    let auth_key = AuthPrivateKey::random(&mut OsRng);
    let (counter, policy_count) = if params.pcr_policy_counter_handle.is_null() {
        (None::<NvPublic>, 0)
    } else {
        let (public, count) =
            create_pcr_policy_counter(tpm, params.pcr_policy_counter_handle, &auth_key, b"")?;
        (Some(public), count)
    };
    let result = seal_under_srk(tpm, key, path, params, &auth_key, counter.as_ref(), policy_count);
    if let (Err(e), Some(counter)) = (&result, &counter) {
        log::warn!("Removing PCR policy counter {} after sealing failed: {}", counter.index, e);
        if let Err(e) = tpm.nv_undefine_space(b"", counter.index) {
            log::warn!("Cannot remove PCR policy counter {}: {}", counter.index, e);
        }
    }
    result?;
    log::info!("Sealed key to TPM, written to {}", path.display());
    Ok(auth_key)
}

fn seal_under_srk(
    tpm: &mut dyn Tpm,
    key: &[u8],
    path: &Path,
    params: &KeyCreationParams,
    auth_key: &AuthPrivateKey,
    counter: Option<&NvPublic>,
    policy_count: u64,
) -> Result<()> {
    let auth_public = Public::ecc_signing_key(auth_key.verifying_key());
    let counter_name = counter.map(|c| c.name()).transpose().map_err(TpmError::from)?;

    let (static_policy_data, auth_policy) =
        compute_static_policy(POLICY_ALG, &auth_public, counter, CURRENT_VERSION)?;
    let template = Public::sealed_object(POLICY_ALG, auth_policy, params.pin.is_some());
    let (key_private, key_public) = tpm.create(Handle::SRK, &template, params.pin_bytes(), key)?;

    let dynamic_policy_data = dynamic_policy(
        CURRENT_VERSION,
        auth_key,
        &params.pcr_profile,
        counter_name,
        policy_count,
    )?;

    let data = KeyData::V1(KeyDataV1 {
        key_private,
        key_public,
        static_policy_data,
        dynamic_policy_data,
    });
    SealedKeyObject::new(data, params.auth_mode()).write_to_file(path)?;
    Ok(())
}

/// Seals `key` for the TPM owning `srk_public` without access to it. The
/// key file must be imported on the target TPM before it can be unsealed.
pub fn seal_key_to_external_tpm(
    srk_public: &Public,
    key: &[u8],
    path: &Path,
    params: &KeyCreationParams,
) -> Result<AuthPrivateKey> {
    if !srk_public.is_storage_parent() || srk_public.ecc_public_key().is_none() {
        return Err(SealError::InvalidStorageKey);
    }
    if !params.pcr_policy_counter_handle.is_null() {
        return Err(SealError::CounterOnImportable);
    }

    let auth_key = AuthPrivateKey::random(&mut OsRng);
    let auth_public = Public::ecc_signing_key(auth_key.verifying_key());
    let (static_policy_data, auth_policy) =
        compute_static_policy(POLICY_ALG, &auth_public, None, 2)?;

    let mut public = Public::sealed_object(POLICY_ALG, auth_policy, params.pin.is_some());
    public.attributes = public
        .attributes
        .without(ObjectAttributes::FIXED_TPM | ObjectAttributes::FIXED_PARENT);
    let sensitive = Sensitive::sealed(POLICY_ALG, params.pin_bytes(), key);
    public.params = PublicParams::KeyedHash {
        unique: sensitive.unique(POLICY_ALG),
    };
    let (duplicate, seed) = create_duplication_object(srk_public, &public, &sensitive)?;

    let dynamic_policy_data = dynamic_policy(2, &auth_key, &params.pcr_profile, None, 0)?;
    let data = KeyData::V2(KeyDataV2 {
        key_private: duplicate,
        key_public: public,
        import_sym_seed: seed,
        static_policy_data,
        dynamic_policy_data,
    });
    SealedKeyObject::new(data, params.auth_mode()).write_to_file(path)?;
    log::info!("Sealed importable key, written to {}", path.display());
    Ok(auth_key)
}

/// Replaces the PCR policy of the key file at `path` with one for `profile`.
/// The sealed object is unchanged. The new policy's count is one past the
/// counter's current value, so that a later revocation invalidates every
/// older policy but not this one.
pub fn update_key_pcr_protection_policy(
    tpm: &mut dyn Tpm,
    path: &Path,
    auth_key: &AuthPrivateKey,
    profile: &PcrProfile,
) -> Result<()> {
    let mut key = SealedKeyObject::read_from_file(path)?;
    key.check_auth_key(auth_key)?;

    let data = key.data();
    let (counter_name, policy_count) = match data.static_policy().counter_handle() {
        Some(handle) => {
            let counter = PcrPolicyCounterHandle::from_tpm(tpm, handle)?;
            let (name, value) = counter.read(tpm)?;
            (Some(name), value + 1)
        }
        None => (None, 0),
    };
    let dynamic = dynamic_policy(data.version(), auth_key, profile, counter_name, policy_count)?;
    key.data_mut().set_dynamic_policy(dynamic);
    key.write_to_file(path)?;
    log::info!("Updated PCR policy of {} (count {})", path.display(), policy_count);
    Ok(())
}

impl SealedKeyObject {
    fn check_auth_key(&self, auth_key: &AuthPrivateKey) -> Result<()> {
        let expected = &self.data().static_policy().auth_public_key;
        if expected.verifying_key().as_ref() != Some(auth_key.verifying_key()) {
            return Err(SealError::WrongAuthKey);
        }
        Ok(())
    }

    /// Binds an importable key to the storage root key of `tpm`, leaving a
    /// version 1 record that the caller writes back.
    pub fn import(&mut self, tpm: &mut dyn Tpm) -> Result<()> {
        let seed: EncryptedSecret = self
            .data()
            .import_sym_seed()
            .cloned()
            .ok_or(KeyDataError::NotImportable)?;
        get_or_create_srk(tpm, b"").map_err(SealError::Provisioning)?;
        let data = self.data();
        let private = tpm.import(Handle::SRK, data.public(), data.private(), &seed)?;
        self.data_mut().imported(private)?;
        log::info!("Imported sealed key to storage root key {:#010x}", Handle::SRK.0);
        Ok(())
    }

    /// Advances the revocation counter to this key's policy count, so that
    /// every PCR policy signed with a lower count stops working.
    pub fn revoke_old_pcr_protection_policies(
        &self,
        tpm: &mut dyn Tpm,
        auth_key: &AuthPrivateKey,
    ) -> Result<()> {
        self.check_auth_key(auth_key)?;
        let data = self.data();
        let handle = match data.static_policy().counter_handle() {
            Some(handle) => handle,
            None => {
                log::info!("Key has no PCR policy counter, nothing to revoke");
                return Ok(());
            }
        };
        let counter = PcrPolicyCounterHandle::from_tpm(tpm, handle)?;
        let policies = data
            .static_policy()
            .counter_auth_policies(data.version(), counter.public().name_alg)
            .map_err(TpmError::from)?;
        let target = data.dynamic_policy().policy_count;
        counter.increment_to(tpm, target, auth_key, &policies)?;
        log::info!("Revoked PCR policies older than count {} on {:#010x}", target, handle.0);
        Ok(())
    }
}
