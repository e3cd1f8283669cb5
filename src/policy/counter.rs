//! The NV counter that revokes old dynamic policies.
//!
//! Every dynamic policy asserts PolicyNV(counter <= policy_count). Moving the
//! counter past a policy's count invalidates it. The counter can only be
//! incremented by a holder of the authorization key, through a PolicySigned
//! branch of the index's own authorization policy.

use super::trial::TrialAuthPolicy;
use crate::tpm::types::*;
use crate::tpm::{ObjectCtx, SessionCtx, Tpm, TpmError};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::SigningKey;
use thiserror::Error;

pub const COUNTER_HANDLE_FIRST: u32 = 0x0180_0000;
pub const COUNTER_HANDLE_LAST: u32 = 0x01ff_ffff;

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("invalid PCR policy counter handle {0}")]
    InvalidHandle(Handle),
    #[error("NV index {0} is not a PCR policy counter")]
    InvalidIndex(Handle),
    #[error("cannot sign counter authorization: {0}")]
    Signature(#[from] p256::ecdsa::Error),
    #[error(transparent)]
    Tpm(#[from] TpmError),
}

pub type Result<T, E = CounterError> = core::result::Result<T, E>;

fn check_handle(handle: Handle) -> Result<()> {
    if !(COUNTER_HANDLE_FIRST..=COUNTER_HANDLE_LAST).contains(&handle.0) {
        return Err(CounterError::InvalidHandle(handle));
    }
    Ok(())
}

/// Branch digests of a counter's authorization policy: increment with a
/// signature from the authorization key, or read by anyone.
pub fn counter_auth_policies(alg: HashAlg, auth_key_name: &Name) -> Vec<Digest> {
    let mut increment = TrialAuthPolicy::new(alg);
    increment.policy_signed(auth_key_name, &[]);
    increment.policy_command_code(CommandCode::NV_INCREMENT);

    let mut read = TrialAuthPolicy::new(alg);
    read.policy_command_code(CommandCode::NV_READ);

    vec![increment.into_digest(), read.into_digest()]
}

/// Public area for a new counter at `handle` controlled by `auth_key_public`.
pub fn counter_nv_public(handle: Handle, auth_key_public: &Public) -> Result<NvPublic> {
    check_handle(handle)?;
    let alg = HashAlg::Sha256;
    let mut trial = TrialAuthPolicy::new(alg);
    trial.policy_or(&counter_auth_policies(alg, &auth_key_public.name().map_err(TpmError::from)?));
    Ok(NvPublic {
        index: handle,
        name_alg: alg,
        attributes: NvAttributes::TYPE_COUNTER
            | NvAttributes::POLICYWRITE
            | NvAttributes::AUTHREAD
            | NvAttributes::NO_DA,
        auth_policy: trial.into_digest(),
        size: 8,
    })
}

/// A counter index as the TPM currently reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrPolicyCounterHandle {
    public: NvPublic,
    name: Name,
}

impl PcrPolicyCounterHandle {
    pub fn from_tpm(tpm: &mut dyn Tpm, handle: Handle) -> Result<Self> {
        check_handle(handle)?;
        let (public, name) = tpm.nv_read_public(handle)?;
        if public.index != handle || !public.attributes.contains(NvAttributes::TYPE_COUNTER) {
            return Err(CounterError::InvalidIndex(handle));
        }
        Ok(Self { public, name })
    }

    pub fn handle(&self) -> Handle {
        self.public.index
    }

    pub fn public(&self) -> &NvPublic {
        &self.public
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Reads the current name and value of the counter.
    pub fn read(&self, tpm: &mut dyn Tpm) -> Result<(Name, u64)> {
        let (_, name) = tpm.nv_read_public(self.handle())?;
        let value = tpm.nv_read_counter(self.handle())?;
        Ok((name, value))
    }

    /// Increments the counter once. `auth_policies` are the branches of the
    /// index's authorization policy.
    pub fn increment(
        &self,
        tpm: &mut dyn Tpm,
        auth_key: &SigningKey,
        auth_policies: &[Digest],
    ) -> Result<()> {
        let key_public = Public::ecc_signing_key(auth_key.verifying_key());
        let mut key = ObjectCtx::load_external(tpm, &key_public)?;
        let key_handle = key.handle;
        let mut session = SessionCtx::start(&mut *key, self.public.name_alg)?;
        let handle = session.session;

        let nonce = session.session_nonce(handle)?;
        // expiration 0, no cpHash and an empty policyRef
        let a_hash = HashAlg::Sha256.hash(&[&nonce, &0i32.to_be_bytes()]);
        let signature: p256::ecdsa::Signature = auth_key.sign_prehash(&a_hash)?;
        session.policy_signed(key_handle, handle, &[], 0, &Signature::from_p256(&signature))?;
        session.policy_command_code(handle, CommandCode::NV_INCREMENT)?;
        session.policy_or(handle, auth_policies)?;
        session.nv_increment(self.handle(), handle)?;
        Ok(())
    }

    /// Advances the counter until it is at least `target`.
    pub fn increment_to(
        &self,
        tpm: &mut dyn Tpm,
        target: u64,
        auth_key: &SigningKey,
        auth_policies: &[Digest],
    ) -> Result<()> {
        loop {
            let (_, value) = self.read(tpm)?;
            if value >= target {
                return Ok(());
            }
            log::debug!("incrementing PCR policy counter {} from {}", self.handle(), value);
            self.increment(tpm, auth_key, auth_policies)?;
        }
    }
}

/// Defines a new counter at `handle` and increments it once so that it can be
/// read. Returns the public area of the written index and its value.
pub fn create_pcr_policy_counter(
    tpm: &mut dyn Tpm,
    handle: Handle,
    auth_key: &SigningKey,
    owner_auth: &[u8],
) -> Result<(NvPublic, u64)> {
    let auth_key_public = Public::ecc_signing_key(auth_key.verifying_key());
    let public = counter_nv_public(handle, &auth_key_public)?;
    let name = public.name().map_err(TpmError::from)?;
    let policies = counter_auth_policies(public.name_alg, &auth_key_public.name().map_err(TpmError::from)?);
    tpm.nv_define_space(owner_auth, &public)?;

    let unwritten = PcrPolicyCounterHandle { public, name };
    if let Err(e) = unwritten.increment(tpm, auth_key, &policies) {
        if let Err(e) = tpm.nv_undefine_space(owner_auth, handle) {
            log::warn!("Cannot remove unwritten PCR policy counter {}: {}", handle, e);
        }
        return Err(e);
    }

    let counter = PcrPolicyCounterHandle::from_tpm(tpm, handle)?;
    let (_, value) = counter.read(tpm)?;
    log::info!("Created PCR policy counter at {:#010x}", handle.0);
    Ok((counter.public, value))
}
