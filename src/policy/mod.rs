//! Authorization policies of sealed keys.
//!
//! A sealed object's own policy is fixed when it is created (the *static*
//! policy): PolicyAuthorize by the authorization key, followed by
//! PolicyAuthValue. What the authorization key signs is the *dynamic* policy:
//! an OR over every acceptable PCR state, followed by a PolicyNV assertion
//! that the revocation counter hasn't moved past the policy's count. Signing a
//! new dynamic policy changes which boot states can unseal without touching
//! the sealed object.

use self::counter::counter_auth_policies;
use self::or_tree::{PolicyOrData, PolicyOrError, PolicyOrTree};
use self::trial::TrialAuthPolicy;
use crate::mu::{self, Marshal, Reader, Unmarshal, Writer};
use crate::tpm::pcr::{PcrError, PcrSelectionList};
use crate::tpm::types::*;
use crate::tpm::{ObjectCtx, ResponseCode, Tpm, TpmError};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::SigningKey;
use thiserror::Error;

pub mod counter;
pub mod or_tree;
pub mod trial;

/// The private part of the key that signs dynamic policies.
pub type AuthPrivateKey = SigningKey;

#[derive(Error, Debug)]
pub enum AssertionError {
    #[error("cannot complete OR assertions: {0}")]
    Or(#[from] PolicyOrError),
    #[error("the PCR policy has been revoked")]
    Revoked,
    #[error("cannot complete PolicyNV assertion: {0}")]
    Nv(#[source] TpmError),
    #[error("cannot complete PolicyAuthorize assertion: {0}")]
    Authorize(#[source] TpmError),
    #[error(transparent)]
    Tpm(#[from] TpmError),
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("cannot complete authorization policy assertions: {0}")]
    Assertions(#[from] AssertionError),
    #[error("dynamic authorization policy signature verification failed")]
    InvalidSignature,
    #[error("cannot sign dynamic authorization policy: {0}")]
    Sign(#[source] p256::ecdsa::Error),
    #[error("cannot compute PCR policy: {0}")]
    Pcr(#[from] PcrError),
    #[error(transparent)]
    Marshal(#[from] mu::Error),
}

pub type Result<T, E = PolicyError> = core::result::Result<T, E>;

/// Policy data fixed when the key is sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPolicyData {
    pub auth_public_key: Public,
    /// [`Handle::NULL`] if there is no revocation counter.
    pub pcr_policy_counter_handle: Handle,
    /// Branches of the counter's authorization policy. Only version 0 keys
    /// store these; later versions compute them from the authorization key.
    pub v0_counter_auth_policies: Vec<Digest>,
}

impl StaticPolicyData {
    pub fn counter_handle(&self) -> Option<Handle> {
        Some(self.pcr_policy_counter_handle).filter(|h| !h.is_null())
    }

    /// Branches of the revocation counter's authorization policy.
    pub fn counter_auth_policies(&self, version: u32, alg: HashAlg) -> mu::Result<Vec<Digest>> {
        if version == 0 {
            return Ok(self.v0_counter_auth_policies.clone());
        }
        Ok(counter_auth_policies(alg, &self.auth_public_key.name()?))
    }
}

/// The signed, replaceable part of a key's policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicPolicyData {
    pub pcr_selection: PcrSelectionList,
    pub pcr_or_data: PolicyOrData,
    pub policy_count: u64,
    pub authorized_policy: Digest,
    pub authorized_policy_signature: Signature,
}

impl Marshal for DynamicPolicyData {
    fn marshal(&self, w: &mut Writer) {
        self.pcr_selection.marshal(w);
        self.pcr_or_data.marshal(w);
        w.write_u64(self.policy_count);
        self.authorized_policy.marshal(w);
        self.authorized_policy_signature.marshal(w);
    }
}

impl Unmarshal for DynamicPolicyData {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        const T: &str = "DynamicPolicyData";
        Ok(Self {
            pcr_selection: r.read_field(T, "pcr_selection")?,
            pcr_or_data: r.read_field(T, "pcr_or_data")?,
            policy_count: r.read_field(T, "policy_count")?,
            authorized_policy: r.read_field(T, "authorized_policy")?,
            authorized_policy_signature: r.read_field(T, "authorized_policy_signature")?,
        })
    }
}

/// The policyRef binding a dynamic policy to a counter. Version 0 keys
/// don't use one.
pub fn compute_policy_ref(alg: HashAlg, version: u32, counter_name: Option<&Name>) -> Vec<u8> {
    if version == 0 {
        return Vec::new();
    }
    let name = counter_name.map(|n| n.as_bytes()).unwrap_or_default();
    alg.hash(&[name]).into_inner()
}

/// Returns the static policy data of a new key and the authorization policy
/// of its sealed object.
pub fn compute_static_policy(
    alg: HashAlg,
    auth_key_public: &Public,
    counter: Option<&NvPublic>,
    version: u32,
) -> Result<(StaticPolicyData, Digest)> {
    let key_name = auth_key_public.name()?;
    let counter_name = counter.map(|c| c.name()).transpose()?;
    let policy_ref = compute_policy_ref(alg, version, counter_name.as_ref());

    let mut trial = TrialAuthPolicy::new(alg);
    trial.policy_authorize(&policy_ref, &key_name);
    trial.policy_auth_value();

    let v0_counter_auth_policies = match counter {
        Some(c) if version == 0 => counter_auth_policies(c.name_alg, &key_name),
        _ => Vec::new(),
    };
    let data = StaticPolicyData {
        auth_public_key: auth_key_public.clone(),
        pcr_policy_counter_handle: counter.map(|c| c.index).unwrap_or(Handle::NULL),
        v0_counter_auth_policies,
    };
    Ok((data, trial.into_digest()))
}

pub struct DynamicPolicyComputeParams<'a> {
    pub auth_key: &'a AuthPrivateKey,
    pub pcrs: PcrSelectionList,
    /// Composite digest of every acceptable PCR state, in order.
    pub pcr_digests: Vec<Digest>,
    pub counter_name: Option<Name>,
    pub policy_count: u64,
}

pub fn compute_dynamic_policy(
    version: u32,
    alg: HashAlg,
    params: DynamicPolicyComputeParams<'_>,
) -> Result<DynamicPolicyData> {
    let leaves = params
        .pcr_digests
        .iter()
        .map(|digest| -> Result<Digest> {
            let mut trial = TrialAuthPolicy::new(alg);
            trial.policy_pcr(digest, &params.pcrs)?;
            Ok(trial.into_digest())
        })
        .collect::<Result<Vec<_>>>()?;
    let tree = PolicyOrTree::new(alg, &leaves);

    let mut trial = TrialAuthPolicy::from_digest(alg, tree.root_digest());
    if let Some(name) = &params.counter_name {
        trial.policy_nv(
            &params.policy_count.to_be_bytes(),
            0,
            NvOperation::UnsignedLe,
            name,
        );
    }
    let authorized_policy = trial.into_digest();

    let policy_ref = compute_policy_ref(alg, version, params.counter_name.as_ref());
    let a_hash = alg.hash(&[&authorized_policy, &policy_ref]);
    let signature: p256::ecdsa::Signature = params
        .auth_key
        .sign_prehash(&a_hash)
        .map_err(PolicyError::Sign)?;

    Ok(DynamicPolicyData {
        pcr_selection: params.pcrs,
        pcr_or_data: tree.flatten(),
        policy_count: params.policy_count,
        authorized_policy,
        authorized_policy_signature: Signature::from_p256(&signature),
    })
}

impl DynamicPolicyData {
    /// Checks the signature over the authorized policy without a TPM.
    pub fn verify_signature(
        &self,
        alg: HashAlg,
        auth_key_public: &Public,
        policy_ref: &[u8],
    ) -> Result<()> {
        let key = auth_key_public
            .verifying_key()
            .ok_or(PolicyError::InvalidSignature)?;
        let signature = self
            .authorized_policy_signature
            .to_p256()
            .ok_or(PolicyError::InvalidSignature)?;
        let a_hash = alg.hash(&[&self.authorized_policy, policy_ref]);
        key.verify_prehash(&a_hash, &signature)
            .map_err(|_| PolicyError::InvalidSignature)
    }
}

/// Runs the assertions of a sealed key's policy in `session`, leaving it
/// ready to authorize Unseal. The caller still supplies the auth value.
pub fn execute_policy_session(
    tpm: &mut dyn Tpm,
    session: Handle,
    alg: HashAlg,
    version: u32,
    static_data: &StaticPolicyData,
    dynamic_data: &DynamicPolicyData,
) -> Result<()> {
    tpm.policy_pcr(session, &Digest::default(), &dynamic_data.pcr_selection)
        .map_err(AssertionError::from)?;
    let tree = dynamic_data
        .pcr_or_data
        .resolve(alg)
        .map_err(AssertionError::from)?;
    tree.execute_assertions(tpm, session)
        .map_err(AssertionError::from)?;

    let counter_name = match static_data.counter_handle() {
        Some(handle) => {
            let (_, name) = tpm.nv_read_public(handle).map_err(AssertionError::Nv)?;
            let operand = dynamic_data.policy_count.to_be_bytes();
            match tpm.policy_nv(handle, session, &operand, 0, NvOperation::UnsignedLe) {
                Ok(()) => {}
                Err(e) if e.is_response(ResponseCode::PolicyFail) => {
                    return Err(AssertionError::Revoked.into())
                }
                Err(e) => return Err(AssertionError::Nv(e).into()),
            }
            Some(name)
        }
        None => None,
    };

    let policy_ref = compute_policy_ref(alg, version, counter_name.as_ref());
    let mut key = ObjectCtx::load_external(tpm, &static_data.auth_public_key)
        .map_err(AssertionError::Authorize)?;
    let key_handle = key.handle;
    let key_name = static_data.auth_public_key.name()?;
    let a_hash = alg.hash(&[&dynamic_data.authorized_policy, &policy_ref]);
    let ticket = key
        .verify_signature(key_handle, &a_hash, &dynamic_data.authorized_policy_signature)
        .map_err(AssertionError::Authorize)?;
    key.policy_authorize(
        session,
        &dynamic_data.authorized_policy,
        &policy_ref,
        &key_name,
        &ticket,
    )
    .map_err(AssertionError::Authorize)?;
    key.policy_auth_value(session).map_err(AssertionError::from)?;
    Ok(())
}
