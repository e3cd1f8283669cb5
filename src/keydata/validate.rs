use super::{KeyData, KeyDataError, Result};
use crate::policy::counter::{CounterError, PcrPolicyCounterHandle};
use crate::policy::compute_static_policy;
use crate::policy::trial::TrialAuthPolicy;
use crate::tpm::types::{Handle, ObjectAttributes};
use crate::tpm::{ObjectCtx, ResponseCode, Tpm};

impl KeyData {
    /// Checks that the record is consistent with itself and with the TPM:
    /// the sealed object's policy is the one the static data implies, the
    /// counter is the one the policy was computed for, the dynamic policy is
    /// signed by the authorization key and the sealed object loads under the
    /// storage root key. No secret is unsealed.
    ///
    /// Returns the counter, if the key has one.
    pub fn validate_data(&self, tpm: &mut dyn Tpm) -> Result<Option<PcrPolicyCounterHandle>> {
        if self.is_importable() {
            return Err(KeyDataError::Importable);
        }
        let version = self.version();
        let public = self.public();
        let static_data = self.static_policy();

        if !public.is_sealed_object() {
            return Err(KeyDataError::invalid("sealed key object has the wrong type"));
        }
        let forbidden = ObjectAttributes::USER_WITH_AUTH
            | ObjectAttributes::RESTRICTED
            | ObjectAttributes::DECRYPT
            | ObjectAttributes::SIGN;
        if public.attributes.0 & forbidden.0 != 0 {
            return Err(KeyDataError::invalid("sealed key object has the wrong attributes"));
        }

        let auth_key = &static_data.auth_public_key;
        if !auth_key.attributes.contains(ObjectAttributes::SIGN) || auth_key.verifying_key().is_none() {
            return Err(KeyDataError::invalid(
                "authorization key is not a P-256 signing key",
            ));
        }

        let counter = match static_data.counter_handle() {
            Some(handle) => Some(read_counter(tpm, handle)?),
            None => None,
        };
        if let Some(counter) = &counter {
            let policies = static_data.counter_auth_policies(version, counter.public().name_alg)?;
            let mut trial = TrialAuthPolicy::new(counter.public().name_alg);
            trial.policy_or(&policies);
            if &counter.public().auth_policy != trial.digest() {
                return Err(KeyDataError::invalid(
                    "PCR policy counter has an unexpected authorization policy",
                ));
            }
        }

        let alg = self.policy_alg();
        let (_, expected) = compute_static_policy(
            alg,
            auth_key,
            counter.as_ref().map(|c| c.public()),
            version,
        )?;
        if expected != public.auth_policy {
            return Err(KeyDataError::invalid(
                "the sealed key object's authorization policy is inconsistent with the \
                 associated metadata or persistent TPM resources",
            ));
        }

        let policy_ref = crate::policy::compute_policy_ref(alg, version, counter.as_ref().map(|c| c.name()));
        self.dynamic_policy()
            .verify_signature(alg, auth_key, &policy_ref)?;

        match ObjectCtx::load(tpm, Handle::SRK, self.private(), public) {
            Ok(_) => {}
            Err(e) if e.is_response(ResponseCode::Integrity) => {
                return Err(KeyDataError::invalid(
                    "cannot load sealed key object into TPM: bad sealed key object or TPM owner changed",
                ))
            }
            Err(e) => return Err(e.into()),
        }
        Ok(counter)
    }
}

fn read_counter(tpm: &mut dyn Tpm, handle: Handle) -> Result<PcrPolicyCounterHandle> {
    match PcrPolicyCounterHandle::from_tpm(tpm, handle) {
        Ok(counter) => Ok(counter),
        Err(CounterError::Tpm(e)) if e.is_response(ResponseCode::Handle) => Err(
            KeyDataError::invalid(format!("PCR policy counter {} is unavailable", handle)),
        ),
        Err(CounterError::InvalidHandle(_)) | Err(CounterError::InvalidIndex(_)) => Err(
            KeyDataError::invalid(format!("invalid PCR policy counter handle {}", handle)),
        ),
        Err(e) => Err(e.into()),
    }
}
