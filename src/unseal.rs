//! Unsealing a key from the TPM.
//!
//! The steps are chained as states of a [`Ctx`], in the order the TPM needs
//! them: a policy session is opened, the key's policy is asserted in it, and
//! only then is the sealed object loaded and unsealed. The session and the
//! object are flushed when the context is dropped, whatever state it is in.

use crate::keydata::{KeyDataError, SealedKeyObject};
use crate::policy::execute_policy_session;
use crate::tpm::types::Handle;
use crate::tpm::{get_or_create_srk, ObjectCtx, ResponseCode, SessionCtx, Tpm, TpmError};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum UnsealError {
    #[error("the TPM is in DA lockout mode")]
    Lockout,
    #[error("the TPM is not correctly provisioned")]
    Provisioning,
    #[error("invalid key data file: {0}")]
    InvalidKeyData(#[source] KeyDataError),
    #[error("the provided PIN is incorrect")]
    PinFail,
    #[error(transparent)]
    Tpm(#[from] TpmError),
}

impl UnsealError {
    fn invalid(msg: &str) -> Self {
        UnsealError::InvalidKeyData(KeyDataError::invalid(msg))
    }
}

pub type Result<T, E = UnsealError> = core::result::Result<T, E>;

pub struct Ctx<'k, C, S: UnsealState> {
    ctx: C,
    key: &'k SealedKeyObject,
    #[allow(dead_code)]
    state: S,
}

pub struct Start;
pub struct SessionOpen;
pub struct PolicyAsserted;

pub trait UnsealState {}
impl UnsealState for Start {}
impl UnsealState for SessionOpen {}
impl UnsealState for PolicyAsserted {}

pub type StartContext<'a, 'k> = Ctx<'k, &'a mut dyn Tpm, Start>;
pub type SessionOpenContext<'a, 'k> = Ctx<'k, SessionCtx<'a>, SessionOpen>;
pub type PolicyAssertedContext<'a, 'k> = Ctx<'k, SessionCtx<'a>, PolicyAsserted>;

impl<'a, 'k> StartContext<'a, 'k> {
    pub fn new(tpm: &'a mut dyn Tpm, key: &'k SealedKeyObject) -> Self {
        Self {
            ctx: tpm,
            key,
            state: Start,
        }
    }

    /// Checks that the TPM can unseal at all, then starts the policy session.
    pub fn start_session(mut self) -> Result<SessionOpenContext<'a, 'k>> {
        let data = self.key.data();
        if data.is_importable() {
            return Err(UnsealError::InvalidKeyData(KeyDataError::Importable));
        }
        if self.ctx.in_lockout()? {
            return Err(UnsealError::Lockout);
        }
        // a missing storage root key can be recreated if the owner hasn't set
        // an authorization value, and it comes back identical
        match get_or_create_srk(&mut *self.ctx, b"") {
            Ok(srk) if srk.is_storage_parent() => {}
            Ok(_) => return Err(UnsealError::Provisioning),
            Err(e) if e.is_auth_failure() => return Err(UnsealError::Provisioning),
            Err(e) => return Err(e.into()),
        }

        let session = SessionCtx::start(self.ctx, data.policy_alg())?;
        Ok(Ctx {
            ctx: session,
            key: self.key,
            state: SessionOpen,
        })
    }
}

impl<'a, 'k> SessionOpenContext<'a, 'k> {
    pub fn assert_policy(mut self) -> Result<PolicyAssertedContext<'a, 'k>> {
        let data = self.key.data();
        let session = self.ctx.session;
        execute_policy_session(
            &mut *self.ctx,
            session,
            data.policy_alg(),
            data.version(),
            data.static_policy(),
            data.dynamic_policy(),
        )
        .map_err(|e| UnsealError::InvalidKeyData(e.into()))?;
        Ok(Ctx {
            ctx: self.ctx,
            key: self.key,
            state: PolicyAsserted,
        })
    }
}

impl<'a, 'k> PolicyAssertedContext<'a, 'k> {
    /// Loads the sealed object under the storage root key and unseals it
    /// with the asserted session. `pin` is the object's auth value.
    pub fn unseal(mut self, pin: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let data = self.key.data();
        let session = self.ctx.session;
        let mut item = match ObjectCtx::load(&mut *self.ctx, Handle::SRK, data.private(), data.public()) {
            Ok(item) => item,
            Err(e) if e.is_response(ResponseCode::Integrity) => {
                return Err(UnsealError::invalid(
                    "cannot load sealed key object into TPM: bad sealed key object or TPM owner changed",
                ))
            }
            Err(e) if e.is_response(ResponseCode::Handle) => return Err(UnsealError::Provisioning),
            Err(e) => return Err(e.into()),
        };
        let handle = item.handle;
        match item.unseal(handle, session, pin) {
            Ok(secret) => Ok(secret),
            Err(e) if e.is_response(ResponseCode::Lockout) => Err(UnsealError::Lockout),
            Err(e) if e.is_auth_failure() => Err(UnsealError::PinFail),
            Err(e) if e.is_response(ResponseCode::PolicyFail) => Err(UnsealError::invalid(
                "the authorization policy check failed during unsealing",
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl SealedKeyObject {
    /// Unseals the key with the TPM's current PCR values. `pin` is empty for
    /// keys sealed without one.
    pub fn unseal_from_tpm(&self, tpm: &mut dyn Tpm, pin: &str) -> Result<Zeroizing<Vec<u8>>> {
        StartContext::new(tpm, self)
            .start_session()?
            .assert_policy()?
            .unseal(pin.as_bytes())
    }
}
