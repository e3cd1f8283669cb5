//! The TPM as seen by the rest of the crate.
//!
//! Everything that touches hardware goes through the [`Tpm`] trait. The
//! command line drives a real device through the TSS2 ESAPI ([`device`]);
//! tests drive the software implementation in [`sim`]. Transient objects and sessions are
//! wrapped in [`ObjectCtx`] and [`SessionCtx`], which flush them when they go
//! out of scope.

use self::pcr::{PcrError, PcrSelectionList, PcrValues};
use self::types::*;
use crate::mu;
use ambassador::{delegatable_trait, Delegate};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use thiserror::Error;
use zeroize::Zeroizing;

pub mod device;
pub mod duplicate;
pub mod pcr;
pub mod sim;
pub mod types;

/// The subset of TPM response codes this crate distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// Dictionary attack lockout is active.
    Lockout,
    /// Authorization failed for a DA protected entity.
    AuthFail,
    /// Authorization failed for an entity exempt from DA protection.
    BadAuth,
    /// The policy session digest doesn't match the entity's policy.
    PolicyFail,
    Value,
    Handle,
    Hierarchy,
    Integrity,
    Signature,
    Size,
    Attributes,
    NvDefined,
    NvUninitialized,
    NvRange,
    CommandCode,
    ObjectMemory,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseCode::Lockout => "TPM_RC_LOCKOUT",
            ResponseCode::AuthFail => "TPM_RC_AUTH_FAIL",
            ResponseCode::BadAuth => "TPM_RC_BAD_AUTH",
            ResponseCode::PolicyFail => "TPM_RC_POLICY_FAIL",
            ResponseCode::Value => "TPM_RC_VALUE",
            ResponseCode::Handle => "TPM_RC_HANDLE",
            ResponseCode::Hierarchy => "TPM_RC_HIERARCHY",
            ResponseCode::Integrity => "TPM_RC_INTEGRITY",
            ResponseCode::Signature => "TPM_RC_SIGNATURE",
            ResponseCode::Size => "TPM_RC_SIZE",
            ResponseCode::Attributes => "TPM_RC_ATTRIBUTES",
            ResponseCode::NvDefined => "TPM_RC_NV_DEFINED",
            ResponseCode::NvUninitialized => "TPM_RC_NV_UNINITIALIZED",
            ResponseCode::NvRange => "TPM_RC_NV_RANGE",
            ResponseCode::CommandCode => "TPM_RC_COMMAND_CODE",
            ResponseCode::ObjectMemory => "TPM_RC_OBJECT_MEMORY",
        };
        f.write_str(s)
    }
}

impl ResponseCode {
    /// Decodes a TPM layer response code. Codes from other TSS layers, and
    /// TPM codes this crate doesn't act on, give `None`.
    pub fn from_tpm_rc(rc: u32) -> Option<Self> {
        if rc >> 16 != 0 {
            return None;
        }
        // format one codes carry the handle, session or parameter number in bits 8-11
        let code = if rc & 0x80 != 0 { 0x80 | (rc & 0x3f) } else { rc & 0x97f };
        let code = match code {
            0x082 => ResponseCode::Attributes,
            0x084 => ResponseCode::Value,
            0x085 => ResponseCode::Hierarchy,
            0x08b => ResponseCode::Handle,
            0x08e => ResponseCode::AuthFail,
            0x095 => ResponseCode::Size,
            0x099 => ResponseCode::PolicyFail,
            0x09b => ResponseCode::Signature,
            0x09f => ResponseCode::Integrity,
            0x0a2 => ResponseCode::BadAuth,
            0x143 => ResponseCode::CommandCode,
            0x146 => ResponseCode::NvRange,
            0x14a => ResponseCode::NvUninitialized,
            0x14c => ResponseCode::NvDefined,
            0x902 => ResponseCode::ObjectMemory,
            0x921 => ResponseCode::Lockout,
            _ => return None,
        };
        Some(code)
    }
}

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("TPM returned an error whilst executing command {command}: {code}")]
    Response {
        command: &'static str,
        code: ResponseCode,
    },
    #[error("TSS error whilst executing command {command}: {source}")]
    Tss {
        command: &'static str,
        #[source]
        source: tss_esapi::Error,
    },
    #[error("TPM2_{0} is not available through the TSS2 ESAPI bindings")]
    Unsupported(&'static str),
    #[error("failed to create auth session")]
    AuthSessionCreate,
    #[error("cannot access TPM state file {path}: {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse TPM state file {path}: {source}")]
    StateYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Marshal(#[from] mu::Error),
    #[error(transparent)]
    PcrError(#[from] PcrError),
}

impl TpmError {
    pub fn response(command: &'static str, code: ResponseCode) -> Self {
        TpmError::Response { command, code }
    }

    /// Wraps an ESAPI error, keeping the TPM response code where there is one
    /// this crate distinguishes.
    pub fn tss(command: &'static str, source: tss_esapi::Error) -> Self {
        if let tss_esapi::Error::TssError(rc) = &source {
            let rc = tss_esapi::tss2_esys::TSS2_RC::from(rc.clone());
            if let Some(code) = ResponseCode::from_tpm_rc(rc) {
                return TpmError::response(command, code);
            }
        }
        TpmError::Tss { command, source }
    }

    pub fn is_response(&self, want: ResponseCode) -> bool {
        matches!(self, TpmError::Response { code, .. } if *code == want)
    }

    pub fn is_auth_failure(&self) -> bool {
        self.is_response(ResponseCode::AuthFail) || self.is_response(ResponseCode::BadAuth)
    }
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

#[delegatable_trait]
pub trait FlushContext {
    fn flush_context(&mut self, handle: Handle) -> Result<()>;
}

impl<T: FlushContext + ?Sized> FlushContext for &mut T {
    fn flush_context(&mut self, handle: Handle) -> Result<()> {
        (**self).flush_context(handle)
    }
}

/// TPM commands used for sealing, unsealing and policy management.
///
/// Policy session handles come from [`Tpm::start_policy_session`]; object
/// handles from [`Tpm::load`], [`Tpm::load_external`] or
/// [`Tpm::create_primary`]. Passwords (owner authorization, object auth
/// values) are passed as plain byte slices.
pub trait Tpm: FlushContext {
    /// Whether dictionary attack lockout is in effect.
    fn in_lockout(&mut self) -> Result<bool>;

    fn read_public(&mut self, handle: Handle) -> Result<(Public, Name)>;

    fn create_primary(
        &mut self,
        hierarchy: Handle,
        hierarchy_auth: &[u8],
        template: &Public,
    ) -> Result<(Handle, Public)>;

    /// Makes the transient `object` persistent at `persistent`, using the
    /// owner hierarchy's authorization.
    fn evict_control(&mut self, owner_auth: &[u8], object: Handle, persistent: Handle)
        -> Result<()>;

    fn create(
        &mut self,
        parent: Handle,
        template: &Public,
        auth_value: &[u8],
        sensitive: &[u8],
    ) -> Result<(Private, Public)>;

    fn load(&mut self, parent: Handle, private: &Private, public: &Public) -> Result<Handle>;

    /// Loads the public part of a key, for signature verification.
    fn load_external(&mut self, public: &Public) -> Result<Handle>;

    /// Imports a duplicated object, returning its new private area under `parent`.
    fn import(
        &mut self,
        parent: Handle,
        public: &Public,
        duplicate: &Private,
        seed: &EncryptedSecret,
    ) -> Result<Private>;

    fn unseal(
        &mut self,
        item: Handle,
        session: Handle,
        auth_value: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>>;

    fn pcr_read(&mut self, selection: &PcrSelectionList) -> Result<PcrValues>;

    fn start_policy_session(&mut self, alg: HashAlg) -> Result<Handle>;

    fn session_nonce(&mut self, session: Handle) -> Result<Digest>;

    fn policy_get_digest(&mut self, session: Handle) -> Result<Digest>;

    fn policy_pcr(
        &mut self,
        session: Handle,
        pcr_digest: &Digest,
        pcrs: &PcrSelectionList,
    ) -> Result<()>;

    fn policy_or(&mut self, session: Handle, digests: &[Digest]) -> Result<()>;

    /// Asserts a comparison against the contents of NV `index`, authorized
    /// with the index's (empty) auth value.
    fn policy_nv(
        &mut self,
        index: Handle,
        session: Handle,
        operand_b: &[u8],
        offset: u16,
        operation: NvOperation,
    ) -> Result<()>;

    fn policy_auth_value(&mut self, session: Handle) -> Result<()>;

    fn policy_command_code(&mut self, session: Handle, code: CommandCode) -> Result<()>;

    fn policy_signed(
        &mut self,
        key: Handle,
        session: Handle,
        policy_ref: &[u8],
        expiration: i32,
        signature: &Signature,
    ) -> Result<()>;

    fn verify_signature(
        &mut self,
        key: Handle,
        digest: &Digest,
        signature: &Signature,
    ) -> Result<VerifiedTicket>;

    fn policy_authorize(
        &mut self,
        session: Handle,
        approved_policy: &Digest,
        policy_ref: &[u8],
        key_sign: &Name,
        ticket: &VerifiedTicket,
    ) -> Result<()>;

    fn nv_define_space(&mut self, owner_auth: &[u8], public: &NvPublic) -> Result<()>;

    /// Removes an NV index, using the owner hierarchy's authorization.
    fn nv_undefine_space(&mut self, owner_auth: &[u8], index: Handle) -> Result<()>;

    fn nv_read_public(&mut self, index: Handle) -> Result<(NvPublic, Name)>;

    /// Reads a counter index, authorized with its (empty) auth value.
    fn nv_read_counter(&mut self, index: Handle) -> Result<u64>;

    fn nv_increment(&mut self, index: Handle, session: Handle) -> Result<()>;
}

/// A loaded object, flushed on drop unless it's persistent.
#[derive(Delegate)]
#[delegate(FlushContext, target = "tpm")]
pub struct ObjectCtx<'a> {
    tpm: &'a mut dyn Tpm,
    pub handle: Handle,
}

impl<'a> ObjectCtx<'a> {
    pub fn new(tpm: &'a mut dyn Tpm, handle: Handle) -> Self {
        Self { tpm, handle }
    }

    pub fn load(
        tpm: &'a mut dyn Tpm,
        parent: Handle,
        private: &Private,
        public: &Public,
    ) -> Result<Self> {
        let handle = tpm.load(parent, private, public)?;
        Ok(Self::new(tpm, handle))
    }

    pub fn load_external(tpm: &'a mut dyn Tpm, public: &Public) -> Result<Self> {
        let handle = tpm.load_external(public)?;
        Ok(Self::new(tpm, handle))
    }
}

impl<'a> Deref for ObjectCtx<'a> {
    type Target = dyn Tpm + 'a;
    fn deref(&self) -> &Self::Target {
        &*self.tpm
    }
}

impl<'a> DerefMut for ObjectCtx<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.tpm
    }
}

impl Drop for ObjectCtx<'_> {
    fn drop(&mut self) {
        if self.handle.handle_type() == Handle::TYPE_TRANSIENT {
            let handle = self.handle;
            self.flush_context(handle).ok();
        }
    }
}

/// A policy session, flushed on drop.
#[derive(Delegate)]
#[delegate(FlushContext, target = "tpm")]
pub struct SessionCtx<'a> {
    tpm: &'a mut dyn Tpm,
    pub session: Handle,
}

impl<'a> SessionCtx<'a> {
    pub fn start(tpm: &'a mut dyn Tpm, alg: HashAlg) -> Result<Self> {
        let session = tpm.start_policy_session(alg)?;
        log::debug!("started policy session {}", session);
        Ok(Self { tpm, session })
    }
}

impl<'a> Deref for SessionCtx<'a> {
    type Target = dyn Tpm + 'a;
    fn deref(&self) -> &Self::Target {
        &*self.tpm
    }
}

impl<'a> DerefMut for SessionCtx<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.tpm
    }
}

impl Drop for SessionCtx<'_> {
    fn drop(&mut self) {
        let session = self.session;
        self.flush_context(session).ok();
    }
}

/// Template of the storage root key: a restricted P-256 decryption key.
pub fn srk_template() -> Public {
    Public {
        name_alg: HashAlg::Sha256,
        attributes: ObjectAttributes::FIXED_TPM
            | ObjectAttributes::FIXED_PARENT
            | ObjectAttributes::SENSITIVE_DATA_ORIGIN
            | ObjectAttributes::USER_WITH_AUTH
            | ObjectAttributes::NO_DA
            | ObjectAttributes::RESTRICTED
            | ObjectAttributes::DECRYPT,
        auth_policy: Digest::default(),
        params: PublicParams::Ecc {
            x: Vec::new(),
            y: Vec::new(),
        },
    }
}

/// Returns the public area of the storage root key, creating and persisting
/// it at [`Handle::SRK`] first if it doesn't exist.
pub fn get_or_create_srk(tpm: &mut dyn Tpm, owner_auth: &[u8]) -> Result<Public> {
    match tpm.read_public(Handle::SRK) {
        Ok((public, _)) => return Ok(public),
        Err(e) if e.is_response(ResponseCode::Handle) => {}
        Err(e) => return Err(e),
    }
    let (handle, public) = tpm.create_primary(Handle::OWNER, owner_auth, &srk_template())?;
    let mut transient = ObjectCtx::new(tpm, handle);
    transient.evict_control(owner_auth, handle, Handle::SRK)?;
    log::info!("Created storage root key at {:#010x}", Handle::SRK.0);
    Ok(public)
}

#[cfg(test)]
mod tests {
    use super::sim::Simulator;
    use super::*;
    use eyre::Result;

    #[test]
    fn srk_is_created_once() -> Result<()> {
        let mut tpm = Simulator::new();
        let first = get_or_create_srk(&mut tpm, b"")?;
        assert!(first.is_storage_parent());
        assert_eq!(tpm.transient_count(), 0);
        let second = get_or_create_srk(&mut tpm, b"")?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn srk_needs_owner_auth() {
        let mut tpm = Simulator::new();
        tpm.set_owner_auth(b"secret");
        let err = get_or_create_srk(&mut tpm, b"")
            .err()
            .map(|e| e.is_response(ResponseCode::BadAuth));
        assert_eq!(err, Some(true));
    }

    #[test]
    fn tpm_response_codes() {
        // TPM_RC_AUTH_FAIL for session 1
        assert_eq!(ResponseCode::from_tpm_rc(0x98e), Some(ResponseCode::AuthFail));
        // TPM_RC_HANDLE for handle 1, from ReadPublic of a missing persistent object
        assert_eq!(ResponseCode::from_tpm_rc(0x18b), Some(ResponseCode::Handle));
        assert_eq!(ResponseCode::from_tpm_rc(0x9a2), Some(ResponseCode::BadAuth));
        assert_eq!(ResponseCode::from_tpm_rc(0x921), Some(ResponseCode::Lockout));
        assert_eq!(ResponseCode::from_tpm_rc(0x14c), Some(ResponseCode::NvDefined));
        // TPM_RC_INITIALIZE isn't distinguished
        assert_eq!(ResponseCode::from_tpm_rc(0x100), None);
        // an ESAPI layer code
        assert_eq!(ResponseCode::from_tpm_rc(0x0007_000b), None);
    }

    #[test]
    fn session_is_flushed_on_drop() -> Result<()> {
        let mut tpm = Simulator::new();
        {
            let session = SessionCtx::start(&mut tpm, HashAlg::Sha256)?;
            assert_eq!(session.session.handle_type(), Handle::TYPE_POLICY_SESSION);
        }
        assert_eq!(tpm.session_count(), 0);
        Ok(())
    }
}
