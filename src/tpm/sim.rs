//! A software TPM for tests.
//!
//! Implements the commands in [`Tpm`] with the same policy semantics as a
//! hardware device, plus the hooks tests need: PCR extension, dictionary
//! attack configuration and saving the persistent state to a YAML file. Keys
//! are derived from a random per-instance seed, so objects created by one
//! simulator can't be loaded by another. The saved state holds that seed in
//! the clear; it protects nothing.

use super::duplicate::{unwrap_duplication_object, ProtectionKeys, Sensitive};
use super::pcr::{PcrSelectionList, PcrValues, MAX_PCR};
use super::types::*;
use super::{FlushContext, ResponseCode, Result, Tpm, TpmError};
use crate::mu;
use crate::policy::trial::TrialAuthPolicy;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::SecretKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

const DEFAULT_MAX_TRIES: u32 = 32;
const TRANSIENT_FIRST: u32 = 0x8000_0000;
const SESSION_FIRST: u32 = 0x0300_0000;

#[derive(Clone, Serialize, Deserialize)]
enum ObjectSecret {
    /// Sealed data, in marshalled [`Sensitive`] form.
    Sealed(#[serde(with = "hex")] Vec<u8>),
    /// Private scalar of an ECC key.
    Ecc(#[serde(with = "hex")] Vec<u8>),
    /// Public key only, from LoadExternal.
    None,
}

#[derive(Clone, Serialize, Deserialize)]
struct Object {
    public: Public,
    secret: ObjectSecret,
}

impl Object {
    fn ecc_secret(&self) -> Option<SecretKey> {
        match &self.secret {
            ObjectSecret::Ecc(scalar) => SecretKey::from_slice(scalar).ok(),
            _ => None,
        }
    }

    fn sensitive(&self) -> Option<Sensitive> {
        match &self.secret {
            ObjectSecret::Sealed(bytes) => mu::unmarshal_from_bytes("Sensitive", bytes).ok(),
            _ => None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct NvIndex {
    public: NvPublic,
    value: Option<u64>,
}

impl NvIndex {
    fn current_public(&self) -> NvPublic {
        let mut public = self.public.clone();
        if self.value.is_some() {
            public.attributes = public.attributes | NvAttributes::WRITTEN;
        }
        public
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct DictionaryAttack {
    failed_tries: u32,
    max_tries: u32,
}

struct Session {
    policy: TrialAuthPolicy,
    nonce: Digest,
    auth_value_needed: bool,
    command_code: Option<CommandCode>,
}

impl Session {
    fn new(alg: HashAlg) -> Self {
        let mut nonce = vec![0u8; alg.size()];
        OsRng.fill_bytes(&mut nonce);
        Self {
            policy: TrialAuthPolicy::new(alg),
            nonce: Digest::new(nonce),
            auth_value_needed: false,
            command_code: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct Simulator {
    #[serde(with = "hex")]
    seed: Vec<u8>,
    #[serde(with = "hex")]
    owner_auth: Vec<u8>,
    pcrs: PcrValues,
    persistent: BTreeMap<u32, Object>,
    nv: BTreeMap<u32, NvIndex>,
    dictionary_attack: DictionaryAttack,
    #[serde(skip)]
    transient: BTreeMap<u32, Object>,
    #[serde(skip)]
    sessions: BTreeMap<u32, Session>,
    #[serde(skip)]
    next_handle: u32,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        let mut seed = vec![0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let mut pcrs = PcrValues::default();
        for pcr in 0..=MAX_PCR {
            pcrs.set(HashAlg::Sha256, pcr, HashAlg::Sha256.zero_digest());
        }
        Self {
            seed,
            owner_auth: Vec::new(),
            pcrs,
            persistent: BTreeMap::new(),
            nv: BTreeMap::new(),
            dictionary_attack: DictionaryAttack {
                failed_tries: 0,
                max_tries: DEFAULT_MAX_TRIES,
            },
            transient: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_handle: 0,
        }
    }

    /// Loads state saved with [`Simulator::save`], or starts afresh if
    /// `path` doesn't exist.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("Creating new TPM state at {}", path.display());
            return Ok(Self::new());
        }
        let state = fs::read_to_string(path).map_err(|source| TpmError::StateIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&state).map_err(|source| TpmError::StateYaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let io_error = |source| TpmError::StateIo {
            path: path.to_path_buf(),
            source,
        };
        let state = serde_yaml::to_string(self).map_err(|source| TpmError::StateYaml {
            path: path.to_path_buf(),
            source,
        })?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
        std::io::Write::write_all(&mut file, state.as_bytes()).map_err(io_error)?;
        file.persist(path).map_err(|e| io_error(e.error))?;
        Ok(())
    }

    /// Extends a PCR in the SHA-256 bank with `digest`.
    pub fn pcr_extend(&mut self, bank: HashAlg, pcr: u8, digest: &Digest) -> Result<()> {
        if digest.len() != bank.size() {
            return Err(TpmError::response("PCR_Extend", ResponseCode::Size));
        }
        let old = self
            .pcrs
            .get(bank, pcr)
            .cloned()
            .ok_or_else(|| TpmError::response("PCR_Extend", ResponseCode::Value))?;
        self.pcrs.set(bank, pcr, bank.hash(&[&old, digest]));
        Ok(())
    }

    /// Measures `event` into a PCR, as firmware does.
    pub fn pcr_event(&mut self, pcr: u8, event: &[u8]) -> Result<()> {
        self.pcr_extend(HashAlg::Sha256, pcr, &HashAlg::Sha256.hash(&[event]))
    }

    /// Sets the number of authorization failures tolerated before lockout.
    /// Zero puts the TPM straight into lockout.
    pub fn set_dictionary_attack_parameters(&mut self, max_tries: u32) {
        self.dictionary_attack.max_tries = max_tries;
    }

    pub fn dictionary_attack_lock_reset(&mut self) {
        self.dictionary_attack.failed_tries = 0;
    }

    pub fn failed_tries(&self) -> u32 {
        self.dictionary_attack.failed_tries
    }

    pub fn set_owner_auth(&mut self, auth: &[u8]) {
        self.owner_auth = auth.to_vec();
    }

    /// Removes a persistent object, as an owner would with EvictControl.
    pub fn evict_persistent(&mut self, handle: Handle) -> Result<()> {
        self.persistent
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| TpmError::response("EvictControl", ResponseCode::Handle))
    }

    pub fn transient_count(&self) -> usize {
        self.transient.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn allocate(&mut self, first: u32) -> u32 {
        self.next_handle = self.next_handle.wrapping_add(1) & 0x00ff_ffff;
        first | self.next_handle
    }

    fn proof(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(HashAlg::Sha256.hash(&[b"PROOF\0", &self.seed]).into_inner())
    }

    fn in_lockout_mode(&self) -> bool {
        self.dictionary_attack.failed_tries >= self.dictionary_attack.max_tries
    }

    fn check_owner_auth(&mut self, command: &'static str, auth: &[u8]) -> Result<()> {
        // owner authorization is DA protected only by lockout, which this ignores
        if auth != self.owner_auth.as_slice() {
            return Err(TpmError::response(command, ResponseCode::BadAuth));
        }
        Ok(())
    }

    fn object(&self, command: &'static str, handle: Handle) -> Result<&Object> {
        let object = match handle.handle_type() {
            Handle::TYPE_TRANSIENT => self.transient.get(&handle.0),
            Handle::TYPE_PERSISTENT => self.persistent.get(&handle.0),
            _ => None,
        };
        object.ok_or_else(|| TpmError::response(command, ResponseCode::Handle))
    }

    fn storage_keys(&self, command: &'static str, parent: Handle) -> Result<(ProtectionKeys, SecretKey)> {
        let parent = self.object(command, parent)?;
        let secret = parent
            .ecc_secret()
            .filter(|_| parent.public.is_storage_parent())
            .ok_or_else(|| TpmError::response(command, ResponseCode::Handle))?;
        Ok((ProtectionKeys::derive(&secret.to_bytes()), secret))
    }

    fn session(&mut self, command: &'static str, handle: Handle) -> Result<&mut Session> {
        self.sessions
            .get_mut(&handle.0)
            .ok_or_else(|| TpmError::response(command, ResponseCode::Handle))
    }

    fn check_policy_session(
        &mut self,
        command: &'static str,
        session: Handle,
        auth_policy: &Digest,
        code: CommandCode,
    ) -> Result<bool> {
        let s = self.session(command, session)?;
        if s.policy.digest() != auth_policy {
            return Err(TpmError::response(command, ResponseCode::PolicyFail));
        }
        if matches!(s.command_code, Some(c) if c != code) {
            return Err(TpmError::response(command, ResponseCode::PolicyFail));
        }
        let auth_value_needed = s.auth_value_needed;
        // a policy session is reset once it has been used for authorization
        *s = Session::new(s.policy.alg());
        Ok(auth_value_needed)
    }

    fn ticket_digest(&self, digest: &[u8], key_name: &Name) -> Digest {
        let proof = self.proof();
        let mut key = Zeroizing::new([0u8; 64]);
        key[..proof.len()].copy_from_slice(&proof);
        let mut mac = <Hmac<Sha256> as KeyInit>::new(
            hmac::digest::generic_array::GenericArray::from_slice(&key[..]),
        );
        mac.update(digest);
        mac.update(key_name);
        Digest::new(mac.finalize().into_bytes().to_vec())
    }
}

impl FlushContext for Simulator {
    fn flush_context(&mut self, handle: Handle) -> Result<()> {
        let removed = match handle.handle_type() {
            Handle::TYPE_TRANSIENT => self.transient.remove(&handle.0).is_some(),
            Handle::TYPE_POLICY_SESSION => self.sessions.remove(&handle.0).is_some(),
            _ => false,
        };
        if !removed {
            return Err(TpmError::response("FlushContext", ResponseCode::Handle));
        }
        Ok(())
    }
}

impl Tpm for Simulator {
    fn in_lockout(&mut self) -> Result<bool> {
        Ok(self.in_lockout_mode())
    }

    fn read_public(&mut self, handle: Handle) -> Result<(Public, Name)> {
        let public = self.object("ReadPublic", handle)?.public.clone();
        let name = public.name()?;
        Ok((public, name))
    }

    fn create_primary(
        &mut self,
        hierarchy: Handle,
        hierarchy_auth: &[u8],
        template: &Public,
    ) -> Result<(Handle, Public)> {
        const CC: &str = "CreatePrimary";
        if hierarchy != Handle::OWNER {
            return Err(TpmError::response(CC, ResponseCode::Hierarchy));
        }
        self.check_owner_auth(CC, hierarchy_auth)?;
        if !template.is_ecc() {
            return Err(TpmError::response(CC, ResponseCode::Attributes));
        }
        // primaries are a deterministic function of the hierarchy seed and the template
        let template_bytes = mu::marshal_to_vec(template)?;
        let mut counter = 0u32;
        let secret = loop {
            let scalar = HashAlg::Sha256.hash(&[
                b"PRIMARY\0",
                &self.seed,
                &template_bytes,
                &counter.to_be_bytes(),
            ]);
            if let Ok(secret) = SecretKey::from_slice(&scalar) {
                break secret;
            }
            counter += 1;
        };
        let public = template.clone().with_ecc_point(&secret.public_key());
        let handle = Handle(self.allocate(TRANSIENT_FIRST));
        self.transient.insert(
            handle.0,
            Object {
                public: public.clone(),
                secret: ObjectSecret::Ecc(secret.to_bytes().to_vec()),
            },
        );
        Ok((handle, public))
    }

    fn evict_control(&mut self, owner_auth: &[u8], object: Handle, persistent: Handle) -> Result<()> {
        const CC: &str = "EvictControl";
        self.check_owner_auth(CC, owner_auth)?;
        if persistent.handle_type() != Handle::TYPE_PERSISTENT {
            return Err(TpmError::response(CC, ResponseCode::Value));
        }
        if self.persistent.contains_key(&persistent.0) {
            return Err(TpmError::response(CC, ResponseCode::NvDefined));
        }
        let copy = self.object(CC, object)?.clone();
        self.persistent.insert(persistent.0, copy);
        Ok(())
    }

    fn create(
        &mut self,
        parent: Handle,
        template: &Public,
        auth_value: &[u8],
        sensitive: &[u8],
    ) -> Result<(Private, Public)> {
        const CC: &str = "Create";
        let (keys, _) = self.storage_keys(CC, parent)?;
        if !template.is_sealed_object() {
            return Err(TpmError::response(CC, ResponseCode::Attributes));
        }
        if auth_value.len() > template.name_alg.size() {
            return Err(TpmError::response(CC, ResponseCode::Size));
        }
        let sensitive = Sensitive::sealed(template.name_alg, auth_value, sensitive);
        let mut public = template.clone();
        public.params = PublicParams::KeyedHash {
            unique: sensitive.unique(template.name_alg),
        };
        let private = keys.protect(&public.name()?, &sensitive.to_bytes()?);
        Ok((private, public))
    }

    fn load(&mut self, parent: Handle, private: &Private, public: &Public) -> Result<Handle> {
        const CC: &str = "Load";
        let (keys, _) = self.storage_keys(CC, parent)?;
        let plaintext = keys
            .unprotect(&public.name()?, private)
            .ok_or_else(|| TpmError::response(CC, ResponseCode::Integrity))?;
        let sensitive: Sensitive = mu::unmarshal_from_bytes("Sensitive", &plaintext)?;
        match &public.params {
            PublicParams::KeyedHash { unique } if *unique == sensitive.unique(public.name_alg) => {}
            _ => return Err(TpmError::response(CC, ResponseCode::Integrity)),
        }
        let handle = Handle(self.allocate(TRANSIENT_FIRST));
        self.transient.insert(
            handle.0,
            Object {
                public: public.clone(),
                secret: ObjectSecret::Sealed(plaintext.to_vec()),
            },
        );
        Ok(handle)
    }

    fn load_external(&mut self, public: &Public) -> Result<Handle> {
        if public.verifying_key().is_none() {
            return Err(TpmError::response("LoadExternal", ResponseCode::Value));
        }
        let handle = Handle(self.allocate(TRANSIENT_FIRST));
        self.transient.insert(
            handle.0,
            Object {
                public: public.clone(),
                secret: ObjectSecret::None,
            },
        );
        Ok(handle)
    }

    fn import(
        &mut self,
        parent: Handle,
        public: &Public,
        duplicate: &Private,
        seed: &EncryptedSecret,
    ) -> Result<Private> {
        const CC: &str = "Import";
        let (keys, secret) = self.storage_keys(CC, parent)?;
        if public
            .attributes
            .contains(ObjectAttributes::FIXED_TPM)
            || public.attributes.contains(ObjectAttributes::FIXED_PARENT)
        {
            return Err(TpmError::response(CC, ResponseCode::Attributes));
        }
        let sensitive = unwrap_duplication_object(&secret, public, duplicate, seed)?;
        Ok(keys.protect(&public.name()?, &sensitive.to_bytes()?))
    }

    fn unseal(&mut self, item: Handle, session: Handle, auth_value: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        const CC: &str = "Unseal";
        let object = self.object(CC, item)?.clone();
        let da_protected = !object.public.attributes.contains(ObjectAttributes::NO_DA);
        if da_protected && self.in_lockout_mode() {
            return Err(TpmError::response(CC, ResponseCode::Lockout));
        }
        let sensitive = object
            .sensitive()
            .ok_or_else(|| TpmError::response(CC, ResponseCode::Attributes))?;
        let auth_value_needed =
            self.check_policy_session(CC, session, &object.public.auth_policy, CommandCode::UNSEAL)?;
        if auth_value_needed && auth_value != sensitive.auth_value.as_slice() {
            if da_protected {
                self.dictionary_attack.failed_tries += 1;
                return Err(TpmError::response(CC, ResponseCode::AuthFail));
            }
            return Err(TpmError::response(CC, ResponseCode::BadAuth));
        }
        Ok(Zeroizing::new(sensitive.data.clone()))
    }

    fn pcr_read(&mut self, selection: &PcrSelectionList) -> Result<PcrValues> {
        let mut values = PcrValues::default();
        for s in selection.selections() {
            for pcr in &s.pcrs {
                let value = self
                    .pcrs
                    .get(s.hash, *pcr)
                    .ok_or_else(|| TpmError::response("PCR_Read", ResponseCode::Value))?;
                values.set(s.hash, *pcr, value.clone());
            }
        }
        Ok(values)
    }

    fn start_policy_session(&mut self, alg: HashAlg) -> Result<Handle> {
        let handle = Handle(self.allocate(SESSION_FIRST));
        self.sessions.insert(handle.0, Session::new(alg));
        Ok(handle)
    }

    fn session_nonce(&mut self, session: Handle) -> Result<Digest> {
        Ok(self.session("GetSessionAuditDigest", session)?.nonce.clone())
    }

    fn policy_get_digest(&mut self, session: Handle) -> Result<Digest> {
        Ok(self.session("PolicyGetDigest", session)?.policy.digest().clone())
    }

    fn policy_pcr(&mut self, session: Handle, pcr_digest: &Digest, pcrs: &PcrSelectionList) -> Result<()> {
        const CC: &str = "PolicyPCR";
        let alg = self.session(CC, session)?.policy.alg();
        let values = self.pcr_read(pcrs)?;
        let actual = values.composite_digest(alg, pcrs)?;
        if !pcr_digest.is_empty() && *pcr_digest != actual {
            return Err(TpmError::response(CC, ResponseCode::Value));
        }
        self.session(CC, session)?.policy.policy_pcr(&actual, pcrs)?;
        Ok(())
    }

    fn policy_or(&mut self, session: Handle, digests: &[Digest]) -> Result<()> {
        const CC: &str = "PolicyOR";
        let s = self.session(CC, session)?;
        if digests.len() < 2 || digests.len() > 8 {
            return Err(TpmError::response(CC, ResponseCode::Size));
        }
        if !digests.contains(s.policy.digest()) {
            return Err(TpmError::response(CC, ResponseCode::Value));
        }
        s.policy.policy_or(digests);
        Ok(())
    }

    fn policy_nv(
        &mut self,
        index: Handle,
        session: Handle,
        operand_b: &[u8],
        offset: u16,
        operation: NvOperation,
    ) -> Result<()> {
        const CC: &str = "PolicyNV";
        let nv = self
            .nv
            .get(&index.0)
            .ok_or_else(|| TpmError::response(CC, ResponseCode::Handle))?;
        if !nv.public.attributes.contains(NvAttributes::AUTHREAD) {
            return Err(TpmError::response(CC, ResponseCode::Attributes));
        }
        let value = nv
            .value
            .ok_or_else(|| TpmError::response(CC, ResponseCode::NvUninitialized))?
            .to_be_bytes();
        let start = offset as usize;
        let end = start + operand_b.len();
        if end > value.len() {
            return Err(TpmError::response(CC, ResponseCode::NvRange));
        }
        let name = nv.current_public().name()?;
        if !operation.compare(&value[start..end], operand_b) {
            return Err(TpmError::response(CC, ResponseCode::PolicyFail));
        }
        self.session(CC, session)?
            .policy
            .policy_nv(operand_b, offset, operation, &name);
        Ok(())
    }

    fn policy_auth_value(&mut self, session: Handle) -> Result<()> {
        let s = self.session("PolicyAuthValue", session)?;
        s.auth_value_needed = true;
        s.policy.policy_auth_value();
        Ok(())
    }

    fn policy_command_code(&mut self, session: Handle, code: CommandCode) -> Result<()> {
        const CC: &str = "PolicyCommandCode";
        let s = self.session(CC, session)?;
        if matches!(s.command_code, Some(c) if c != code) {
            return Err(TpmError::response(CC, ResponseCode::Value));
        }
        s.command_code = Some(code);
        s.policy.policy_command_code(code);
        Ok(())
    }

    fn policy_signed(
        &mut self,
        key: Handle,
        session: Handle,
        policy_ref: &[u8],
        expiration: i32,
        signature: &Signature,
    ) -> Result<()> {
        const CC: &str = "PolicySigned";
        let public = self.object(CC, key)?.public.clone();
        let verifying_key = public
            .verifying_key()
            .ok_or_else(|| TpmError::response(CC, ResponseCode::Attributes))?;
        let nonce = self.session(CC, session)?.nonce.clone();
        let a_hash = HashAlg::Sha256.hash(&[&nonce, &expiration.to_be_bytes(), policy_ref]);
        let sig = signature
            .to_p256()
            .ok_or_else(|| TpmError::response(CC, ResponseCode::Signature))?;
        verifying_key
            .verify_prehash(&a_hash, &sig)
            .map_err(|_| TpmError::response(CC, ResponseCode::Signature))?;
        let name = public.name()?;
        self.session(CC, session)?.policy.policy_signed(&name, policy_ref);
        Ok(())
    }

    fn verify_signature(&mut self, key: Handle, digest: &Digest, signature: &Signature) -> Result<VerifiedTicket> {
        const CC: &str = "VerifySignature";
        let public = self.object(CC, key)?.public.clone();
        let verifying_key = public
            .verifying_key()
            .ok_or_else(|| TpmError::response(CC, ResponseCode::Attributes))?;
        let sig = signature
            .to_p256()
            .ok_or_else(|| TpmError::response(CC, ResponseCode::Signature))?;
        verifying_key
            .verify_prehash(digest, &sig)
            .map_err(|_| TpmError::response(CC, ResponseCode::Signature))?;
        Ok(VerifiedTicket {
            hierarchy: Handle::OWNER,
            digest: self.ticket_digest(digest, &public.name()?),
        })
    }

    fn policy_authorize(
        &mut self,
        session: Handle,
        approved_policy: &Digest,
        policy_ref: &[u8],
        key_sign: &Name,
        ticket: &VerifiedTicket,
    ) -> Result<()> {
        const CC: &str = "PolicyAuthorize";
        let alg = self.session(CC, session)?.policy.alg();
        let a_hash = alg.hash(&[approved_policy, policy_ref]);
        if ticket.digest != self.ticket_digest(&a_hash, key_sign) {
            return Err(TpmError::response(CC, ResponseCode::PolicyFail));
        }
        let s = self.session(CC, session)?;
        if s.policy.digest() != approved_policy {
            return Err(TpmError::response(CC, ResponseCode::Value));
        }
        s.policy.policy_authorize(policy_ref, key_sign);
        Ok(())
    }

    fn nv_define_space(&mut self, owner_auth: &[u8], public: &NvPublic) -> Result<()> {
        const CC: &str = "NV_DefineSpace";
        self.check_owner_auth(CC, owner_auth)?;
        if public.index.handle_type() != Handle::TYPE_NV_INDEX
            || public.attributes.contains(NvAttributes::WRITTEN)
        {
            return Err(TpmError::response(CC, ResponseCode::Attributes));
        }
        if self.nv.contains_key(&public.index.0) {
            return Err(TpmError::response(CC, ResponseCode::NvDefined));
        }
        self.nv.insert(
            public.index.0,
            NvIndex {
                public: public.clone(),
                value: None,
            },
        );
        Ok(())
    }

    fn nv_undefine_space(&mut self, owner_auth: &[u8], index: Handle) -> Result<()> {
        const CC: &str = "NV_UndefineSpace";
        self.check_owner_auth(CC, owner_auth)?;
        self.nv
            .remove(&index.0)
            .map(|_| ())
            .ok_or_else(|| TpmError::response(CC, ResponseCode::Handle))
    }

    fn nv_read_public(&mut self, index: Handle) -> Result<(NvPublic, Name)> {
        let public = self
            .nv
            .get(&index.0)
            .ok_or_else(|| TpmError::response("NV_ReadPublic", ResponseCode::Handle))?
            .current_public();
        let name = public.name()?;
        Ok((public, name))
    }

    fn nv_read_counter(&mut self, index: Handle) -> Result<u64> {
        const CC: &str = "NV_Read";
        let nv = self
            .nv
            .get(&index.0)
            .ok_or_else(|| TpmError::response(CC, ResponseCode::Handle))?;
        if !nv.public.attributes.contains(NvAttributes::AUTHREAD) {
            return Err(TpmError::response(CC, ResponseCode::Attributes));
        }
        nv.value
            .ok_or_else(|| TpmError::response(CC, ResponseCode::NvUninitialized))
    }

    fn nv_increment(&mut self, index: Handle, session: Handle) -> Result<()> {
        const CC: &str = "NV_Increment";
        let public = self
            .nv
            .get(&index.0)
            .ok_or_else(|| TpmError::response(CC, ResponseCode::Handle))?
            .public
            .clone();
        if !public
            .attributes
            .contains(NvAttributes::TYPE_COUNTER | NvAttributes::POLICYWRITE)
        {
            return Err(TpmError::response(CC, ResponseCode::Attributes));
        }
        self.check_policy_session(CC, session, &public.auth_policy, CommandCode::NV_INCREMENT)?;
        if let Some(nv) = self.nv.get_mut(&index.0) {
            nv.value = Some(nv.value.map_or(1, |v| v.saturating_add(1)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::pcr::parse_pcr_selection_list;
    use crate::tpm::{get_or_create_srk, srk_template};
    use eyre::Result;

    #[test]
    fn primary_is_deterministic() -> Result<()> {
        let mut tpm = Simulator::new();
        let (a, first) = tpm.create_primary(Handle::OWNER, b"", &srk_template())?;
        let (b, second) = tpm.create_primary(Handle::OWNER, b"", &srk_template())?;
        assert_ne!(a, b);
        assert_eq!(first, second);
        tpm.flush_context(a)?;
        tpm.flush_context(b)?;
        assert!(tpm.flush_context(b).is_err());
        Ok(())
    }

    #[test]
    fn sealed_object_needs_policy() -> Result<()> {
        let mut tpm = Simulator::new();
        get_or_create_srk(&mut tpm, b"")?;
        let mut trial = TrialAuthPolicy::new(HashAlg::Sha256);
        trial.policy_auth_value();
        let template = Public::sealed_object(HashAlg::Sha256, trial.into_digest(), true);
        let (private, public) = tpm.create(Handle::SRK, &template, b"1234", b"secret")?;
        let item = tpm.load(Handle::SRK, &private, &public)?;

        let session = tpm.start_policy_session(HashAlg::Sha256)?;
        let err = tpm.unseal(item, session, b"1234").err();
        assert!(err.map(|e| e.is_response(ResponseCode::PolicyFail)).unwrap_or(false));

        tpm.policy_auth_value(session)?;
        let err = tpm.unseal(item, session, b"0000").err();
        assert!(err.map(|e| e.is_response(ResponseCode::AuthFail)).unwrap_or(false));
        assert_eq!(tpm.failed_tries(), 1);

        tpm.policy_auth_value(session)?;
        assert_eq!(tpm.unseal(item, session, b"1234")?.as_slice(), b"secret");
        Ok(())
    }

    #[test]
    fn private_area_is_bound_to_public_area() -> Result<()> {
        let mut tpm = Simulator::new();
        get_or_create_srk(&mut tpm, b"")?;
        let template = Public::sealed_object(HashAlg::Sha256, Digest::default(), false);
        let (private, public) = tpm.create(Handle::SRK, &template, b"", b"secret")?;
        let mut other = public.clone();
        other.auth_policy = HashAlg::Sha256.zero_digest();
        let err = tpm.load(Handle::SRK, &private, &other).err();
        assert!(err.map(|e| e.is_response(ResponseCode::Integrity)).unwrap_or(false));
        Ok(())
    }

    #[test]
    fn policy_pcr_follows_extends() -> Result<()> {
        let mut tpm = Simulator::new();
        let selection = parse_pcr_selection_list("sha256:7")?;
        let before = tpm.pcr_read(&selection)?.composite_digest(HashAlg::Sha256, &selection)?;
        tpm.pcr_event(7, b"shim")?;
        let session = tpm.start_policy_session(HashAlg::Sha256)?;
        let err = tpm.policy_pcr(session, &before, &selection).err();
        assert!(err.map(|e| e.is_response(ResponseCode::Value)).unwrap_or(false));
        tpm.policy_pcr(session, &Digest::default(), &selection)?;
        Ok(())
    }

    #[test]
    fn lockout_with_no_tries() -> Result<()> {
        let mut tpm = Simulator::new();
        assert!(!tpm.in_lockout()?);
        tpm.set_dictionary_attack_parameters(0);
        assert!(tpm.in_lockout()?);
        Ok(())
    }

    #[test]
    fn state_survives_save_and_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tpm.yaml");
        let mut tpm = Simulator::new();
        let srk = get_or_create_srk(&mut tpm, b"")?;
        tpm.pcr_event(4, b"kernel")?;
        tpm.save(&path)?;

        let mut reopened = Simulator::open(&path)?;
        assert_eq!(reopened.read_public(Handle::SRK)?.0, srk);
        let selection = parse_pcr_selection_list("sha256:4")?;
        assert_eq!(reopened.pcr_read(&selection)?, tpm.pcr_read(&selection)?);
        Ok(())
    }

    #[test]
    fn corrupt_state_is_a_tpm_error() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut file, b"seed: [")?;
        let err = Simulator::open(file.path()).err();
        assert!(matches!(err, Some(TpmError::StateYaml { .. })));

        let dir = tempfile::tempdir()?;
        let err = Simulator::new().save(&dir.path().join("missing/tpm.yaml")).err();
        assert!(matches!(err, Some(TpmError::StateIo { .. })));
        Ok(())
    }
}
