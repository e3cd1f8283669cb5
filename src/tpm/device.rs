//! A TPM reached through the TSS2 ESAPI.
//!
//! Structures cross the boundary in their TPM wire form: public areas and
//! signatures are marshalled here and unmarshalled by the TSS, and buffers
//! are copied into the TSS's sized buffer types. Transient objects and policy
//! sessions are handed out as handles in the TPM's transient (`0x80...`) and
//! policy session (`0x03...`) ranges and mapped back to ESYS resources here.

use super::pcr::{PcrSelectionList, PcrValues};
use super::types::{self as t, CommandCode, Handle, HashAlg, NvOperation, VerifiedTicket};
use super::{FlushContext, ResponseCode, Result, Tpm, TpmError};
use crate::mu;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tss_esapi::attributes::{NvIndexAttributes, SessionAttributesBuilder};
use tss_esapi::constants::{PropertyTag, SessionType};
use tss_esapi::handles::{
    KeyHandle, NvIndexHandle, NvIndexTpmHandle, ObjectHandle, PersistentTpmHandle, SessionHandle, TpmHandle,
};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::resource_handles::{Hierarchy, NvAuth, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession};
use tss_esapi::structures::{
    Auth, Digest, DigestList, EncryptedSecret, Name, Nonce, NvPublic, NvPublicBuilder,
    PcrSelectionListBuilder, PcrSlot, Private, Public, SensitiveData, Signature,
    SymmetricDefinition, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::tss2_esys::{TPMA_NV, TPMT_TK_VERIFIED, TPM2_ALG_ID};
use zeroize::Zeroizing;

const TRANSIENT_FIRST: u32 = 0x8000_0000;
const SESSION_FIRST: u32 = 0x0300_0000;
const ST_VERIFIED: u16 = 0x8022;
const PERMANENT_IN_LOCKOUT: u32 = 1 << 9;

fn tss(command: &'static str) -> impl Fn(tss_esapi::Error) -> TpmError {
    move |source| TpmError::tss(command, source)
}

fn hashing_algorithm(command: &'static str, alg: HashAlg) -> Result<HashingAlgorithm> {
    HashingAlgorithm::try_from(alg.id()).map_err(tss(command))
}

fn to_public(command: &'static str, public: &t::Public) -> Result<Public> {
    Public::unmarshall(&mu::marshal_to_vec(public)?).map_err(tss(command))
}

fn from_public(command: &'static str, public: &Public) -> Result<t::Public> {
    let bytes = public.marshall().map_err(tss(command))?;
    Ok(mu::unmarshal_from_bytes("Public", &bytes)?)
}

fn to_signature(command: &'static str, signature: &t::Signature) -> Result<Signature> {
    Signature::unmarshall(&mu::marshal_to_vec(signature)?).map_err(tss(command))
}

fn to_digest(command: &'static str, digest: &[u8]) -> Result<Digest> {
    Digest::try_from(digest.to_vec()).map_err(tss(command))
}

fn to_auth(command: &'static str, auth: &[u8]) -> Result<Auth> {
    Auth::try_from(auth.to_vec()).map_err(tss(command))
}

fn to_selection(command: &'static str, bank: HashAlg, pcrs: &[u8]) -> Result<tss_esapi::structures::PcrSelectionList> {
    let slots = pcrs
        .iter()
        .map(|pcr| {
            PcrSlot::try_from(1u32 << *pcr).map_err(|_| TpmError::response(command, ResponseCode::Value))
        })
        .collect::<Result<Vec<_>>>()?;
    PcrSelectionListBuilder::new()
        .with_selection(hashing_algorithm(command, bank)?, &slots)
        .build()
        .map_err(tss(command))
}

fn to_nv_public(public: &t::NvPublic) -> Result<NvPublic> {
    const CC: &str = "NV_DefineSpace";
    let attributes = NvIndexAttributes::try_from(public.attributes.0 as TPMA_NV)
        .map_err(|_| TpmError::response(CC, ResponseCode::Attributes))?;
    let index = NvIndexTpmHandle::new(public.index.0).map_err(tss(CC))?;
    NvPublicBuilder::new()
        .with_nv_index(index)
        .with_index_name_algorithm(hashing_algorithm(CC, public.name_alg)?)
        .with_index_attributes(attributes)
        .with_index_auth_policy(to_digest(CC, &public.auth_policy)?)
        .with_data_area_size(public.size as usize)
        .build()
        .map_err(tss(CC))
}

fn from_nv_public(index: Handle, public: &NvPublic) -> Result<t::NvPublic> {
    const CC: &str = "NV_ReadPublic";
    let alg = TPM2_ALG_ID::try_from(public.name_algorithm())
        .map_err(|_| TpmError::response(CC, ResponseCode::Value))?;
    let attributes = TPMA_NV::try_from(public.attributes())
        .map_err(|_| TpmError::response(CC, ResponseCode::Attributes))?;
    let size = u16::try_from(public.data_size()).map_err(|_| TpmError::response(CC, ResponseCode::Size))?;
    Ok(t::NvPublic {
        index,
        name_alg: HashAlg::from_id(alg).ok_or_else(|| TpmError::response(CC, ResponseCode::Value))?,
        attributes: t::NvAttributes(attributes),
        auth_policy: t::Digest::new(public.authorization_policy().value()),
        size,
    })
}

fn hierarchy(command: &'static str, handle: Handle) -> Result<Hierarchy> {
    match handle {
        Handle::OWNER => Ok(Hierarchy::Owner),
        Handle::NULL => Ok(Hierarchy::Null),
        _ => Err(TpmError::response(command, ResponseCode::Hierarchy)),
    }
}

/// A connection to a TPM.
pub struct Device {
    ctx: tss_esapi::Context,
    objects: BTreeMap<u32, ObjectHandle>,
    sessions: BTreeMap<u32, PolicySession>,
    next_handle: u32,
}

impl Device {
    /// Connects through the TCTI named by `tcti` (e.g. `device:/dev/tpmrm0`),
    /// or the one in the environment, or the kernel resource manager.
    pub fn open(tcti: Option<&str>) -> Result<Self> {
        const CC: &str = "Tss2_TctiLdr_Initialize";
        let conf = match tcti {
            Some(tcti) => TctiNameConf::from_str(tcti).map_err(tss(CC))?,
            None => TctiNameConf::from_environment_variable()
                .unwrap_or_else(|_| TctiNameConf::Device(Default::default())),
        };
        log::debug!("TCTI config {:?}", conf);
        let ctx = tss_esapi::Context::new(conf).map_err(tss("Esys_Initialize"))?;
        Ok(Self {
            ctx,
            objects: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_handle: 0,
        })
    }

    fn allocate(&mut self, first: u32) -> Handle {
        self.next_handle = self.next_handle.wrapping_add(1) & 0x00ff_ffff;
        Handle(first | self.next_handle)
    }

    fn insert_object(&mut self, object: ObjectHandle) -> Handle {
        let handle = self.allocate(TRANSIENT_FIRST);
        self.objects.insert(handle.0, object);
        handle
    }

    /// The ESYS resource for `handle`. Persistent objects and NV indices are
    /// looked up on the TPM the first time they're used.
    fn object(&mut self, command: &'static str, handle: Handle) -> Result<ObjectHandle> {
        if let Some(object) = self.objects.get(&handle.0) {
            return Ok(*object);
        }
        match handle.handle_type() {
            Handle::TYPE_PERSISTENT | Handle::TYPE_NV_INDEX => {
                let tpm_handle = TpmHandle::try_from(handle.0).map_err(tss(command))?;
                let object = self
                    .ctx
                    .execute_without_session(|ctx| ctx.tr_from_tpm_public(tpm_handle))
                    .map_err(tss(command))?;
                self.objects.insert(handle.0, object);
                Ok(object)
            }
            _ => Err(TpmError::response(command, ResponseCode::Handle)),
        }
    }

    fn forget(&mut self, handle: Handle) {
        if let Some(mut object) = self.objects.remove(&handle.0) {
            self.ctx.tr_close(&mut object).ok();
        }
    }

    fn session(&self, command: &'static str, handle: Handle) -> Result<PolicySession> {
        self.sessions
            .get(&handle.0)
            .copied()
            .ok_or_else(|| TpmError::response(command, ResponseCode::Handle))
    }

    fn set_owner_auth(&mut self, command: &'static str, owner_auth: &[u8]) -> Result<()> {
        self.ctx
            .tr_set_auth(Hierarchy::Owner.into(), to_auth(command, owner_auth)?)
            .map_err(tss(command))
    }
}

impl FlushContext for Device {
    fn flush_context(&mut self, handle: Handle) -> Result<()> {
        const CC: &str = "FlushContext";
        let object = match handle.handle_type() {
            Handle::TYPE_TRANSIENT => self.objects.remove(&handle.0),
            Handle::TYPE_POLICY_SESSION => self
                .sessions
                .remove(&handle.0)
                .map(|session| ObjectHandle::from(SessionHandle::from(session))),
            _ => None,
        };
        let object = object.ok_or_else(|| TpmError::response(CC, ResponseCode::Handle))?;
        self.ctx.flush_context(object).map_err(tss(CC))
    }
}

impl Tpm for Device {
    fn in_lockout(&mut self) -> Result<bool> {
        let permanent = self
            .ctx
            .get_tpm_property(PropertyTag::Permanent)
            .map_err(tss("GetCapability"))?;
        Ok(permanent.map_or(false, |p| p & PERMANENT_IN_LOCKOUT != 0))
    }

    fn read_public(&mut self, handle: Handle) -> Result<(t::Public, t::Name)> {
        const CC: &str = "ReadPublic";
        let object = self.object(CC, handle)?;
        let (public, name, _) = self.ctx.read_public(object.into()).map_err(tss(CC))?;
        Ok((from_public(CC, &public)?, t::Name::new(name.value())))
    }

    fn create_primary(
        &mut self,
        hierarchy_handle: Handle,
        hierarchy_auth: &[u8],
        template: &t::Public,
    ) -> Result<(Handle, t::Public)> {
        const CC: &str = "CreatePrimary";
        let primary = hierarchy(CC, hierarchy_handle)?;
        let template = to_public(CC, template)?;
        self.ctx
            .tr_set_auth(primary.into(), to_auth(CC, hierarchy_auth)?)
            .map_err(tss(CC))?;
        let result = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.create_primary(primary, template, None, None, None, None)
            })
            .map_err(tss(CC))?;
        let public = from_public(CC, &result.out_public)?;
        Ok((self.insert_object(result.key_handle.into()), public))
    }

    fn evict_control(&mut self, owner_auth: &[u8], object: Handle, persistent: Handle) -> Result<()> {
        const CC: &str = "EvictControl";
        let transient = self.object(CC, object)?;
        let target = PersistentTpmHandle::new(persistent.0).map_err(tss(CC))?;
        self.set_owner_auth(CC, owner_auth)?;
        let persisted = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.evict_control(Provision::Owner, transient, Persistent::Persistent(target))
            })
            .map_err(tss(CC))?;
        self.objects.insert(persistent.0, persisted);
        Ok(())
    }

    fn create(
        &mut self,
        parent: Handle,
        template: &t::Public,
        auth_value: &[u8],
        sensitive: &[u8],
    ) -> Result<(t::Private, t::Public)> {
        const CC: &str = "Create";
        let parent = self.object(CC, parent)?;
        let template = to_public(CC, template)?;
        let auth_value = to_auth(CC, auth_value)?;
        let sensitive = SensitiveData::try_from(sensitive.to_vec()).map_err(tss(CC))?;
        let result = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.create(parent.into(), template, Some(auth_value), Some(sensitive), None, None)
            })
            .map_err(tss(CC))?;
        Ok((
            t::Private::new(result.out_private.value()),
            from_public(CC, &result.out_public)?,
        ))
    }

    fn load(&mut self, parent: Handle, private: &t::Private, public: &t::Public) -> Result<Handle> {
        const CC: &str = "Load";
        let parent = self.object(CC, parent)?;
        let private = Private::try_from(private.as_bytes().to_vec()).map_err(tss(CC))?;
        let public = to_public(CC, public)?;
        let key = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.load(parent.into(), private, public)
            })
            .map_err(tss(CC))?;
        Ok(self.insert_object(key.into()))
    }

    fn load_external(&mut self, public: &t::Public) -> Result<Handle> {
        const CC: &str = "LoadExternal";
        let public = to_public(CC, public)?;
        // the owner hierarchy, so that VerifySignature produces a usable ticket
        let key = self
            .ctx
            .execute_without_session(|ctx| ctx.load_external_public(public, Hierarchy::Owner))
            .map_err(tss(CC))?;
        Ok(self.insert_object(key.into()))
    }

    fn import(
        &mut self,
        parent: Handle,
        public: &t::Public,
        duplicate: &t::Private,
        seed: &t::EncryptedSecret,
    ) -> Result<t::Private> {
        const CC: &str = "Import";
        let parent = self.object(CC, parent)?;
        let public = to_public(CC, public)?;
        let duplicate = Private::try_from(duplicate.as_bytes().to_vec()).map_err(tss(CC))?;
        let seed = EncryptedSecret::try_from(seed.as_bytes().to_vec()).map_err(tss(CC))?;
        let private = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.import(parent, None, public, duplicate, seed, SymmetricDefinitionObject::Null)
            })
            .map_err(tss(CC))?;
        Ok(t::Private::new(private.value()))
    }

    fn unseal(&mut self, item: Handle, session: Handle, auth_value: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        const CC: &str = "Unseal";
        let object = self.object(CC, item)?;
        let session = self.session(CC, session)?;
        self.ctx
            .tr_set_auth(object, to_auth(CC, auth_value)?)
            .map_err(tss(CC))?;
        let data = self
            .ctx
            .execute_with_session(Some(session.into()), |ctx| ctx.unseal(object))
            .map_err(tss(CC))?;
        Ok(Zeroizing::new(data.value().to_vec()))
    }

    fn pcr_read(&mut self, selection: &PcrSelectionList) -> Result<PcrValues> {
        const CC: &str = "PCR_Read";
        let mut values = PcrValues::default();
        for s in selection.selections() {
            for pcr in &s.pcrs {
                let one = to_selection(CC, s.hash, &[*pcr])?;
                let (_, _, digests) = self
                    .ctx
                    .execute_without_session(|ctx| ctx.pcr_read(one))
                    .map_err(tss(CC))?;
                let digest = digests
                    .value()
                    .first()
                    .ok_or_else(|| TpmError::response(CC, ResponseCode::Value))?;
                values.set(s.hash, *pcr, t::Digest::new(digest.value()));
            }
        }
        Ok(values)
    }

    fn start_policy_session(&mut self, alg: HashAlg) -> Result<Handle> {
        const CC: &str = "StartAuthSession";
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinition::AES_128_CFB,
                hashing_algorithm(CC, alg)?,
            )
            .map_err(tss(CC))?
            .ok_or(TpmError::AuthSessionCreate)?;
        let (attributes, mask) = SessionAttributesBuilder::new()
            .with_continue_session(true)
            .build();
        self.ctx
            .tr_sess_set_attributes(session, attributes, mask)
            .map_err(tss(CC))?;
        let policy = PolicySession::try_from(session).map_err(tss(CC))?;
        let handle = self.allocate(SESSION_FIRST);
        self.sessions.insert(handle.0, policy);
        Ok(handle)
    }

    /// Always empty: the ESAPI bindings don't expose nonceTPM, so signed
    /// authorizations aren't bound to a session.
    fn session_nonce(&mut self, session: Handle) -> Result<t::Digest> {
        self.session("PolicySigned", session)?;
        Ok(t::Digest::default())
    }

    fn policy_get_digest(&mut self, session: Handle) -> Result<t::Digest> {
        const CC: &str = "PolicyGetDigest";
        let session = self.session(CC, session)?;
        let digest = self.ctx.policy_get_digest(session).map_err(tss(CC))?;
        Ok(t::Digest::new(digest.value()))
    }

    fn policy_pcr(&mut self, session: Handle, pcr_digest: &t::Digest, pcrs: &PcrSelectionList) -> Result<()> {
        const CC: &str = "PolicyPCR";
        let session = self.session(CC, session)?;
        let mut builder = PcrSelectionListBuilder::new();
        for s in pcrs.selections() {
            let slots = s
                .pcrs
                .iter()
                .map(|pcr| {
                    PcrSlot::try_from(1u32 << *pcr)
                        .map_err(|_| TpmError::response(CC, ResponseCode::Value))
                })
                .collect::<Result<Vec<_>>>()?;
            builder = builder.with_selection(hashing_algorithm(CC, s.hash)?, &slots);
        }
        let selection = builder.build().map_err(tss(CC))?;
        self.ctx
            .policy_pcr(session, to_digest(CC, pcr_digest)?, selection)
            .map_err(tss(CC))
    }

    fn policy_or(&mut self, session: Handle, digests: &[t::Digest]) -> Result<()> {
        const CC: &str = "PolicyOR";
        let session = self.session(CC, session)?;
        let mut list = DigestList::new();
        for digest in digests {
            list.add(to_digest(CC, digest)?).map_err(tss(CC))?;
        }
        self.ctx.policy_or(session, list).map_err(tss(CC))
    }

    fn policy_nv(
        &mut self,
        _index: Handle,
        _session: Handle,
        _operand_b: &[u8],
        _offset: u16,
        _operation: NvOperation,
    ) -> Result<()> {
        Err(TpmError::Unsupported("PolicyNV"))
    }

    fn policy_auth_value(&mut self, session: Handle) -> Result<()> {
        const CC: &str = "PolicyAuthValue";
        let session = self.session(CC, session)?;
        self.ctx.policy_auth_value(session).map_err(tss(CC))
    }

    fn policy_command_code(&mut self, session: Handle, code: CommandCode) -> Result<()> {
        const CC: &str = "PolicyCommandCode";
        let session = self.session(CC, session)?;
        let code = tss_esapi::constants::CommandCode::try_from(code.0).map_err(tss(CC))?;
        self.ctx.policy_command_code(session, code).map_err(tss(CC))
    }

    fn policy_signed(
        &mut self,
        key: Handle,
        session: Handle,
        policy_ref: &[u8],
        expiration: i32,
        signature: &t::Signature,
    ) -> Result<()> {
        const CC: &str = "PolicySigned";
        let object = self.object(CC, key)?;
        let session = self.session(CC, session)?;
        let policy_ref = Nonce::try_from(policy_ref.to_vec()).map_err(tss(CC))?;
        let expiration = (expiration != 0).then(|| Duration::from_secs(u64::from(expiration.unsigned_abs())));
        let signature = to_signature(CC, signature)?;
        self.ctx
            .policy_signed(
                session,
                object,
                Nonce::default(),
                Digest::default(),
                policy_ref,
                expiration,
                signature,
            )
            .map_err(tss(CC))?;
        Ok(())
    }

    fn verify_signature(
        &mut self,
        key: Handle,
        digest: &t::Digest,
        signature: &t::Signature,
    ) -> Result<VerifiedTicket> {
        const CC: &str = "VerifySignature";
        let key: KeyHandle = self.object(CC, key)?.into();
        let digest = to_digest(CC, digest)?;
        let signature = to_signature(CC, signature)?;
        let ticket = self
            .ctx
            .execute_without_session(|ctx| ctx.verify_signature(key, digest, signature))
            .map_err(tss(CC))?;
        let ticket = TPMT_TK_VERIFIED::try_from(ticket)
            .map_err(|_| TpmError::response(CC, ResponseCode::Value))?;
        let size = usize::from(ticket.digest.size).min(ticket.digest.buffer.len());
        Ok(VerifiedTicket {
            hierarchy: Handle(ticket.hierarchy),
            digest: t::Digest::new(&ticket.digest.buffer[..size]),
        })
    }

    fn policy_authorize(
        &mut self,
        session: Handle,
        approved_policy: &t::Digest,
        policy_ref: &[u8],
        key_sign: &t::Name,
        ticket: &VerifiedTicket,
    ) -> Result<()> {
        const CC: &str = "PolicyAuthorize";
        let session = self.session(CC, session)?;
        let ticket = TPMT_TK_VERIFIED {
            tag: ST_VERIFIED,
            hierarchy: ticket.hierarchy.0,
            digest: to_digest(CC, &ticket.digest)?.into(),
        };
        let ticket = tss_esapi::structures::VerifiedTicket::try_from(ticket).map_err(tss(CC))?;
        let policy_ref = Nonce::try_from(policy_ref.to_vec()).map_err(tss(CC))?;
        let key_sign = Name::try_from(key_sign.as_bytes().to_vec()).map_err(tss(CC))?;
        self.ctx
            .policy_authorize(session, to_digest(CC, approved_policy)?, policy_ref, &key_sign, ticket)
            .map_err(tss(CC))
    }

    fn nv_define_space(&mut self, owner_auth: &[u8], public: &t::NvPublic) -> Result<()> {
        const CC: &str = "NV_DefineSpace";
        let nv_public = to_nv_public(public)?;
        self.set_owner_auth(CC, owner_auth)?;
        let index = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.nv_define_space(Provision::Owner, None, nv_public)
            })
            .map_err(tss(CC))?;
        self.forget(public.index);
        self.objects.insert(public.index.0, index.into());
        Ok(())
    }

    fn nv_undefine_space(&mut self, owner_auth: &[u8], index: Handle) -> Result<()> {
        const CC: &str = "NV_UndefineSpace";
        let nv: NvIndexHandle = self.object(CC, index)?.into();
        self.set_owner_auth(CC, owner_auth)?;
        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.nv_undefine_space(Provision::Owner, nv)
            })
            .map_err(tss(CC))?;
        // the TSS releases the resource along with the index
        self.objects.remove(&index.0);
        Ok(())
    }

    fn nv_read_public(&mut self, index: Handle) -> Result<(t::NvPublic, t::Name)> {
        const CC: &str = "NV_ReadPublic";
        let nv: NvIndexHandle = self.object(CC, index)?.into();
        let (public, name) = self
            .ctx
            .execute_without_session(|ctx| ctx.nv_read_public(nv))
            .map_err(tss(CC))?;
        Ok((from_nv_public(index, &public)?, t::Name::new(name.value())))
    }

    fn nv_read_counter(&mut self, index: Handle) -> Result<u64> {
        const CC: &str = "NV_Read";
        let nv: NvIndexHandle = self.object(CC, index)?.into();
        self.ctx.tr_set_auth(nv.into(), Auth::default()).map_err(tss(CC))?;
        let data = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.nv_read(NvAuth::NvIndex(nv), nv, 8, 0)
            })
            .map_err(tss(CC))?;
        let bytes: [u8; 8] = data
            .value()
            .try_into()
            .map_err(|_| TpmError::response(CC, ResponseCode::Size))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn nv_increment(&mut self, index: Handle, session: Handle) -> Result<()> {
        const CC: &str = "NV_Increment";
        let nv: NvIndexHandle = self.object(CC, index)?.into();
        let session = self.session(CC, session)?;
        self.ctx
            .execute_with_session(Some(session.into()), |ctx| {
                ctx.nv_increment(NvAuth::NvIndex(nv), nv)
            })
            .map_err(tss(CC))
    }
}
