//! Software computation of policy digests.
//!
//! Each assertion extends the digest the same way the TPM extends a policy
//! session, so the result can be used as an object's `auth_policy` or be
//! compared against a live session's digest.

use crate::mu;
use crate::tpm::pcr::PcrSelectionList;
use crate::tpm::types::{CommandCode, Digest, HashAlg, Name, NvOperation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialAuthPolicy {
    alg: HashAlg,
    digest: Digest,
}

impl TrialAuthPolicy {
    pub fn new(alg: HashAlg) -> Self {
        Self {
            alg,
            digest: alg.zero_digest(),
        }
    }

    /// Continues from a digest computed elsewhere, such as the root of an OR tree.
    pub fn from_digest(alg: HashAlg, digest: Digest) -> Self {
        Self { alg, digest }
    }

    pub fn alg(&self) -> HashAlg {
        self.alg
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn into_digest(self) -> Digest {
        self.digest
    }

    fn extend(&mut self, code: CommandCode, args: &[&[u8]]) {
        let mut h = self.alg.hasher();
        h.update(&self.digest).update(&code.to_be_bytes());
        for arg in args {
            h.update(arg);
        }
        self.digest = h.finalize();
    }

    fn update_with_ref(&mut self, code: CommandCode, name: &Name, policy_ref: &[u8]) {
        self.extend(code, &[name]);
        self.digest = self.alg.hash(&[&self.digest, policy_ref]);
    }

    pub fn policy_pcr(&mut self, pcr_digest: &Digest, pcrs: &PcrSelectionList) -> mu::Result<()> {
        let pcrs = mu::marshal_to_vec(pcrs)?;
        self.extend(CommandCode::POLICY_PCR, &[&pcrs, pcr_digest]);
        Ok(())
    }

    /// Replaces the digest with the OR of `digests`. The TPM accepts between
    /// two and eight digests; callers duplicate single entries.
    pub fn policy_or(&mut self, digests: &[Digest]) {
        self.digest = self.alg.zero_digest();
        let parts = digests.iter().map(|d| d.as_bytes()).collect::<Vec<_>>();
        self.extend(CommandCode::POLICY_OR, &parts);
    }

    pub fn policy_nv(&mut self, operand_b: &[u8], offset: u16, operation: NvOperation, nv_name: &Name) {
        let args = self.alg.hash(&[
            operand_b,
            &offset.to_be_bytes(),
            &operation.code().to_be_bytes(),
        ]);
        self.extend(CommandCode::POLICY_NV, &[&args, nv_name]);
    }

    pub fn policy_auth_value(&mut self) {
        self.extend(CommandCode::POLICY_AUTH_VALUE, &[]);
    }

    pub fn policy_command_code(&mut self, code: CommandCode) {
        self.extend(CommandCode::POLICY_COMMAND_CODE, &[&code.to_be_bytes()]);
    }

    pub fn policy_signed(&mut self, key_name: &Name, policy_ref: &[u8]) {
        self.update_with_ref(CommandCode::POLICY_SIGNED, key_name, policy_ref);
    }

    pub fn policy_authorize(&mut self, policy_ref: &[u8], key_name: &Name) {
        self.digest = self.alg.zero_digest();
        self.update_with_ref(CommandCode::POLICY_AUTHORIZE, key_name, policy_ref);
    }
}
