#![allow(dead_code)]

use eyre::Result;
use std::collections::VecDeque;
use std::path::Path;
use tpm_keyseal::activate::{Activator, Tools};
use tpm_keyseal::exec::{self, Completed, Exec, Invocation};
use tpm_keyseal::recovery::SecretCache;
use tpm_keyseal::seal::{seal_key_to_tpm, KeyCreationParams};
use tpm_keyseal::tpm::pcr::{parse_pcr_selection_list, PcrProfile};
use tpm_keyseal::tpm::sim::Simulator;
use tpm_keyseal::tpm::types::{Handle, HashAlg};
use tpm_keyseal::tpm::Tpm;
use zeroize::Zeroizing;

pub const UNLOCK: &str = "systemd-cryptsetup";
pub const ASK_PASSWORD: &str = "systemd-ask-password";
pub const DISK_KEY: &[u8] = b"0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
pub const COUNTER: Handle = Handle(0x0181_0001);
pub const RECOVERY_KEY: &str = "24545-40256-04426-14347-11506-00000-65535-00001";

/// Stands in for the prompt and the unlock tool. Prompts are answered from
/// `answers` in order; the unlock tool succeeds for keys in `accepted`.
#[derive(Default)]
pub struct MockTools {
    pub answers: VecDeque<String>,
    pub accepted: Vec<Vec<u8>>,
    pub prompts: Vec<Vec<String>>,
    pub unlocks: Vec<Vec<String>>,
    pub unlock_keys: Vec<Vec<u8>>,
}

impl MockTools {
    pub fn new(answers: &[&str], accepted: &[&[u8]]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_string()).collect(),
            accepted: accepted.iter().map(|k| k.to_vec()).collect(),
            ..Default::default()
        }
    }
}

impl Exec for MockTools {
    fn run(&mut self, invocation: &Invocation) -> exec::Result<Completed> {
        let argv: Vec<String> = invocation.argv().into_iter().map(String::from).collect();
        let (status, stdout) = match invocation.program.as_str() {
            ASK_PASSWORD => {
                self.prompts.push(argv);
                match self.answers.pop_front() {
                    Some(answer) => (0, format!("{}\n", answer).into_bytes()),
                    None => (1, Vec::new()),
                }
            }
            _ => {
                let key = std::fs::read(&argv[4])?;
                let status = if self.accepted.contains(&key) { 0 } else { 1 };
                self.unlocks.push(argv);
                self.unlock_keys.push(key);
                (status, Vec::new())
            }
        };
        Ok(Completed {
            program: invocation.program.clone(),
            status: Some(status),
            stdout: Zeroizing::new(stdout),
        })
    }
}

pub fn activator(mock: MockTools, run_dir: &Path, cache: &SecretCache) -> Activator<MockTools> {
    let tools = Tools {
        systemd_cryptsetup: UNLOCK.to_string(),
        ask_password: ASK_PASSWORD.to_string(),
        run_dir: run_dir.to_path_buf(),
    };
    Activator::new(mock, tools, cache.writer())
}

/// A profile accepting only the current value of PCR 7.
pub fn current_profile(tpm: &mut Simulator) -> Result<PcrProfile> {
    let selection = parse_pcr_selection_list("sha256:7")?;
    let values = tpm.pcr_read(&selection)?;
    let mut profile = PcrProfile::default();
    profile.add_values(HashAlg::Sha256, 7, values.get(HashAlg::Sha256, 7).cloned());
    Ok(profile)
}

pub fn seal(tpm: &mut Simulator, path: &Path, pin: Option<&str>) -> Result<tpm_keyseal::policy::AuthPrivateKey> {
    let params = KeyCreationParams {
        pcr_profile: current_profile(tpm)?,
        pcr_policy_counter_handle: COUNTER,
        pin: pin.map(str::to_owned),
    };
    Ok(seal_key_to_tpm(tpm, DISK_KEY, path, &params)?)
}
