//! Volume activation: unseal the disk key from the TPM and hand it to the
//! unlock tool, falling back to a recovery key typed in by the user.

use crate::exec::{program_name, Exec, ExecError, Invocation};
use crate::keydata::{KeyDataError, SealedKeyObject};
use crate::recovery::{cache_description, CacheWriter, RecoveryKey, RecoveryKeyError, RecoveryKeyUsageReason};
use crate::tpm::Tpm;
use crate::unseal::UnsealError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

const TRIES_OPTION: &str = "tries=";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ActivateWithTpmSealedKeyOptions {
    /// PIN attempts before falling back to the recovery key. Only used if
    /// the key was sealed with a PIN.
    pub pin_tries: i32,
    /// Recovery key attempts once the TPM path has failed.
    pub recovery_key_tries: i32,
    /// Options passed through to the unlock tool.
    pub activate_options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ActivateWithRecoveryKeyOptions {
    pub tries: i32,
    pub activate_options: Vec<String>,
}

/// Paths to the external tools and to the directory that holds the
/// short-lived key files given to the unlock tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Tools {
    pub systemd_cryptsetup: String,
    pub ask_password: String,
    pub run_dir: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            systemd_cryptsetup: "/lib/systemd/systemd-cryptsetup".to_string(),
            ask_password: "systemd-ask-password".to_string(),
            run_dir: PathBuf::from("/run"),
        }
    }
}

/// Why the TPM path failed.
#[derive(Error, Debug)]
pub enum SealedKeyError {
    #[error("cannot read sealed key object: {0}")]
    Read(#[source] KeyDataError),
    #[error("no PIN tries permitted when a PIN is required")]
    NoPinTries,
    #[error("cannot obtain PIN: {0}")]
    Prompt(#[source] ExecError),
    #[error("cannot unseal key: {0}")]
    Unseal(#[from] UnsealError),
    #[error("cannot activate volume: {0}")]
    Activate(#[source] ExecError),
}

impl SealedKeyError {
    /// The reason recorded with a recovery key used after this failure.
    pub fn reason(&self) -> RecoveryKeyUsageReason {
        match self {
            SealedKeyError::Read(_) | SealedKeyError::Activate(_) => RecoveryKeyUsageReason::InvalidKeyFile,
            SealedKeyError::Unseal(UnsealError::InvalidKeyData(_)) => RecoveryKeyUsageReason::InvalidKeyFile,
            SealedKeyError::Unseal(UnsealError::Lockout) => RecoveryKeyUsageReason::TpmLockout,
            SealedKeyError::Unseal(UnsealError::Provisioning) => RecoveryKeyUsageReason::TpmProvisioningError,
            SealedKeyError::Unseal(UnsealError::PinFail) | SealedKeyError::NoPinTries => {
                RecoveryKeyUsageReason::PinFail
            }
            SealedKeyError::Unseal(UnsealError::Tpm(_)) | SealedKeyError::Prompt(_) => {
                RecoveryKeyUsageReason::UnexpectedError
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum ActivateError {
    #[error("{0}")]
    InvalidOptions(&'static str),
    #[error("no recovery key tries permitted")]
    NoRecoveryKeyTries,
    #[error("cannot obtain recovery key: {0}")]
    Prompt(#[source] ExecError),
    #[error("cannot decode recovery key: {0}")]
    Decode(#[from] RecoveryKeyError),
    #[error("cannot activate volume: {0}")]
    Activate(#[source] ExecError),
    #[error("cannot activate with TPM sealed key ({tpm}) but activation with recovery key was successful")]
    RecoveredWithRecoveryKey {
        #[source]
        tpm: SealedKeyError,
    },
    #[error("cannot activate with TPM sealed key ({tpm}) and activation with recovery key failed ({recovery})")]
    RecoveryFailed {
        #[source]
        tpm: SealedKeyError,
        recovery: Box<ActivateError>,
    },
}

impl ActivateError {
    /// Whether the volume was activated despite the error.
    pub fn activated(&self) -> bool {
        matches!(self, ActivateError::RecoveredWithRecoveryKey { .. })
    }
}

pub type Result<T, E = ActivateError> = core::result::Result<T, E>;

fn check_activate_options(options: &[String]) -> Result<()> {
    if options.iter().any(|o| o.starts_with(TRIES_OPTION)) {
        return Err(ActivateError::InvalidOptions(
            "cannot specify the \"tries=\" option for systemd-cryptsetup",
        ));
    }
    Ok(())
}

pub struct Activator<E: Exec> {
    exec: E,
    tools: Tools,
    cache: CacheWriter,
}

impl<E: Exec> Activator<E> {
    pub fn new(exec: E, tools: Tools, cache: CacheWriter) -> Self {
        Self { exec, tools, cache }
    }

    pub fn exec(&self) -> &E {
        &self.exec
    }

    /// Activates `volume` from `source` with the key sealed in `key_path`.
    /// If that fails for any reason, the user is asked for the recovery key.
    /// A volume activated with the recovery key still returns an error
    /// naming the TPM failure, with [`ActivateError::activated`] set.
    pub fn with_sealed_key(
        &mut self,
        tpm: &mut dyn Tpm,
        volume: &str,
        source: &str,
        key_path: &Path,
        pin_reader: Option<&mut dyn Read>,
        options: &ActivateWithTpmSealedKeyOptions,
    ) -> Result<()> {
        if options.pin_tries < 0 {
            return Err(ActivateError::InvalidOptions("invalid PINTries"));
        }
        if options.recovery_key_tries < 0 {
            return Err(ActivateError::InvalidOptions("invalid RecoveryKeyTries"));
        }
        check_activate_options(&options.activate_options)?;

        let tpm_err = match self.activate_with_tpm(tpm, volume, source, key_path, pin_reader, options) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        log::warn!("cannot activate {} with TPM sealed key: {}", source, tpm_err);

        let reason = tpm_err.reason();
        match self.activate_with_recovery_key(
            volume,
            source,
            None,
            options.recovery_key_tries,
            &options.activate_options,
            reason,
        ) {
            Ok(()) => Err(ActivateError::RecoveredWithRecoveryKey { tpm: tpm_err }),
            Err(e) => Err(ActivateError::RecoveryFailed {
                tpm: tpm_err,
                recovery: Box::new(e),
            }),
        }
    }

    /// Activates `volume` from `source` with a recovery key, read first from
    /// `key_reader` if supplied and then by prompting.
    pub fn with_recovery_key(
        &mut self,
        volume: &str,
        source: &str,
        key_reader: Option<&mut dyn Read>,
        options: &ActivateWithRecoveryKeyOptions,
    ) -> Result<()> {
        if options.tries < 0 {
            return Err(ActivateError::InvalidOptions("invalid Tries"));
        }
        check_activate_options(&options.activate_options)?;
        self.activate_with_recovery_key(
            volume,
            source,
            key_reader,
            options.tries,
            &options.activate_options,
            RecoveryKeyUsageReason::Requested,
        )
    }

    fn activate_with_tpm(
        &mut self,
        tpm: &mut dyn Tpm,
        volume: &str,
        source: &str,
        key_path: &Path,
        pin_reader: Option<&mut dyn Read>,
        options: &ActivateWithTpmSealedKeyOptions,
    ) -> Result<(), SealedKeyError> {
        let key = SealedKeyObject::read_from_file(key_path).map_err(SealedKeyError::Read)?;
        let secret = if key.requires_pin() {
            self.unseal_with_pin(tpm, &key, source, pin_reader, options.pin_tries)?
        } else {
            key.unseal_from_tpm(tpm, "")?
        };
        self.unlock(volume, source, &secret, &options.activate_options)
            .map_err(SealedKeyError::Activate)
    }

    fn unseal_with_pin(
        &mut self,
        tpm: &mut dyn Tpm,
        key: &SealedKeyObject,
        source: &str,
        pin_reader: Option<&mut dyn Read>,
        pin_tries: i32,
    ) -> Result<Zeroizing<Vec<u8>>, SealedKeyError> {
        let mut reader = pin_reader;
        let mut last_err = SealedKeyError::NoPinTries;
        for _ in 0..pin_tries {
            let pin = self
                .get_password(source, "PIN", &mut reader)
                .map_err(SealedKeyError::Prompt)?;
            match key.unseal_from_tpm(tpm, &pin) {
                Ok(secret) => return Ok(secret),
                Err(UnsealError::PinFail) => last_err = UnsealError::PinFail.into(),
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err)
    }

    fn activate_with_recovery_key(
        &mut self,
        volume: &str,
        source: &str,
        key_reader: Option<&mut dyn Read>,
        tries: i32,
        activate_options: &[String],
        reason: RecoveryKeyUsageReason,
    ) -> Result<()> {
        if tries == 0 {
            return Err(ActivateError::NoRecoveryKeyTries);
        }
        let mut reader = key_reader;
        let mut last_err = ActivateError::NoRecoveryKeyTries;
        for _ in 0..tries {
            let input = self
                .get_password(source, "recovery key", &mut reader)
                .map_err(ActivateError::Prompt)?;
            let key = match input.parse::<RecoveryKey>() {
                Ok(key) => key,
                Err(e) => {
                    last_err = e.into();
                    continue;
                }
            };
            if let Err(e) = self.unlock(volume, source, key.as_bytes(), activate_options) {
                last_err = ActivateError::Activate(e);
                continue;
            }
            let description = cache_description(program_name(), volume, reason);
            if let Err(e) = self.cache.add(&description, key.as_bytes()) {
                log::warn!("cannot cache recovery key: {}", e);
            }
            return Ok(());
        }
        Err(last_err)
    }

    /// Takes the first line of `reader` if it has one, otherwise prompts.
    /// The reader is only consulted once.
    fn get_password(
        &mut self,
        source: &str,
        what: &str,
        reader: &mut Option<&mut dyn Read>,
    ) -> Result<Zeroizing<String>, ExecError> {
        if let Some(reader) = reader.take() {
            let mut content = Zeroizing::new(String::new());
            if let Err(e) = reader.read_to_string(&mut content) {
                log::warn!("cannot read {} from the supplied reader: {}", what, e);
            }
            let line = content.lines().next().unwrap_or_default();
            if !line.is_empty() {
                return Ok(Zeroizing::new(line.to_string()));
            }
        }

        let invocation = Invocation::new(&self.tools.ask_password)
            .args(["--icon", "drive-harddisk", "--id"])
            .arg(format!("{}:{}", program_name(), source))
            .arg(format!("Please enter the {} for disk {}:", what, source));
        let completed = self.exec.run(&invocation)?.check()?;
        Ok(completed.first_line())
    }

    /// Runs the unlock tool once with `key` in a temporary key file.
    fn unlock(&mut self, volume: &str, source: &str, key: &[u8], activate_options: &[String]) -> Result<(), ExecError> {
        let mut keyfile = tempfile::Builder::new()
            .prefix(&format!("{}.", program_name()))
            .tempfile_in(&self.tools.run_dir)?;
        keyfile.write_all(key)?;
        keyfile.flush()?;

        let options = activate_options
            .iter()
            .map(String::as_str)
            .chain(std::iter::once("tries=1"))
            .collect::<Vec<_>>()
            .join(",");
        let invocation = Invocation::new(&self.tools.systemd_cryptsetup)
            .args(["attach", volume, source])
            .arg(keyfile.path().to_string_lossy())
            .arg(options);
        log::debug!("activating {} as {}", source, volume);
        self.exec.run(&invocation)?.check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Completed;
    use crate::recovery::SecretCache;
    use eyre::Result;
    use std::collections::VecDeque;

    const RECOVERY: &str = "00001-00002-00003-00004-00005-00006-00007-00008";

    #[derive(Default)]
    struct Mock {
        answers: VecDeque<&'static str>,
        accepted: Vec<Vec<u8>>,
        calls: Vec<Vec<String>>,
        keys: Vec<Vec<u8>>,
    }

    impl Exec for Mock {
        fn run(&mut self, invocation: &Invocation) -> crate::exec::Result<Completed> {
            self.calls.push(invocation.argv().into_iter().map(String::from).collect());
            let (status, stdout) = if invocation.program == "ask" {
                match self.answers.pop_front() {
                    Some(answer) => (0, format!("{}\n", answer).into_bytes()),
                    None => (1, Vec::new()),
                }
            } else {
                let key = std::fs::read(&invocation.args[3])?;
                let status = if self.accepted.contains(&key) { 0 } else { 1 };
                self.keys.push(key);
                (status, Vec::new())
            };
            Ok(Completed {
                program: invocation.program.clone(),
                status: Some(status),
                stdout: Zeroizing::new(stdout),
            })
        }
    }

    fn activator(mock: Mock, run_dir: &Path, cache: &SecretCache) -> Activator<Mock> {
        let tools = Tools {
            systemd_cryptsetup: "unlock".to_string(),
            ask_password: "ask".to_string(),
            run_dir: run_dir.to_path_buf(),
        };
        Activator::new(mock, tools, cache.writer())
    }

    fn recovery_bytes() -> Result<Vec<u8>> {
        Ok(RECOVERY.parse::<RecoveryKey>()?.as_bytes().to_vec())
    }

    #[test]
    fn invalid_options_make_no_calls() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = SecretCache::new();
        let mut a = activator(Mock::default(), dir.path(), &cache);

        let options = ActivateWithRecoveryKeyOptions {
            tries: -1,
            ..Default::default()
        };
        let err = a.with_recovery_key("data", "/dev/sda1", None, &options).err();
        assert_eq!(err.map(|e| e.to_string()).as_deref(), Some("invalid Tries"));

        let options = ActivateWithRecoveryKeyOptions {
            tries: 1,
            activate_options: vec!["foo".to_string(), "tries=2".to_string()],
        };
        let err = a.with_recovery_key("data", "/dev/sda1", None, &options).err();
        assert_eq!(
            err.map(|e| e.to_string()).as_deref(),
            Some("cannot specify the \"tries=\" option for systemd-cryptsetup")
        );

        let options = ActivateWithRecoveryKeyOptions::default();
        let err = a.with_recovery_key("data", "/dev/sda1", None, &options).err();
        assert_eq!(err.map(|e| e.to_string()).as_deref(), Some("no recovery key tries permitted"));
        assert!(a.exec().calls.is_empty());
        Ok(())
    }

    #[test]
    fn recovery_key_from_reader() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = SecretCache::new();
        let mock = Mock {
            accepted: vec![recovery_bytes()?],
            ..Default::default()
        };
        let mut a = activator(mock, dir.path(), &cache);
        let options = ActivateWithRecoveryKeyOptions {
            tries: 1,
            activate_options: vec!["foo".to_string()],
        };
        let mut reader = format!("{}\n", RECOVERY).into_bytes();
        a.with_recovery_key("data", "/dev/sda1", Some(&mut reader.as_slice()), &options)?;
        reader.clear();

        let calls = &a.exec().calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][..4], ["unlock", "attach", "data", "/dev/sda1"]);
        assert!(calls[0][4].starts_with(&dir.path().join(format!("{}.", program_name())).to_string_lossy().into_owned()));
        assert_eq!(calls[0][5], "foo,tries=1");

        let description = cache_description(program_name(), "data", RecoveryKeyUsageReason::Requested);
        assert_eq!(cache.reader().get(&description).as_deref(), Some(&recovery_bytes()?));
        Ok(())
    }

    #[test]
    fn empty_reader_falls_through_to_prompt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = SecretCache::new();
        let mock = Mock {
            answers: VecDeque::from([RECOVERY]),
            accepted: vec![recovery_bytes()?],
            ..Default::default()
        };
        let mut a = activator(mock, dir.path(), &cache);
        let options = ActivateWithRecoveryKeyOptions {
            tries: 1,
            ..Default::default()
        };
        a.with_recovery_key("data", "/dev/sda1", Some(&mut std::io::empty()), &options)?;

        let calls = &a.exec().calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            vec![
                "ask".to_string(),
                "--icon".to_string(),
                "drive-harddisk".to_string(),
                "--id".to_string(),
                format!("{}:/dev/sda1", program_name()),
                "Please enter the recovery key for disk /dev/sda1:".to_string(),
            ]
        );
        assert_eq!(calls[1][5], "tries=1");
        Ok(())
    }

    #[test]
    fn bad_recovery_keys_use_up_tries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = SecretCache::new();
        let mock = Mock {
            answers: VecDeque::from(["1234", "00000-00000-00000-00000-00000-00000-00000-00000", RECOVERY]),
            accepted: vec![recovery_bytes()?],
            ..Default::default()
        };
        let mut a = activator(mock, dir.path(), &cache);

        let options = ActivateWithRecoveryKeyOptions {
            tries: 2,
            ..Default::default()
        };
        let err = a.with_recovery_key("data", "/dev/sda1", None, &options).err();
        assert_eq!(
            err.map(|e| e.to_string()).as_deref(),
            Some("cannot activate volume: unlock failed: exit status 1")
        );
        // the malformed key never reaches the unlock tool
        assert_eq!(a.exec().keys, vec![vec![0u8; 16]]);

        let options = ActivateWithRecoveryKeyOptions {
            tries: 1,
            ..Default::default()
        };
        a.with_recovery_key("data", "/dev/sda1", None, &options)?;
        assert_eq!(cache.reader().descriptions().len(), 1);
        Ok(())
    }

    #[test]
    fn decode_error_is_reported_last() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = SecretCache::new();
        let mock = Mock {
            answers: VecDeque::from(["1234"]),
            ..Default::default()
        };
        let mut a = activator(mock, dir.path(), &cache);
        let options = ActivateWithRecoveryKeyOptions {
            tries: 1,
            ..Default::default()
        };
        let err = a.with_recovery_key("data", "/dev/sda1", None, &options).err();
        assert_eq!(
            err.map(|e| e.to_string()).as_deref(),
            Some("cannot decode recovery key: incorrectly formatted (insufficient characters)")
        );
        Ok(())
    }

    #[test]
    fn duplicate_cache_entry_does_not_fail_activation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = SecretCache::new();
        let description = cache_description(program_name(), "data", RecoveryKeyUsageReason::Requested);
        cache.writer().add(&description, b"earlier")?;
        let mock = Mock {
            answers: VecDeque::from([RECOVERY]),
            accepted: vec![recovery_bytes()?],
            ..Default::default()
        };
        let mut a = activator(mock, dir.path(), &cache);
        let options = ActivateWithRecoveryKeyOptions {
            tries: 1,
            ..Default::default()
        };
        a.with_recovery_key("data", "/dev/sda1", None, &options)?;
        assert_eq!(cache.reader().get(&description).as_deref().map(Vec::as_slice), Some(&b"earlier"[..]));
        Ok(())
    }

    #[test]
    fn sealed_key_option_checks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = SecretCache::new();
        let mut a = activator(Mock::default(), dir.path(), &cache);
        let mut tpm = crate::tpm::sim::Simulator::new();
        let key_path = dir.path().join("key");

        let cases = [
            (-1, 0, vec![], "invalid PINTries"),
            (0, -1, vec![], "invalid RecoveryKeyTries"),
            (0, 0, vec!["tries=1".to_string()], "cannot specify the \"tries=\" option for systemd-cryptsetup"),
        ];
        for (pin_tries, recovery_key_tries, activate_options, expected) in cases {
            let options = ActivateWithTpmSealedKeyOptions {
                pin_tries,
                recovery_key_tries,
                activate_options,
            };
            let err = a.with_sealed_key(&mut tpm, "data", "/dev/sda1", &key_path, None, &options).err();
            assert_eq!(err.map(|e| e.to_string()).as_deref(), Some(expected));
        }
        assert!(a.exec().calls.is_empty());
        Ok(())
    }

    #[test]
    fn unreadable_key_file_falls_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = SecretCache::new();
        let mock = Mock {
            answers: VecDeque::from([RECOVERY]),
            accepted: vec![recovery_bytes()?],
            ..Default::default()
        };
        let mut a = activator(mock, dir.path(), &cache);
        let mut tpm = crate::tpm::sim::Simulator::new();
        let key_path = dir.path().join("missing");
        let options = ActivateWithTpmSealedKeyOptions {
            recovery_key_tries: 1,
            ..Default::default()
        };

        let err = a.with_sealed_key(&mut tpm, "data", "/dev/sda1", &key_path, None, &options).err();
        assert!(err.as_ref().map(ActivateError::activated).unwrap_or(false));
        match err {
            Some(ActivateError::RecoveredWithRecoveryKey { tpm }) => {
                assert!(matches!(tpm, SealedKeyError::Read(_)));
                assert_eq!(tpm.reason(), RecoveryKeyUsageReason::InvalidKeyFile);
            }
            other => panic!("unexpected result {:?}", other),
        }
        let description = cache_description(program_name(), "data", RecoveryKeyUsageReason::InvalidKeyFile);
        assert!(cache.reader().get(&description).is_some());
        Ok(())
    }
}
