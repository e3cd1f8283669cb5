use crate::exec::{program_name, Exec, ExecError, Invocation};
use crate::recovery::{RecoveryKey, RECOVERY_KEY_SIZE};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_SIZE: usize = 64;

#[derive(Error, Debug)]
pub enum LuksError {
    #[error("expected a key length of 512-bits (got {0})")]
    KeyLength(usize),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = LuksError> = core::result::Result<T, E>;

/// Manages the key slots of LUKS2 containers with `cryptsetup`. Slot 0
/// holds the TPM sealed key and is preferred during activation.
pub struct LuksManager<E: Exec> {
    exec: E,
    cryptsetup: String,
    run_dir: PathBuf,
}

impl<E: Exec> LuksManager<E> {
    pub fn new(exec: E) -> Self {
        Self {
            exec,
            cryptsetup: "cryptsetup".to_string(),
            run_dir: PathBuf::from("/run"),
        }
    }

    pub fn with_cryptsetup(mut self, path: impl Into<String>) -> Self {
        self.cryptsetup = path.into();
        self
    }

    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = dir.into();
        self
    }

    pub fn exec(&self) -> &E {
        &self.exec
    }

    fn run(&mut self, invocation: Invocation) -> Result<()> {
        self.exec.run(&invocation)?.check()?;
        Ok(())
    }

    fn set_slot_priority(&mut self, devpath: &str) -> Result<()> {
        let invocation = Invocation::new(&self.cryptsetup)
            .args(["config", "--priority", "prefer", "--key-slot", "0", devpath]);
        self.run(invocation)
    }

    /// Key file holding `first` followed by `second`, so one file can carry
    /// both the existing and the new key.
    fn combined_key_file(&self, first: &[u8], second: &[u8]) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}.", program_name()))
            .tempfile_in(&self.run_dir)?;
        let mut contents = Zeroizing::new(Vec::with_capacity(first.len() + second.len()));
        contents.extend_from_slice(first);
        contents.extend_from_slice(second);
        file.write_all(&contents)?;
        file.flush()?;
        Ok(file)
    }

    /// Formats `devpath` as a LUKS2 container with `key` in slot 0. Slot 0
    /// uses cheap key derivation as `key` is already high entropy.
    pub fn initialize_luks2_container(&mut self, devpath: &str, label: &str, key: &[u8]) -> Result<()> {
        if key.len() != KEY_SIZE {
            return Err(LuksError::KeyLength(key.len() * 8));
        }
        log::info!("formatting {} as LUKS2 container {}", devpath, label);
        let invocation = Invocation::new(&self.cryptsetup)
            .args([
                "-q",
                "luksFormat",
                "--type",
                "luks2",
                "--key-file",
                "-",
                "--cipher",
                "aes-xts-plain64",
                "--key-size",
                "512",
                "--pbkdf",
                "argon2i",
                "--pbkdf-force-iterations",
                "4",
                "--pbkdf-memory",
                "32",
                "--label",
                label,
                devpath,
            ])
            .stdin(key);
        self.run(invocation)?;
        self.set_slot_priority(devpath)
    }

    /// Adds `recovery_key` to a new slot, authorized by `key`.
    pub fn add_recovery_key_to_luks2_container(
        &mut self,
        devpath: &str,
        key: &[u8],
        recovery_key: &RecoveryKey,
    ) -> Result<()> {
        let file = self.combined_key_file(key, recovery_key.as_bytes())?;
        let path = file.path().to_string_lossy().into_owned();
        let invocation = Invocation::new(&self.cryptsetup)
            .args(["luksAddKey", "--key-file", path.as_str(), "--keyfile-offset", "0", "--keyfile-size"])
            .arg(key.len().to_string())
            .args(["--new-keyfile-offset"])
            .arg(key.len().to_string())
            .args(["--new-keyfile-size"])
            .arg(RECOVERY_KEY_SIZE.to_string())
            .args(["--pbkdf", "argon2i", "--iter-time", "5000", devpath, path.as_str()]);
        log::info!("adding recovery key to {}", devpath);
        self.run(invocation)
    }

    /// Replaces the key in slot 0 with `key`, authorized by `recovery_key`.
    pub fn change_luks2_key_using_recovery_key(
        &mut self,
        devpath: &str,
        recovery_key: &RecoveryKey,
        key: &[u8],
    ) -> Result<()> {
        let kill = Invocation::new(&self.cryptsetup)
            .args(["luksKillSlot", "--key-file", "-", devpath, "0"])
            .stdin(recovery_key.as_bytes());
        self.run(kill)?;

        let file = self.combined_key_file(recovery_key.as_bytes(), key)?;
        let path = file.path().to_string_lossy().into_owned();
        let add = Invocation::new(&self.cryptsetup)
            .args(["luksAddKey", "--key-file", path.as_str(), "--keyfile-offset", "0", "--keyfile-size"])
            .arg(RECOVERY_KEY_SIZE.to_string())
            .args(["--new-keyfile-offset"])
            .arg(RECOVERY_KEY_SIZE.to_string())
            .args(["--new-keyfile-size"])
            .arg(key.len().to_string())
            .args([
                "--pbkdf",
                "argon2i",
                "--pbkdf-force-iterations",
                "4",
                "--pbkdf-memory",
                "32",
                "--key-slot",
                "0",
                devpath,
                path.as_str(),
            ]);
        log::info!("replacing key in slot 0 of {}", devpath);
        self.run(add)?;
        self.set_slot_priority(devpath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Completed;
    use eyre::Result;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Vec<String>>,
        stdin: Vec<Option<Vec<u8>>>,
        key_files: Vec<Vec<u8>>,
        fail: bool,
    }

    impl Exec for Recorder {
        fn run(&mut self, invocation: &Invocation) -> crate::exec::Result<Completed> {
            self.calls.push(invocation.argv().into_iter().map(String::from).collect());
            self.stdin.push(invocation.stdin.as_ref().map(|s| s.to_vec()));
            if let Some(i) = invocation.args.iter().position(|a| a == "--key-file") {
                let path = &invocation.args[i + 1];
                if path != "-" {
                    self.key_files.push(std::fs::read(path)?);
                }
            }
            Ok(Completed {
                program: invocation.program.clone(),
                status: Some(if self.fail { 1 } else { 0 }),
                stdout: Zeroizing::new(Vec::new()),
            })
        }
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn initialize_container() -> Result<()> {
        let key = [7u8; 64];
        let mut luks = LuksManager::new(Recorder::default());
        luks.initialize_luks2_container("/dev/sda1", "data", &key)?;

        let rec = luks.exec();
        assert_eq!(
            rec.calls,
            vec![
                strings(&[
                    "cryptsetup",
                    "-q",
                    "luksFormat",
                    "--type",
                    "luks2",
                    "--key-file",
                    "-",
                    "--cipher",
                    "aes-xts-plain64",
                    "--key-size",
                    "512",
                    "--pbkdf",
                    "argon2i",
                    "--pbkdf-force-iterations",
                    "4",
                    "--pbkdf-memory",
                    "32",
                    "--label",
                    "data",
                    "/dev/sda1",
                ]),
                strings(&["cryptsetup", "config", "--priority", "prefer", "--key-slot", "0", "/dev/sda1"]),
            ]
        );
        assert_eq!(rec.stdin[0].as_deref(), Some(&key[..]));
        Ok(())
    }

    #[test]
    fn initialize_rejects_short_key() {
        let mut luks = LuksManager::new(Recorder::default());
        let err = luks
            .initialize_luks2_container("/dev/sda1", "data", &[0u8; 32])
            .err()
            .map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("expected a key length of 512-bits (got 256)"));
        assert!(luks.exec().calls.is_empty());
    }

    #[test]
    fn add_recovery_key() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let key = [1u8; 32];
        let recovery = RecoveryKey::new([2u8; 16]);
        let mut luks = LuksManager::new(Recorder::default())
            .with_cryptsetup("/sbin/cryptsetup")
            .with_run_dir(dir.path());
        luks.add_recovery_key_to_luks2_container("/dev/sda1", &key, &recovery)?;

        let rec = luks.exec();
        let call = &rec.calls[0];
        let path = call[3].clone();
        assert!(path.starts_with(&dir.path().to_string_lossy().into_owned()));
        assert_eq!(
            call,
            &strings(&[
                "/sbin/cryptsetup",
                "luksAddKey",
                "--key-file",
                path.as_str(),
                "--keyfile-offset",
                "0",
                "--keyfile-size",
                "32",
                "--new-keyfile-offset",
                "32",
                "--new-keyfile-size",
                "16",
                "--pbkdf",
                "argon2i",
                "--iter-time",
                "5000",
                "/dev/sda1",
                path.as_str(),
            ])
        );
        let mut expected = key.to_vec();
        expected.extend_from_slice(recovery.as_bytes());
        assert_eq!(rec.key_files, vec![expected]);
        Ok(())
    }

    #[test]
    fn change_key() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let key = [3u8; 64];
        let recovery = RecoveryKey::new([4u8; 16]);
        let mut luks = LuksManager::new(Recorder::default()).with_run_dir(dir.path());
        luks.change_luks2_key_using_recovery_key("/dev/sda1", &recovery, &key)?;

        let rec = luks.exec();
        assert_eq!(rec.calls.len(), 3);
        assert_eq!(
            rec.calls[0],
            strings(&["cryptsetup", "luksKillSlot", "--key-file", "-", "/dev/sda1", "0"])
        );
        assert_eq!(rec.stdin[0].as_deref(), Some(&recovery.as_bytes()[..]));

        let path = rec.calls[1][3].clone();
        assert_eq!(
            rec.calls[1],
            strings(&[
                "cryptsetup",
                "luksAddKey",
                "--key-file",
                path.as_str(),
                "--keyfile-offset",
                "0",
                "--keyfile-size",
                "16",
                "--new-keyfile-offset",
                "16",
                "--new-keyfile-size",
                "64",
                "--pbkdf",
                "argon2i",
                "--pbkdf-force-iterations",
                "4",
                "--pbkdf-memory",
                "32",
                "--key-slot",
                "0",
                "/dev/sda1",
                path.as_str(),
            ])
        );
        let mut expected = recovery.as_bytes().to_vec();
        expected.extend_from_slice(&key);
        assert_eq!(rec.key_files, vec![expected]);
        assert_eq!(
            rec.calls[2],
            strings(&["cryptsetup", "config", "--priority", "prefer", "--key-slot", "0", "/dev/sda1"])
        );
        Ok(())
    }

    #[test]
    fn tool_failure_stops_the_sequence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let recorder = Recorder {
            fail: true,
            ..Default::default()
        };
        let mut luks = LuksManager::new(recorder).with_run_dir(dir.path());
        let err = luks
            .change_luks2_key_using_recovery_key("/dev/sda1", &RecoveryKey::new([0; 16]), &[0; 64])
            .err()
            .map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("cryptsetup failed: exit status 1"));
        assert_eq!(luks.exec().calls.len(), 1);
        Ok(())
    }
}
