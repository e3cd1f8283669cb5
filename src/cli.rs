use crate::activate::Activator;
use crate::config::{load_pcr_profile, ActivationConfig};
use crate::exec::SystemExec;
use crate::keydata::SealedKeyObject;
use crate::luks::LuksManager;
use crate::policy::AuthPrivateKey;
use crate::recovery::{RecoveryKey, SecretCache};
use crate::seal::{
    seal_key_to_external_tpm, seal_key_to_tpm, update_key_pcr_protection_policy, KeyCreationParams,
};
use crate::tpm::pcr::{parse_pcr_selection_list, PcrProfile, PcrSelectionList};
use crate::tpm::device::Device;
use crate::tpm::types::{Handle, HashAlg, Public};
use crate::tpm::Tpm;
use clap::{Parser, Subcommand};
use eyre::{eyre, Result, WrapErr};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const TPM_ENV_VAR: &str = "TCTI";
const DISK_KEY_SIZE: usize = 64;

fn parse_handle(s: &str) -> Result<Handle, String> {
    if s == "none" {
        return Ok(Handle::NULL);
    }
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(digits, 16)
        .map(Handle)
        .map_err(|e| format!("invalid handle `{}`: {}", s, e))
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TPM device specified in TCTI format
    #[arg(short = 'T', long, default_value = "device:/dev/tpmrm0", env = TPM_ENV_VAR)]
    tcti: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a disk key and seal it to the TPM, optionally formatting a
    /// LUKS2 container with it
    Seal {
        /// Where to write the sealed key file
        #[arg(value_name = "KEY FILE")]
        key_file: PathBuf,
        /// Where to write the authorization key needed to update the policy
        #[arg(long, value_name = "FILE")]
        auth_key: PathBuf,
        /// YAML file of acceptable PCR values. Defaults to the current values
        /// of `--pcrs`
        #[arg(long, value_name = "FILE")]
        profile: Option<PathBuf>,
        /// PCRs to seal to when no profile is given
        #[arg(short, long, value_name = "PCR List", default_value = "sha256:0,2,4,7", value_parser = parse_pcr_selection_list)]
        pcrs: PcrSelectionList,
        /// NV index of a revocation counter (e.g. `0x01810001`), or `none`.
        /// Counter policies need TPM2_PolicyNV, which the ESAPI bindings lack
        #[arg(long, default_value = "none", value_parser = parse_handle)]
        counter: Handle,
        #[arg(long, env = "TPM_KEYSEAL_PIN")]
        pin: Option<String>,
        /// Seal for the TPM with this storage root key instead (YAML); the
        /// key file must then be imported there
        #[arg(long, value_name = "FILE")]
        srk_public: Option<PathBuf>,
        /// Block device to format as a LUKS2 container with the new key
        #[arg(long)]
        device: Option<String>,
        #[arg(long, default_value = "data")]
        label: String,
    },
    /// Bind an importable key file to this TPM
    Import {
        #[arg(value_name = "KEY FILE")]
        key_file: PathBuf,
    },
    /// Replace a key file's PCR policy without resealing
    UpdatePolicy {
        #[arg(value_name = "KEY FILE")]
        key_file: PathBuf,
        #[arg(long, value_name = "FILE")]
        auth_key: PathBuf,
        #[arg(long, value_name = "FILE")]
        profile: Option<PathBuf>,
        #[arg(short, long, value_name = "PCR List", default_value = "sha256:0,2,4,7", value_parser = parse_pcr_selection_list)]
        pcrs: PcrSelectionList,
    },
    /// Invalidate every PCR policy older than the key file's
    Revoke {
        #[arg(value_name = "KEY FILE")]
        key_file: PathBuf,
        #[arg(long, value_name = "FILE")]
        auth_key: PathBuf,
    },
    /// Unseal a key from the TPM and use it to activate a LUKS device
    Activate {
        /// Device mapper name, e.g. `crypt_root`
        #[arg(value_name = "name")]
        volume: String,
        #[arg(value_name = "SOURCE")]
        source: String,
        #[arg(value_name = "KEY FILE")]
        key_file: PathBuf,
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Read the PIN from this file before prompting
        #[arg(long, value_name = "FILE")]
        pin_file: Option<PathBuf>,
    },
    /// Activate a LUKS device with a recovery key
    Recover {
        #[arg(value_name = "name")]
        volume: String,
        #[arg(value_name = "SOURCE")]
        source: String,
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Read the recovery key from this file before prompting
        #[arg(long, value_name = "FILE")]
        recovery_key_file: Option<PathBuf>,
    },
    /// Show PCR digest for current running system
    Digest {
        #[arg(short, long, value_name = "PCR List", default_value = "sha256:0,2,4,7", value_parser = parse_pcr_selection_list)]
        pcrs: PcrSelectionList,
    },
    /// Check a key file against this TPM without unsealing it
    Validate {
        #[arg(value_name = "KEY FILE")]
        key_file: PathBuf,
    },
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self.command);
        if let Commands::Recover {
            volume,
            source,
            config,
            recovery_key_file,
        } = &self.command
        {
            recover(volume, source, config.as_deref(), recovery_key_file.as_deref())?;
            return Ok(self);
        }
        let mut tpm = Device::open(Some(&self.tcti))
            .wrap_err_with(|| format!("cannot open TPM {}", self.tcti))?;
        self.dispatch(&mut tpm)?;
        Ok(self)
    }

    fn dispatch(&self, tpm: &mut dyn Tpm) -> Result<()> {
        match &self.command {
            Commands::Seal {
                key_file,
                auth_key,
                profile,
                pcrs,
                counter,
                pin,
                srk_public,
                device,
                label,
            } => {
                let profile = load_profile(tpm, profile.as_deref(), pcrs)?;
                let params = KeyCreationParams {
                    pcr_profile: profile,
                    pcr_policy_counter_handle: *counter,
                    pin: pin.clone(),
                };
                let mut key = Zeroizing::new(vec![0u8; DISK_KEY_SIZE]);
                OsRng.fill_bytes(&mut key);

                let auth = match srk_public {
                    Some(srk_public) => {
                        let srk: Public = serde_yaml::from_reader(File::open(srk_public)?)?;
                        seal_key_to_external_tpm(&srk, &key, key_file, &params)?
                    }
                    None => seal_key_to_tpm(tpm, &key, key_file, &params)?,
                };
                save_auth_key(auth_key, &auth)?;

                if let Some(device) = device {
                    let recovery = RecoveryKey::generate();
                    let mut luks = LuksManager::new(SystemExec);
                    luks.initialize_luks2_container(device, label, &key)?;
                    luks.add_recovery_key_to_luks2_container(device, &key, &recovery)?;
                    println!("Recovery key: {}", recovery);
                }
            }
            Commands::Import { key_file } => {
                let mut key = SealedKeyObject::read_from_file(key_file)?;
                key.import(tpm)?;
                key.write_to_file(key_file)?;
            }
            Commands::UpdatePolicy {
                key_file,
                auth_key,
                profile,
                pcrs,
            } => {
                let profile = load_profile(tpm, profile.as_deref(), pcrs)?;
                let auth = load_auth_key(auth_key)?;
                update_key_pcr_protection_policy(tpm, key_file, &auth, &profile)?;
            }
            Commands::Revoke { key_file, auth_key } => {
                let auth = load_auth_key(auth_key)?;
                SealedKeyObject::read_from_file(key_file)?.revoke_old_pcr_protection_policies(tpm, &auth)?;
            }
            Commands::Activate {
                volume,
                source,
                key_file,
                config,
                pin_file,
            } => {
                let config = ActivationConfig::load(config.as_deref())?;
                let cache = SecretCache::new();
                let mut activator = Activator::new(SystemExec, config.tools.clone(), cache.writer());
                let mut pin = pin_file.as_ref().map(File::open).transpose()?;
                let reader = pin.as_mut().map(|f| f as &mut dyn Read);
                match activator.with_sealed_key(tpm, volume, source, key_file, reader, &config.sealed_key) {
                    Ok(()) => log::info!("Activated {} as {}", source, volume),
                    Err(e) if e.activated() => log::warn!("{}", e),
                    Err(e) => return Err(e.into()),
                }
            }
            Commands::Recover {
                volume,
                source,
                config,
                recovery_key_file,
            } => recover(volume, source, config.as_deref(), recovery_key_file.as_deref())?,
            Commands::Digest { pcrs } => {
                let values = tpm.pcr_read(pcrs)?;
                println!(
                    "Current PCR Digest: {}",
                    values.composite_digest(HashAlg::Sha256, pcrs)?
                );
            }
            Commands::Validate { key_file } => {
                let key = SealedKeyObject::read_from_file(key_file)?;
                match key.data().validate_data(tpm)? {
                    Some(counter) => println!(
                        "{} is valid (version {}, PCR policy counter {})",
                        key_file.display(),
                        key.version(),
                        counter.handle()
                    ),
                    None => println!("{} is valid (version {})", key_file.display(), key.version()),
                }
            }
        };
        Ok(())
    }
}

fn recover(volume: &str, source: &str, config: Option<&Path>, key_file: Option<&Path>) -> Result<()> {
    let config = ActivationConfig::load(config)?;
    let cache = SecretCache::new();
    let mut activator = Activator::new(SystemExec, config.tools.clone(), cache.writer());
    let mut key = key_file.map(File::open).transpose()?;
    let reader = key.as_mut().map(|f| f as &mut dyn Read);
    activator.with_recovery_key(volume, source, reader, &config.recovery_key)?;
    log::info!("Activated {} as {} with recovery key", source, volume);
    Ok(())
}

/// The profile in `path`, or the current values of `pcrs`.
fn load_profile(tpm: &mut dyn Tpm, path: Option<&Path>, pcrs: &PcrSelectionList) -> Result<PcrProfile> {
    if let Some(path) = path {
        return Ok(load_pcr_profile(path)?);
    }
    let values = tpm.pcr_read(pcrs)?;
    let mut profile = PcrProfile::default();
    for selection in pcrs.selections() {
        for pcr in &selection.pcrs {
            let value = values
                .get(selection.hash, *pcr)
                .cloned()
                .ok_or_else(|| eyre!("TPM returned no value for PCR {} in bank {}", pcr, selection.hash))?;
            profile.add_values(selection.hash, *pcr, Some(value));
        }
    }
    Ok(profile)
}

fn save_auth_key(path: &Path, key: &AuthPrivateKey) -> Result<()> {
    let encoded = Zeroizing::new(hex::encode(key.to_bytes()));
    std::fs::write(path, encoded.as_bytes())
        .wrap_err_with(|| format!("cannot write authorization key to {}", path.display()))?;
    log::info!("Authorization key written to {}", path.display());
    Ok(())
}

fn load_auth_key(path: &Path) -> Result<AuthPrivateKey> {
    let encoded = Zeroizing::new(
        std::fs::read_to_string(path)
            .wrap_err_with(|| format!("cannot read authorization key from {}", path.display()))?,
    );
    let bytes = Zeroizing::new(hex::decode(encoded.trim())?);
    AuthPrivateKey::from_slice(&bytes).map_err(|_| eyre!("{} is not a P-256 private key", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::sim::Simulator;
    use eyre::Result;

    #[test]
    fn parse_handles() {
        assert_eq!(parse_handle("0x01810001"), Ok(Handle(0x0181_0001)));
        assert_eq!(parse_handle("01810001"), Ok(Handle(0x0181_0001)));
        assert_eq!(parse_handle("none"), Ok(Handle::NULL));
        assert!(parse_handle("0xzz").is_err());
    }

    #[test]
    fn auth_key_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("auth");
        let key = AuthPrivateKey::random(&mut OsRng);
        save_auth_key(&path, &key)?;
        assert_eq!(load_auth_key(&path)?.to_bytes(), key.to_bytes());

        std::fs::write(&path, "00")?;
        assert!(load_auth_key(&path).is_err());
        Ok(())
    }

    #[test]
    fn profile_from_current_values() -> Result<()> {
        let mut tpm = Simulator::new();
        tpm.pcr_event(7, b"boot")?;
        let pcrs = parse_pcr_selection_list("sha256:4,7")?;
        let profile = load_profile(&mut tpm, None, &pcrs)?;
        let combinations = profile.combinations();
        assert_eq!(combinations.len(), 1);
        assert_eq!(combinations[0], tpm.pcr_read(&pcrs)?);
        Ok(())
    }

    #[test]
    fn cli_parses() -> Result<()> {
        let cli = Cli::try_parse_from([
            "tpm-keyseal",
            "--tcti",
            "swtpm:port=2321",
            "seal",
            "key",
            "--auth-key",
            "auth",
        ])?;
        assert_eq!(cli.tcti, "swtpm:port=2321");
        match cli.command {
            Commands::Seal { counter, label, .. } => {
                assert!(counter.is_null());
                assert_eq!(label, "data");
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["tpm-keyseal", "seal", "key", "--auth-key", "auth", "--counter", "0x01810001"])?;
        match cli.command {
            Commands::Seal { counter, .. } => assert_eq!(counter, Handle(0x0181_0001)),
            other => panic!("unexpected command {:?}", other),
        }
        Ok(())
    }
}
