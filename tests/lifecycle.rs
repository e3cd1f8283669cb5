mod common;

use common::*;
use eyre::Result;
use tpm_keyseal::keydata::{KeyDataError, SealedKeyObject};
use tpm_keyseal::seal::{seal_key_to_external_tpm, update_key_pcr_protection_policy, KeyCreationParams};
use tpm_keyseal::tpm::get_or_create_srk;
use tpm_keyseal::tpm::sim::Simulator;
use tpm_keyseal::tpm::types::Handle;
use tpm_keyseal::unseal::UnsealError;

#[test]
fn update_policy_after_boot_change() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let key_path = dir.path().join("key");
    let mut tpm = Simulator::new();
    let auth_key = seal(&mut tpm, &key_path, None)?;

    let counter = SealedKeyObject::read_from_file(&key_path)?.data().validate_data(&mut tpm)?;
    assert_eq!(counter.map(|c| c.handle()), Some(COUNTER));

    tpm.pcr_event(7, b"new bootloader")?;
    let key = SealedKeyObject::read_from_file(&key_path)?;
    assert!(matches!(key.unseal_from_tpm(&mut tpm, ""), Err(UnsealError::InvalidKeyData(_))));

    let profile = current_profile(&mut tpm)?;
    update_key_pcr_protection_policy(&mut tpm, &key_path, &auth_key, &profile)?;
    let key = SealedKeyObject::read_from_file(&key_path)?;
    key.data().validate_data(&mut tpm)?;
    assert_eq!(key.unseal_from_tpm(&mut tpm, "")?.as_slice(), DISK_KEY);
    Ok(())
}

#[test]
fn revoke_old_policies() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let key_path = dir.path().join("key");
    let old_path = dir.path().join("key.old");
    let mut tpm = Simulator::new();
    let auth_key = seal(&mut tpm, &key_path, None)?;
    std::fs::copy(&key_path, &old_path)?;

    let profile = current_profile(&mut tpm)?;
    update_key_pcr_protection_policy(&mut tpm, &key_path, &auth_key, &profile)?;

    // both policies are accepted until the old one is revoked
    let old = SealedKeyObject::read_from_file(&old_path)?;
    assert!(old.unseal_from_tpm(&mut tpm, "").is_ok());

    let key = SealedKeyObject::read_from_file(&key_path)?;
    key.revoke_old_pcr_protection_policies(&mut tpm, &auth_key)?;
    assert_eq!(key.unseal_from_tpm(&mut tpm, "")?.as_slice(), DISK_KEY);

    let err = old.unseal_from_tpm(&mut tpm, "").err().map(|e| e.to_string());
    assert_eq!(
        err.as_deref(),
        Some(
            "invalid key data file: cannot complete authorization policy assertions: \
             the PCR policy has been revoked"
        )
    );
    Ok(())
}

#[test]
fn external_seal_and_import() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let key_path = dir.path().join("key");
    let mut tpm = Simulator::new();
    let srk_public = get_or_create_srk(&mut tpm, b"")?;

    let params = KeyCreationParams {
        pcr_profile: current_profile(&mut tpm)?,
        pcr_policy_counter_handle: Handle::NULL,
        pin: None,
    };
    seal_key_to_external_tpm(&srk_public, DISK_KEY, &key_path, &params)?;

    let mut key = SealedKeyObject::read_from_file(&key_path)?;
    assert_eq!(key.version(), 2);
    assert!(matches!(
        key.unseal_from_tpm(&mut tpm, ""),
        Err(UnsealError::InvalidKeyData(KeyDataError::Importable))
    ));

    key.import(&mut tpm)?;
    key.write_to_file(&key_path)?;

    let key = SealedKeyObject::read_from_file(&key_path)?;
    assert_eq!(key.version(), 1);
    assert_eq!(key.data().validate_data(&mut tpm)?.map(|c| c.handle()), None);
    assert_eq!(key.unseal_from_tpm(&mut tpm, "")?.as_slice(), DISK_KEY);
    Ok(())
}

#[test]
fn tpm_state_survives_save_and_open() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let key_path = dir.path().join("key");
    let state_path = dir.path().join("tpm.yaml");
    let mut tpm = Simulator::new();
    seal(&mut tpm, &key_path, Some("1234"))?;
    tpm.save(&state_path)?;

    let mut reopened = Simulator::open(&state_path)?;
    let key = SealedKeyObject::read_from_file(&key_path)?;
    key.data().validate_data(&mut reopened)?;
    assert_eq!(key.unseal_from_tpm(&mut reopened, "1234")?.as_slice(), DISK_KEY);
    Ok(())
}
