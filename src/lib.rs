//! Seal LUKS disk keys to a TPM behind signed, revocable PCR policies, and
//! activate volumes with them, falling back to a recovery key.
//!
//! # Get Started
//!
//! ```bash
//! tpm-keyseal --tpm-state tpm.yaml seal disk.key --auth-key disk.auth --device /dev/sda1
//! tpm-keyseal --tpm-state tpm.yaml activate data /dev/sda1 disk.key
//! ```

pub mod activate;
pub mod cli;
pub mod config;
pub mod exec;
pub mod keydata;
pub mod luks;
pub mod mu;
pub mod policy;
pub mod recovery;
pub mod seal;
pub mod tpm;
pub mod unseal;
