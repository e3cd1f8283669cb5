use super::types::{Digest, HashAlg};
use crate::mu::{self, ErrorKind, Marshal, Reader, Unmarshal, Writer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

pub const MAX_PCR: u8 = 23;

#[derive(Error, Debug, PartialEq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least on selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR selection list specification `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
    #[error("no value for PCR {pcr} in bank {bank}")]
    MissingValue { bank: HashAlg, pcr: u8 },
    #[error("value for PCR {pcr} in bank {bank} has the wrong size")]
    InvalidValueSize { bank: HashAlg, pcr: u8 },
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

fn parse_pcr_bank(bank: &str) -> Result<HashAlg> {
    HashAlg::parse(bank).ok_or_else(|| PcrError::InvalidPcrBank(bank.to_string()))
}

fn parse_slot(slot: &str) -> Result<u8> {
    match slot.parse::<u8>() {
        Ok(pcr) if pcr <= MAX_PCR && !slot.starts_with('+') => Ok(pcr),
        _ => Err(PcrError::InvalidPcrSlot(slot.to_string())),
    }
}

fn parse_slots(slots: &str) -> Result<BTreeSet<u8>> {
    slots.split(',').map(parse_slot).collect()
}

/// Parses a selection such as `sha256:0,7` or `sha256:7+sha384:4`.
pub fn parse_pcr_selection_list(expression: &str) -> Result<PcrSelectionList> {
    let mut selections = Vec::new();
    for part in expression.split('+') {
        let (bank, slots) = part
            .split_once(':')
            .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
        let hash = parse_pcr_bank(bank)?;
        let pcrs = parse_slots(slots)?;
        selections.push(PcrSelection { hash, pcrs });
    }
    let list = PcrSelectionList(selections);
    if list.is_empty() {
        return Err(PcrError::EmptyPcrSelectionList);
    }
    Ok(list)
}

/// PCRs selected from a single bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    pub hash: HashAlg,
    pub pcrs: BTreeSet<u8>,
}

impl Marshal for PcrSelection {
    fn marshal(&self, w: &mut Writer) {
        self.hash.marshal(w);
        let size = self
            .pcrs
            .iter()
            .next_back()
            .map(|max| *max as usize / 8 + 1)
            .unwrap_or(0)
            .max(3);
        let mut bitmap = vec![0u8; size];
        for pcr in &self.pcrs {
            bitmap[*pcr as usize / 8] |= 1 << (pcr % 8);
        }
        w.write_u8(size as u8);
        w.write_raw(&bitmap);
    }
}

impl Unmarshal for PcrSelection {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        const T: &str = "PcrSelection";
        let hash = r.read_field(T, "hash")?;
        let bitmap = r.field(T, "select", |r| {
            let size = r.read_u8()? as usize;
            if size > r.remaining() {
                return Err(mu::Error::new("PcrSelect", ErrorKind::SizeTooLarge));
            }
            let mut bitmap = Vec::with_capacity(size);
            for _ in 0..size {
                bitmap.push(r.read_u8()?);
            }
            Ok(bitmap)
        })?;
        let pcrs = bitmap
            .iter()
            .enumerate()
            .flat_map(|(i, octet)| {
                (0..8u8)
                    .filter(move |bit| octet & (1 << bit) != 0)
                    .map(move |bit| (i * 8) as u8 + bit)
            })
            .collect();
        Ok(Self { hash, pcrs })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrSelectionList(pub Vec<PcrSelection>);

impl PcrSelectionList {
    /// Whether no PCR is selected in any bank.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|s| s.pcrs.is_empty())
    }

    pub fn selections(&self) -> &[PcrSelection] {
        &self.0
    }
}

impl fmt::Display for PcrSelectionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .0
            .iter()
            .map(|s| {
                let pcrs = s
                    .pcrs
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{}:{}", s.hash, pcrs)
            })
            .collect::<Vec<_>>();
        f.write_str(&parts.join("+"))
    }
}

impl Marshal for PcrSelectionList {
    fn marshal(&self, w: &mut Writer) {
        self.0.marshal(w)
    }
}

impl Unmarshal for PcrSelectionList {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        Ok(Self(Vec::unmarshal(r)?))
    }
}

/// PCR values by bank and index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PcrValues(pub BTreeMap<HashAlg, BTreeMap<u8, Digest>>);

impl PcrValues {
    pub fn get(&self, bank: HashAlg, pcr: u8) -> Option<&Digest> {
        self.0.get(&bank).and_then(|b| b.get(&pcr))
    }

    pub fn set(&mut self, bank: HashAlg, pcr: u8, value: Digest) {
        self.0.entry(bank).or_default().insert(pcr, value);
    }

    /// The composite digest of the selected values, in selection order.
    pub fn composite_digest(&self, alg: HashAlg, selection: &PcrSelectionList) -> Result<Digest> {
        let mut h = alg.hasher();
        for s in selection.selections() {
            for pcr in &s.pcrs {
                let value = self.get(s.hash, *pcr).ok_or(PcrError::MissingValue {
                    bank: s.hash,
                    pcr: *pcr,
                })?;
                if value.len() != s.hash.size() {
                    return Err(PcrError::InvalidValueSize {
                        bank: s.hash,
                        pcr: *pcr,
                    });
                }
                h.update(value);
            }
        }
        Ok(h.finalize())
    }
}

/// The acceptable values of each PCR, as supplied by whatever knows how the
/// platform boots. Every combination of one value per PCR is a branch of the
/// resulting policy.
///
/// ```yaml
/// sha256:
///   7:
///     - "3d458cfe55cc03ea1f443f1562beec8df51c75e14a9fcf9a7234a13f198e7969"
///   12:
///     - "0000000000000000000000000000000000000000000000000000000000000000"
///     - "4bf5122f344554c53bde2ebb8cd2b7e3d1600ad631c385a5d7cce23c7785459a"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PcrProfile(pub BTreeMap<HashAlg, BTreeMap<u8, Vec<Digest>>>);

impl PcrProfile {
    pub fn add_values(&mut self, bank: HashAlg, pcr: u8, values: impl IntoIterator<Item = Digest>) {
        self.0
            .entry(bank)
            .or_default()
            .entry(pcr)
            .or_default()
            .extend(values);
    }

    pub fn selection(&self) -> PcrSelectionList {
        PcrSelectionList(
            self.0
                .iter()
                .map(|(hash, pcrs)| PcrSelection {
                    hash: *hash,
                    pcrs: pcrs.keys().copied().collect(),
                })
                .collect(),
        )
    }

    /// Every combination of values, with the first PCR varying fastest. A
    /// profile with no PCRs has exactly one (empty) combination, and a PCR
    /// with no acceptable values leaves none.
    pub fn combinations(&self) -> Vec<PcrValues> {
        let mut rows = vec![PcrValues::default()];
        for (bank, pcrs) in &self.0 {
            for (pcr, values) in pcrs {
                let mut next = Vec::with_capacity(rows.len() * values.len());
                for value in values {
                    for row in &rows {
                        let mut row = row.clone();
                        row.set(*bank, *pcr, value.clone());
                        next.push(row);
                    }
                }
                rows = next;
            }
        }
        rows
    }

    /// The selection and the composite digest of every combination.
    pub fn compute_pcr_digests(&self, alg: HashAlg) -> Result<(PcrSelectionList, Vec<Digest>)> {
        let selection = self.selection();
        let digests = self
            .combinations()
            .iter()
            .map(|row| row.composite_digest(alg, &selection))
            .collect::<Result<Vec<_>>>()?;
        Ok((selection, digests))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn digest(b: u8) -> Digest {
        Digest::new(vec![b; 32])
    }

    #[test]
    fn parse_no_bank_delimiter() {
        let parsed = parse_pcr_selection_list("1,2,3");
        assert_eq!(
            parsed,
            Err(PcrError::InvalidPcrSelectionString("1,2,3".to_string()))
        );
    }

    #[test]
    fn parse_no_bank() {
        let parsed = parse_pcr_selection_list(":1,2,3");
        assert_eq!(parsed, Err(PcrError::InvalidPcrBank("".to_string())));
    }

    #[test]
    fn parse_bad_bank() {
        let parsed = parse_pcr_selection_list("bunk:1,2,3");
        assert_eq!(parsed, Err(PcrError::InvalidPcrBank("bunk".to_string())));
    }

    #[test]
    fn parse_no_selections() {
        let parsed = parse_pcr_selection_list("sha256:");
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_bad_slot() {
        let parsed = parse_pcr_selection_list("sha256:1,bad,2");
        assert_eq!(parsed, Err(PcrError::InvalidPcrSlot("bad".to_string())));
    }

    #[test]
    fn parse_out_of_range_slot() {
        let parsed = parse_pcr_selection_list("sha256:1,24");
        assert_eq!(parsed, Err(PcrError::InvalidPcrSlot("24".to_string())));
    }

    #[test]
    fn parse_happy_sha256() -> Result<()> {
        let parsed = parse_pcr_selection_list("sha256:7,0,12+sha384:4")?;
        assert_eq!(parsed.to_string(), "sha256:0,7,12+sha384:4");
        assert_eq!(parsed.selections()[0].pcrs.len(), 3);
        Ok(())
    }

    #[test]
    fn selection_wire_format() -> Result<()> {
        let list = parse_pcr_selection_list("sha256:0,7,12")?;
        let bytes = mu::marshal_to_vec(&list)?;
        assert_eq!(
            bytes,
            vec![0, 0, 0, 1, 0x00, 0x0b, 3, 0b1000_0001, 0b0001_0000, 0]
        );
        let decoded: PcrSelectionList = mu::unmarshal_from_bytes("PcrSelectionList", &bytes)?;
        assert_eq!(decoded, list);
        Ok(())
    }

    #[test]
    fn combinations_first_pcr_fastest() {
        let mut profile = PcrProfile::default();
        profile.add_values(HashAlg::Sha256, 4, [digest(1), digest(2)]);
        profile.add_values(HashAlg::Sha256, 7, [digest(3), digest(4)]);
        let rows = profile.combinations();
        let pairs = rows
            .iter()
            .map(|r| {
                (
                    r.get(HashAlg::Sha256, 4).map(|d| d[0]),
                    r.get(HashAlg::Sha256, 7).map(|d| d[0]),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![
                (Some(1), Some(3)),
                (Some(2), Some(3)),
                (Some(1), Some(4)),
                (Some(2), Some(4)),
            ]
        );
    }

    #[test]
    fn empty_profile_has_one_row() -> Result<()> {
        let (selection, digests) = PcrProfile::default().compute_pcr_digests(HashAlg::Sha256)?;
        assert!(selection.is_empty());
        assert_eq!(digests, vec![HashAlg::Sha256.hash(&[])]);
        Ok(())
    }

    #[test]
    fn pcr_without_values_has_no_rows() -> Result<()> {
        let mut profile = PcrProfile::default();
        profile.add_values(HashAlg::Sha256, 4, [digest(1)]);
        profile.add_values(HashAlg::Sha256, 7, Vec::<Digest>::new());
        let (_, digests) = profile.compute_pcr_digests(HashAlg::Sha256)?;
        assert!(digests.is_empty());
        Ok(())
    }

    #[test]
    fn profile_from_yaml() -> Result<()> {
        let yaml = format!("sha256:\n  7:\n    - \"{}\"\n    - \"{}\"\n", digest(1), digest(2));
        let profile: PcrProfile = serde_yaml::from_str(&yaml)?;
        assert_eq!(profile.combinations().len(), 2);
        assert_eq!(profile.selection().to_string(), "sha256:7");
        Ok(())
    }

    #[test]
    fn short_value_is_rejected() {
        let mut profile = PcrProfile::default();
        profile.add_values(HashAlg::Sha256, 7, [Digest::new(vec![1; 20])]);
        assert_eq!(
            profile.compute_pcr_digests(HashAlg::Sha256).err(),
            Some(PcrError::InvalidValueSize {
                bank: HashAlg::Sha256,
                pcr: 7
            })
        );
    }
}
