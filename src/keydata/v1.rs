use super::{read_sized_public, write_sized_public};
use crate::mu::{self, Marshal, Reader, Unmarshal, Writer};
use crate::policy::{DynamicPolicyData, StaticPolicyData};
use crate::tpm::types::{Private, Public};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDataV1 {
    pub key_private: Private,
    pub key_public: Public,
    pub static_policy_data: StaticPolicyData,
    pub dynamic_policy_data: DynamicPolicyData,
}

pub(super) fn write_static(w: &mut Writer, data: &StaticPolicyData) {
    data.auth_public_key.marshal(w);
    data.pcr_policy_counter_handle.marshal(w);
}

pub(super) fn read_static(r: &mut Reader<'_>) -> mu::Result<StaticPolicyData> {
    const T: &str = "StaticPolicyDataV1";
    Ok(StaticPolicyData {
        auth_public_key: r.read_field(T, "auth_public_key")?,
        pcr_policy_counter_handle: r.read_field(T, "pcr_policy_counter_handle")?,
        v0_counter_auth_policies: Vec::new(),
    })
}

impl Marshal for KeyDataV1 {
    fn marshal(&self, w: &mut Writer) {
        self.key_private.marshal(w);
        write_sized_public(w, &self.key_public);
        write_static(w, &self.static_policy_data);
        self.dynamic_policy_data.marshal(w);
    }
}

impl Unmarshal for KeyDataV1 {
    fn unmarshal(r: &mut Reader<'_>) -> mu::Result<Self> {
        const T: &str = "KeyDataV1";
        Ok(Self {
            key_private: r.read_field(T, "key_private")?,
            key_public: r.field(T, "key_public", read_sized_public)?,
            static_policy_data: r.field(T, "static_policy_data", read_static)?,
            dynamic_policy_data: r.read_field(T, "dynamic_policy_data")?,
        })
    }
}
