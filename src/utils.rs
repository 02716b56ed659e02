use chrono::{DateTime, Utc};

/// Seconds since the epoch to a UTC time; out-of-range values clamp to the epoch.
pub fn unix_to_datetime(ts: u64) -> DateTime<Utc> {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_default()
}

/// `10^decimals` as a U256, `None` when it does not fit.
pub fn pow10(decimals: u8) -> Option<alloy_primitives::U256> {
    alloy_primitives::U256::from(10u8).checked_pow(alloy_primitives::U256::from(decimals))
}

/// Field values keyed by field name, values as base-10 strings.
pub mod serde_fields {
    use std::str::FromStr;

    use alloy_primitives::U256;
    use indexmap::IndexMap;
    use serde::{
        de::{Deserialize, Deserializer},
        ser::{Serialize, Serializer},
    };

    use crate::history::FieldName;

    pub fn serialize<S: Serializer>(
        fields: &IndexMap<FieldName, U256>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        fields
            .iter()
            .map(|(name, value)| (*name, value.to_string()))
            .collect::<IndexMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<IndexMap<FieldName, U256>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: IndexMap<FieldName, String> = Deserialize::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(name, value)| {
                U256::from_str(&value)
                    .map(|v| (name, v))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// Lead maps keyed by address, stored as a plain list of leads.
pub mod serde_lead_map {
    use std::collections::BTreeMap;

    use alloy_primitives::Address;
    use serde::{
        de::{Deserialize, Deserializer},
        ser::{Serialize, Serializer},
    };

    use crate::leads::Lead;

    pub fn serialize<S: Serializer>(
        leads: &BTreeMap<Address, Lead>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        leads.values().collect::<Vec<_>>().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<Address, Lead>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let leads: Vec<Lead> = Deserialize::deserialize(deserializer)?;
        Ok(leads.into_iter().map(|l| (l.address, l)).collect())
    }
}

/// Feature sets keyed by address, stored as a plain list.
pub mod serde_feature_map {
    use std::collections::BTreeMap;

    use alloy_primitives::Address;
    use serde::{
        de::{Deserialize, Deserializer},
        ser::{Serialize, Serializer},
    };

    use crate::classify::FeatureSet;

    pub fn serialize<S: Serializer>(
        features: &BTreeMap<Address, FeatureSet>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        features.values().collect::<Vec<_>>().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<Address, FeatureSet>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let features: Vec<FeatureSet> = Deserialize::deserialize(deserializer)?;
        Ok(features.into_iter().map(|f| (f.address, f)).collect())
    }
}
