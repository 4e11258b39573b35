//! Deserialization helpers that enforce invariants serde's derive cannot express on its own.

use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use serde::{de::Error as _, Deserialize, Deserializer};
use serde_json::Value;
use snafu::ensure;
use std::collections::HashMap;
use std::fmt;

/// Validates the key ID for each key during deserialization and fails if any don't match, or if
/// two keys in the same table claim the same ID.
pub(super) fn deserialize_keys<'de, D>(
    deserializer: D,
) -> Result<HashMap<Decoded<Hex>, Key>, D::Error>
where
    D: Deserializer<'de>,
{
    fn validate_and_insert_entry(
        keyid: Decoded<Hex>,
        key: Key,
        map: &mut HashMap<Decoded<Hex>, Key>,
    ) -> Result<(), crate::error::Error> {
        let calculated = crate::crypto::key_id(&key)?;
        let keyid_hex = hex::encode(&keyid);
        ensure!(
            keyid.as_ref() == calculated.as_slice(),
            crate::error::InvalidKeyIdSnafu {
                keyid: &keyid_hex,
                calculated: hex::encode(&calculated),
            }
        );
        ensure!(
            map.insert(keyid, key).is_none(),
            crate::error::DuplicateKeyIdSnafu { keyid: keyid_hex }
        );
        Ok(())
    }

    struct Visitor;

    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = HashMap<Decoded<Hex>, Key>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a map of key ID to key")
        }

        fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
        where
            M: serde::de::MapAccess<'de>,
        {
            let mut map = HashMap::new();
            while let Some((keyid, key)) = access.next_entry()? {
                validate_and_insert_entry(keyid, key, &mut map).map_err(M::Error::custom)?;
            }
            Ok(map)
        }
    }

    deserializer.deserialize_map(Visitor)
}

/// Deserializes the `#[serde(flatten)]` catch-all field on a role payload, discarding the `_type`
/// tag entry that the role's own `#[serde(tag = "_type")]` already consumed a copy of. Without
/// this, re-serializing the struct would duplicate the type tag inside the flattened map.
pub(super) fn extra_skip_type<'de, D>(deserializer: D) -> Result<HashMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut map = HashMap::<String, Value>::deserialize(deserializer)?;
    map.remove("_type");
    Ok(map)
}
