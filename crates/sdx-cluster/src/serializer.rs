//! Wire codec for deltas, operations and timestamps.

use crate::error::{ClusterError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON codec shared by every component of a node.
#[derive(Clone, Copy, Debug, Default)]
pub struct Serializer;

impl Serializer {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            ClusterError::Serialization(format!(
                "cannot decode {}: {}",
                std::any::type_name::<T>(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdx_core::orset::{OrSet, OrSetDelta, OrSetOperation};
    use sdx_core::ormap::{OrMap, OrMapDelta, OrMapOperation};
    use sdx_core::lwwreg::{LwwDelta, LwwRegistry};

    #[test]
    fn test_every_delta_variant_round_trips() {
        let codec = Serializer;

        let mut set = OrSet::new();
        let set_deltas = vec![
            set.add("a", "x".to_string()),
            set.remove("a", &"x".to_string()).unwrap(),
        ];
        let decoded: Vec<OrSetDelta<String>> = codec.decode(&codec.encode(&set_deltas).unwrap()).unwrap();
        assert_eq!(decoded, set_deltas);

        let mut reg = LwwRegistry::new();
        let reg_deltas = vec![
            reg.try_set("a", 1u32, "v".to_string(), 1).unwrap(),
            reg.try_remove("a", 1u32, 2).unwrap(),
        ];
        let decoded: Vec<LwwDelta<u32, String>> = codec.decode(&codec.encode(&reg_deltas).unwrap()).unwrap();
        assert_eq!(decoded, reg_deltas);

        let mut map: OrMap<String, OrSet<u8>> = OrMap::new();
        let (_, mut map_deltas) = map.try_mutate("a", "k".to_string(), |s| ((), vec![s.add("a", 1)]));
        map_deltas.push(map.remove("a", &"k".to_string()).unwrap());
        let decoded: Vec<OrMapDelta<String, OrSetDelta<u8>>> =
            codec.decode(&codec.encode(&map_deltas).unwrap()).unwrap();
        assert_eq!(decoded, map_deltas);
    }

    #[test]
    fn test_nested_map_operation_round_trips() {
        let codec = Serializer;
        let op: OrMapOperation<String, OrSetOperation<String>> = OrMapOperation::Mutate {
            key: "admins".to_string(),
            op: OrSetOperation::Add { item: "bob".to_string() },
        };
        let decoded: OrMapOperation<String, OrSetOperation<String>> =
            codec.decode(&codec.encode(&op).unwrap()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let codec = Serializer;
        let bytes = codec.encode(&"not a delta").unwrap();
        let err = codec.decode::<Vec<OrSetDelta<String>>>(&bytes).unwrap_err();
        assert!(matches!(err, ClusterError::Serialization(_)));
    }
}
