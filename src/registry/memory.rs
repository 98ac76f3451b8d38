//! In-process registry backend.
//!
//! Mirrors the contract's semantics: append-only, with the all-zero value
//! reserved. Also backs the CLI's `--registry-file` option.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::{KeyRegistry, RegistryKey, SENTINEL_KEY};
use crate::error::{ProvenanceError, RegistryCallError, Result};

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    entries: RwLock<HashMap<String, RegistryKey>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry directly, bypassing the append-only check.
    pub fn with_entry(self, identifier: impl Into<String>, key: RegistryKey) -> Self {
        self.entries.write().insert(identifier.into(), key);
        self
    }

    /// Parse a JSON object mapping identifiers to hex-encoded keys.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, String> = serde_json::from_str(json)
            .map_err(|e| ProvenanceError::Config(format!("Failed to parse registry file: {}", e)))?;

        let mut entries = HashMap::with_capacity(raw.len());
        for (identifier, hex_key) in raw {
            let key = decode_key(&hex_key).ok_or_else(|| {
                ProvenanceError::Config(format!(
                    "Registry entry '{}' is not a 32-byte hex key",
                    identifier
                ))
            })?;
            entries.insert(identifier, key);
        }

        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> String {
        let sorted: BTreeMap<String, String> = self
            .entries
            .read()
            .iter()
            .map(|(id, key)| (id.clone(), hex::encode(key)))
            .collect();
        // Keys and values are plain strings; serialization cannot fail.
        serde_json::to_string_pretty(&sorted).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json())?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn decode_key(hex_key: &str) -> Option<RegistryKey> {
    let hex_key = hex_key.trim();
    let hex_key = hex_key.strip_prefix("0x").unwrap_or(hex_key);
    hex::decode(hex_key).ok()?.try_into().ok()
}

impl KeyRegistry for InMemoryRegistry {
    fn resolve_key(&self, identifier: &str) -> std::result::Result<RegistryKey, RegistryCallError> {
        self.entries
            .read()
            .get(identifier)
            .copied()
            .ok_or(RegistryCallError::NotFound)
    }

    fn publish_key(
        &self,
        identifier: &str,
        public_key: &RegistryKey,
    ) -> std::result::Result<(), RegistryCallError> {
        if *public_key == SENTINEL_KEY {
            return Err(RegistryCallError::Reverted(
                "the all-zero key is reserved".to_string(),
            ));
        }

        let mut entries = self.entries.write();
        match entries.get(identifier).copied() {
            Some(existing) if existing == *public_key => Ok(()),
            Some(existing) if existing != SENTINEL_KEY => Err(RegistryCallError::Reverted(
                format!("identifier '{}' already registered", identifier),
            )),
            _ => {
                entries.insert(identifier.to_string(), *public_key);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_resolve() {
        let registry = InMemoryRegistry::new();
        registry.publish_key("cam1", &[1u8; 32]).unwrap();
        assert_eq!(registry.resolve_key("cam1").unwrap(), [1u8; 32]);
        assert_eq!(
            registry.resolve_key("cam2"),
            Err(RegistryCallError::NotFound)
        );
    }

    #[test]
    fn test_publish_is_append_only() {
        let registry = InMemoryRegistry::new();
        registry.publish_key("cam1", &[1u8; 32]).unwrap();
        registry.publish_key("cam1", &[1u8; 32]).unwrap();
        assert!(matches!(
            registry.publish_key("cam1", &[2u8; 32]),
            Err(RegistryCallError::Reverted(_))
        ));
        assert_eq!(registry.resolve_key("cam1").unwrap(), [1u8; 32]);
    }

    #[test]
    fn test_publish_rejects_sentinel() {
        let registry = InMemoryRegistry::new();
        assert!(registry.publish_key("cam1", &SENTINEL_KEY).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sentinel_entry_can_be_bound() {
        let registry = InMemoryRegistry::new().with_entry("cam1", SENTINEL_KEY);
        registry.publish_key("cam1", &[4u8; 32]).unwrap();
        assert_eq!(registry.resolve_key("cam1").unwrap(), [4u8; 32]);
    }

    #[test]
    fn test_json_round_trip() {
        let registry = InMemoryRegistry::new()
            .with_entry("cam1", [0xabu8; 32])
            .with_entry("cam2", SENTINEL_KEY);
        let loaded = InMemoryRegistry::from_json(&registry.to_json()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.resolve_key("cam1").unwrap(), [0xabu8; 32]);
        assert_eq!(loaded.resolve_key("cam2").unwrap(), SENTINEL_KEY);
    }

    #[test]
    fn test_from_json_accepts_prefixed_hex() {
        let json = format!(r#"{{"cam1": "0x{}"}}"#, "11".repeat(32));
        let registry = InMemoryRegistry::from_json(&json).unwrap();
        assert_eq!(registry.resolve_key("cam1").unwrap(), [0x11u8; 32]);
    }

    #[test]
    fn test_from_json_rejects_short_key() {
        let result = InMemoryRegistry::from_json(r#"{"cam1": "abcd"}"#);
        assert!(matches!(result, Err(ProvenanceError::Config(_))));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        InMemoryRegistry::new()
            .with_entry("cam1", [5u8; 32])
            .save(&path)
            .unwrap();
        let loaded = InMemoryRegistry::from_file(&path).unwrap();
        assert_eq!(loaded.resolve_key("cam1").unwrap(), [5u8; 32]);
    }
}
