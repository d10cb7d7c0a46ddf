//! Provider schemas
//!
//! Schemas come from a catalogue embedded in the binary. A [`SchemaStore`]
//! is shared by every feature; loading a provider is a one-time operation
//! no matter how many directories require it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_REGISTRY_HOST: &str = "registry.terraform.io/";
const DEFAULT_NAMESPACE: &str = "hashicorp";

static CATALOGUE_JSON: &str = include_str!("../schemas/providers.json");

static CATALOGUE: Lazy<Result<BTreeMap<String, Arc<ProviderSchema>>, String>> = Lazy::new(|| {
    let schemas: Vec<ProviderSchema> =
        serde_json::from_str(CATALOGUE_JSON).map_err(|e| e.to_string())?;
    Ok(schemas
        .into_iter()
        .map(|schema| (schema.address.clone(), Arc::new(schema)))
        .collect())
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("embedded schema catalogue is invalid: {0}")]
    InvalidCatalogue(String),
}

/// Resource and data source types offered by one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSchema {
    pub address: String,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub data_sources: BTreeSet<String>,
}

impl ProviderSchema {
    pub fn has_resource(&self, resource_type: &str) -> bool {
        self.resources.contains(resource_type)
    }

    pub fn has_data_source(&self, data_type: &str) -> bool {
        self.data_sources.contains(data_type)
    }

    /// Local name of the provider, e.g. `aws` for `hashicorp/aws`
    pub fn local_name(&self) -> &str {
        local_name(&self.address)
    }
}

/// Normalize a provider source address to `namespace/type`
///
/// `aws` becomes `hashicorp/aws`; the default registry host is stripped.
pub fn normalize_address(addr: &str) -> String {
    let addr = addr.trim().trim_matches('"').to_ascii_lowercase();
    let addr = addr.strip_prefix(DEFAULT_REGISTRY_HOST).unwrap_or(&addr);
    if addr.contains('/') {
        addr.to_string()
    } else {
        format!("{DEFAULT_NAMESPACE}/{addr}")
    }
}

/// Type part of a provider address
pub fn local_name(addr: &str) -> &str {
    addr.rsplit('/').next().unwrap_or(addr)
}

/// Provider local name implied by a resource type, e.g. `aws` for `aws_instance`
pub fn implied_provider(resource_type: &str) -> &str {
    resource_type.split('_').next().unwrap_or(resource_type)
}

/// Loaded provider schemas
#[derive(Debug, Default)]
pub struct SchemaStore {
    loaded: DashMap<String, Arc<ProviderSchema>>,
    loads: AtomicU64,
}

impl SchemaStore {
    /// Create a new empty schema store
    pub fn new() -> Self {
        Self::default()
    }

    /// Required provider addresses that have not been loaded yet
    pub fn missing_schemas(&self, requirements: &BTreeSet<String>) -> Vec<String> {
        let missing: BTreeSet<String> = requirements
            .iter()
            .map(|addr| normalize_address(addr))
            .filter(|addr| !self.loaded.contains_key(addr))
            .collect();
        missing.into_iter().collect()
    }

    /// Load the embedded schema for `addr`
    ///
    /// Returns `Ok(true)` if this call loaded it, `Ok(false)` if it was
    /// already loaded or the catalogue has no schema for it.
    pub fn preload(&self, addr: &str) -> Result<bool, SchemaError> {
        let addr = normalize_address(addr);
        let catalogue = CATALOGUE
            .as_ref()
            .map_err(|e| SchemaError::InvalidCatalogue(e.clone()))?;

        let Some(schema) = catalogue.get(&addr) else {
            tracing::debug!(provider = %addr, "no embedded schema for provider");
            return Ok(false);
        };

        match self.loaded.entry(addr) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                tracing::debug!(provider = %slot.key(), "preloaded embedded schema");
                slot.insert(schema.clone());
                self.loads.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        }
    }

    pub fn provider_schema(&self, addr: &str) -> Option<Arc<ProviderSchema>> {
        self.loaded
            .get(&normalize_address(addr))
            .map(|schema| schema.clone())
    }

    /// Whether `addr` is known to the embedded catalogue
    pub fn is_embedded(addr: &str) -> bool {
        CATALOGUE
            .as_ref()
            .map(|catalogue| catalogue.contains_key(&normalize_address(addr)))
            .unwrap_or(false)
    }

    /// Number of schema loads performed so far
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}
