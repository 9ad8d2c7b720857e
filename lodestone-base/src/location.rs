use crate::hashing::HashMap;
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use thiserror::Error;

/// Describes where a resource comes from: an opaque identity, the provider that knows
/// how to produce it, the runtime type the provider will produce, and the locations
/// that must be loaded first. Locations form a DAG by construction; they are built
/// bottom-up from configuration data and the engine assumes no cycles at runtime
/// (see `ManifestData::resolve`, which rejects cyclic configuration).
///
/// Structural equality/hash over all fields is what makes locations usable as cache
/// keys for request deduplication.
#[derive(PartialEq, Eq, Hash)]
pub struct ResourceLocation {
    internal_id: String,
    provider_id: String,
    result_type: TypeId,
    dependencies: Vec<Arc<ResourceLocation>>,
}

impl ResourceLocation {
    pub fn new(
        internal_id: impl Into<String>,
        provider_id: impl Into<String>,
        result_type: TypeId,
        dependencies: Vec<Arc<ResourceLocation>>,
    ) -> Arc<Self> {
        Arc::new(ResourceLocation {
            internal_id: internal_id.into(),
            provider_id: provider_id.into(),
            result_type,
            dependencies,
        })
    }

    pub fn internal_id(&self) -> &str {
        &self.internal_id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn result_type(&self) -> TypeId {
        self.result_type
    }

    pub fn dependencies(&self) -> &[Arc<ResourceLocation>] {
        &self.dependencies
    }
}

impl Debug for ResourceLocation {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ResourceLocation")
            .field("internal_id", &self.internal_id)
            .field("provider_id", &self.provider_id)
            .field("dependency_count", &self.dependencies.len())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("location '{0}' is defined more than once")]
    DuplicateId(String),
    #[error("location '{id}' names unknown result type '{type_name}'")]
    UnknownType { id: String, type_name: String },
    #[error("location '{id}' depends on unknown location '{dependency}'")]
    UnknownDependency { id: String, dependency: String },
    #[error("location '{0}' participates in a dependency cycle")]
    CyclicDependency(String),
}

/// One location entry as it appears in configuration data. The result type is named by
/// a string and resolved against the caller's registered type names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationData {
    pub id: String,
    pub provider: String,
    pub result_type: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A flat list of location entries, typically parsed from a manifest JSON file.
/// `resolve` turns it into interned `ResourceLocation` trees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestData {
    pub locations: Vec<LocationData>,
}

impl ManifestData {
    /// Builds `ResourceLocation` values bottom-up, validating that every referenced
    /// type name and dependency exists and that the graph is acyclic. Cycle detection
    /// happens here, at configuration time, rather than in the runtime engine.
    pub fn resolve(
        &self,
        type_names: &HashMap<String, TypeId>,
    ) -> Result<HashMap<String, Arc<ResourceLocation>>, ManifestError> {
        let mut entries = HashMap::default();
        for location in &self.locations {
            if entries.insert(location.id.as_str(), location).is_some() {
                return Err(ManifestError::DuplicateId(location.id.clone()));
            }
        }

        let mut resolved: HashMap<String, Arc<ResourceLocation>> = HashMap::default();
        for location in &self.locations {
            let mut in_progress = Vec::default();
            Self::resolve_entry(
                location,
                &entries,
                type_names,
                &mut resolved,
                &mut in_progress,
            )?;
        }

        Ok(resolved)
    }

    fn resolve_entry(
        entry: &LocationData,
        entries: &HashMap<&str, &LocationData>,
        type_names: &HashMap<String, TypeId>,
        resolved: &mut HashMap<String, Arc<ResourceLocation>>,
        in_progress: &mut Vec<String>,
    ) -> Result<Arc<ResourceLocation>, ManifestError> {
        if let Some(location) = resolved.get(&entry.id) {
            return Ok(location.clone());
        }

        if in_progress.iter().any(|id| *id == entry.id) {
            return Err(ManifestError::CyclicDependency(entry.id.clone()));
        }
        in_progress.push(entry.id.clone());

        let result_type =
            *type_names
                .get(&entry.result_type)
                .ok_or_else(|| ManifestError::UnknownType {
                    id: entry.id.clone(),
                    type_name: entry.result_type.clone(),
                })?;

        let mut dependencies = Vec::with_capacity(entry.dependencies.len());
        for dependency_id in &entry.dependencies {
            let dependency_entry = entries.get(dependency_id.as_str()).ok_or_else(|| {
                ManifestError::UnknownDependency {
                    id: entry.id.clone(),
                    dependency: dependency_id.clone(),
                }
            })?;
            dependencies.push(Self::resolve_entry(
                dependency_entry,
                entries,
                type_names,
                resolved,
                in_progress,
            )?);
        }

        in_progress.pop();

        let location = ResourceLocation::new(
            entry.id.clone(),
            entry.provider.clone(),
            result_type,
            dependencies,
        );
        resolved.insert(entry.id.clone(), location.clone());
        Ok(location)
    }
}
