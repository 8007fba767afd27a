//! Component descriptors and the registry they are loaded into.
//!
//! A repository is a directory of `*.json` descriptor files. Descriptors are
//! immutable once loaded; the registry validates them and builds the
//! capability → provider index used by the resolver.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RegistryError;

/// A declarable unit of experiment definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Unique name within the registry
    pub name: String,
    /// Capabilities that must be provided by an earlier component
    #[serde(default)]
    pub capability_depends: BTreeSet<String>,
    /// Capabilities this component provides
    #[serde(default)]
    pub capability_provides: BTreeSet<String>,
    /// Capabilities whose providers must run after this component
    #[serde(default)]
    pub capability_precedes: BTreeSet<String>,
    /// Components that must run before this one
    #[serde(default)]
    pub component_depends: BTreeSet<String>,
    /// Components that must run after this one, when present
    #[serde(default)]
    pub component_precedes: BTreeSet<String>,
    /// Reference to the unit invoked during graph construction
    #[serde(default)]
    pub unit: Option<String>,
    /// Named action-unit files; relative paths are resolved against the
    /// descriptor's directory at load time
    #[serde(default)]
    pub resources: BTreeMap<String, PathBuf>,
}

impl ComponentDescriptor {
    /// Create an empty descriptor with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability_depends: BTreeSet::new(),
            capability_provides: BTreeSet::new(),
            capability_precedes: BTreeSet::new(),
            component_depends: BTreeSet::new(),
            component_precedes: BTreeSet::new(),
            unit: None,
            resources: BTreeMap::new(),
        }
    }

    pub fn provides(mut self, capability: &str) -> Self {
        self.capability_provides.insert(capability.to_string());
        self
    }

    pub fn depends_on_capability(mut self, capability: &str) -> Self {
        self.capability_depends.insert(capability.to_string());
        self
    }

    pub fn precedes_capability(mut self, capability: &str) -> Self {
        self.capability_precedes.insert(capability.to_string());
        self
    }

    pub fn depends_on(mut self, component: &str) -> Self {
        self.component_depends.insert(component.to_string());
        self
    }

    pub fn precedes(mut self, component: &str) -> Self {
        self.component_precedes.insert(component.to_string());
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::EmptyName {
                name: self.name.clone(),
            });
        }
        let sets: [(&'static str, &BTreeSet<String>); 2] = [
            ("component_depends", &self.component_depends),
            ("component_precedes", &self.component_precedes),
        ];
        for (field, set) in sets {
            if set.contains(&self.name) {
                return Err(RegistryError::SelfReference {
                    name: self.name.clone(),
                    field,
                });
            }
        }
        let all_names = self
            .capability_depends
            .iter()
            .chain(&self.capability_provides)
            .chain(&self.capability_precedes)
            .chain(&self.component_depends)
            .chain(&self.component_precedes);
        for entry in all_names {
            if entry.trim().is_empty() {
                return Err(RegistryError::EmptyName {
                    name: self.name.clone(),
                });
            }
        }
        let capability_sets: [(&'static str, &BTreeSet<String>); 2] = [
            ("capability_depends", &self.capability_depends),
            ("capability_precedes", &self.capability_precedes),
        ];
        for (field, set) in capability_sets {
            if let Some(capability) = set.intersection(&self.capability_provides).next() {
                return Err(RegistryError::SelfCapability {
                    name: self.name.clone(),
                    field,
                    capability: capability.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Result of looking up who provides a capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderLookup<'a> {
    Unique(&'a str),
    Ambiguous(Vec<&'a str>),
    None,
}

/// Validated, immutable collection of component descriptors.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    components: BTreeMap<String, Arc<ComponentDescriptor>>,
    /// capability -> provider names (sorted)
    providers: BTreeMap<String, BTreeSet<String>>,
    /// component name -> where it was declared, for duplicate diagnostics
    origins: BTreeMap<String, String>,
}

impl ComponentRegistry {
    /// Build a registry from in-memory descriptors.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ComponentDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for (idx, descriptor) in descriptors.into_iter().enumerate() {
            registry.insert(descriptor, format!("#{idx}"))?;
        }
        Ok(registry)
    }

    /// Load every `*.json` descriptor from each repository directory.
    ///
    /// Files are visited in name order so the registry contents never depend
    /// on directory iteration order.
    pub fn load(repositories: &[PathBuf]) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for repo in repositories {
            let mut files = Vec::new();
            let entries = std::fs::read_dir(repo).map_err(|source| RegistryError::Io {
                path: repo.clone(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| RegistryError::Io {
                    path: repo.clone(),
                    source,
                })?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    files.push(path);
                }
            }
            files.sort();

            for path in files {
                let descriptor = read_descriptor(&path)?;
                debug!(
                    component = %descriptor.name,
                    path = %path.display(),
                    "Loaded component descriptor"
                );
                registry.insert(descriptor, path.display().to_string())?;
            }
        }
        info!(
            components = registry.components.len(),
            capabilities = registry.providers.len(),
            "Component registry loaded"
        );
        Ok(registry)
    }

    fn insert(
        &mut self,
        descriptor: ComponentDescriptor,
        origin: String,
    ) -> Result<(), RegistryError> {
        descriptor.validate()?;
        if let Some(first) = self.origins.get(&descriptor.name) {
            return Err(RegistryError::DuplicateComponent {
                name: descriptor.name.clone(),
                first: first.clone(),
                second: origin,
            });
        }
        for capability in &descriptor.capability_provides {
            self.providers
                .entry(capability.clone())
                .or_default()
                .insert(descriptor.name.clone());
        }
        self.origins.insert(descriptor.name.clone(), origin);
        self.components
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ComponentDescriptor>> {
        self.components.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// All providers of a capability, sorted by name.
    pub fn providers_of(&self, capability: &str) -> Vec<&str> {
        self.providers
            .get(capability)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Classify the providers of a capability, ignoring `requester` itself.
    pub fn lookup(&self, capability: &str, requester: &str) -> ProviderLookup<'_> {
        let candidates: Vec<&str> = self
            .providers_of(capability)
            .into_iter()
            .filter(|name| *name != requester)
            .collect();
        match candidates.as_slice() {
            [] => ProviderLookup::None,
            [only] => ProviderLookup::Unique(only),
            _ => ProviderLookup::Ambiguous(candidates),
        }
    }
}

fn read_descriptor(path: &Path) -> Result<ComponentDescriptor, RegistryError> {
    let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut descriptor: ComponentDescriptor =
        serde_json::from_str(&raw).map_err(|source| RegistryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for resource in descriptor.resources.values_mut() {
        if resource.is_relative() {
            *resource = base.join(&*resource);
        }
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_classifies_providers() {
        let registry = ComponentRegistry::from_descriptors([
            ComponentDescriptor::new("a").provides("graph"),
            ComponentDescriptor::new("x").provides("hostname"),
            ComponentDescriptor::new("y").provides("hostname"),
        ])
        .unwrap();

        assert_eq!(registry.lookup("graph", "c"), ProviderLookup::Unique("a"));
        assert_eq!(
            registry.lookup("hostname", "c"),
            ProviderLookup::Ambiguous(vec!["x", "y"])
        );
        assert_eq!(registry.lookup("tap", "c"), ProviderLookup::None);
        // a component never satisfies its own requirement
        assert_eq!(registry.lookup("graph", "a"), ProviderLookup::None);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ComponentRegistry::from_descriptors([
            ComponentDescriptor::new("a"),
            ComponentDescriptor::new("a"),
        ])
        .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateComponent { name, .. } if name == "a"));
    }

    #[test]
    fn self_reference_is_a_load_error() {
        let err = ComponentRegistry::from_descriptors([ComponentDescriptor::new("a").depends_on("a")])
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::SelfReference { field: "component_depends", .. }
        ));

        let err =
            ComponentRegistry::from_descriptors([ComponentDescriptor::new("b").precedes("b")])
                .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::SelfReference { field: "component_precedes", .. }
        ));
    }

    #[test]
    fn providing_and_depending_on_same_capability_is_rejected() {
        let err = ComponentRegistry::from_descriptors([ComponentDescriptor::new("a")
            .provides("graph")
            .depends_on_capability("graph")])
        .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::SelfCapability { field: "capability_depends", .. }
        ));
    }

    #[test]
    fn preceding_a_provided_capability_is_rejected() {
        let err = ComponentRegistry::from_descriptors([ComponentDescriptor::new("a")
            .provides("graph")
            .precedes_capability("graph")])
        .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::SelfCapability { name, field: "capability_precedes", capability }
                if name == "a" && capability == "graph"
        ));

        // preceding another provider's capability stays legal
        let registry = ComponentRegistry::from_descriptors([
            ComponentDescriptor::new("a").provides("graph").precedes_capability("tap"),
            ComponentDescriptor::new("b").provides("tap"),
        ])
        .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn load_reads_sorted_descriptors_and_resolves_resources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            r#"{"name": "b", "capability_depends": ["graph"], "resources": {"script": "setup.sh"}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"name": "a", "capability_provides": ["graph"], "unit": "core.hosts"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = ComponentRegistry::load(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().unit.as_deref(), Some("core.hosts"));
        assert_eq!(
            registry.get("b").unwrap().resources["script"],
            dir.path().join("setup.sh")
        );
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        let err = ComponentRegistry::load(&[dir.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, RegistryError::Parse { path, .. } if path.ends_with("bad.json")));
    }
}
