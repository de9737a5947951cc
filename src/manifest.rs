//! Manifest of declared resources.
//!
//! ```toml
//! [[resource]]
//! kind = "environment"
//! name = "lab"
//!
//! [resource.config]
//! template_id = "1234"
//! name = "Training lab"
//! description = "Week 1"
//! tags = ["training"]
//!
//! [[resource]]
//! kind = "network"
//! name = "lan"
//!
//! [resource.config]
//! environment_id = "ref:environment.lab"
//! name = "lan"
//! domain = "lab.test"
//! subnet = "10.0.0.0/24"
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use labsync_reconciler::{ResourceAddress, ResourceKind};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    resource: Vec<RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    kind: String,
    name: String,
    #[serde(default)]
    config: toml::Table,
}

/// One declared resource.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredResource {
    pub address: ResourceAddress,
    pub desired: Value,
}

/// Declared resources in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub resources: Vec<DeclaredResource>,
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawManifest = toml::from_str(content)?;
        let mut seen = HashSet::with_capacity(raw.resource.len());
        let mut resources = Vec::with_capacity(raw.resource.len());

        for entry in raw.resource {
            let kind: ResourceKind = entry.kind.parse()?;
            if entry.name.trim().is_empty() || entry.name.contains('.') {
                bail!("{kind} name '{}' must be non-empty and contain no '.'", entry.name);
            }
            let address = ResourceAddress::new(kind, entry.name);
            if !seen.insert(address.clone()) {
                bail!("{address} is declared twice");
            }
            let desired = serde_json::to_value(&entry.config)
                .with_context(|| format!("{address} config is not representable as JSON"))?;
            resources.push(DeclaredResource { address, desired });
        }

        Ok(Self { resources })
    }

    pub fn addresses(&self) -> impl DoubleEndedIterator<Item = &ResourceAddress> {
        self.resources.iter().map(|resource| &resource.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LAB: &str = r#"
[[resource]]
kind = "environment"
name = "lab"

[resource.config]
template_id = "1234"
name = "Training lab"
description = "Week 1"
tags = ["training"]

[[resource.config.label]]
label_category = "owner"
value = "ops"

[[resource]]
kind = "network"
name = "lan"

[resource.config]
environment_id = "ref:environment.lab"
name = "lan"
domain = "lab.test"
subnet = "10.0.0.0/24"
"#;

    #[test]
    fn test_resources_keep_declaration_order() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let manifest = Manifest::from_toml(LAB)?;
        let addresses: Vec<String> = manifest.addresses().map(ToString::to_string).collect();
        assert_eq!(addresses, vec!["environment.lab", "network.lan"]);

        let env = manifest.resources.first().map(|r| r.desired.clone());
        assert_eq!(
            env,
            Some(json!({
                "template_id": "1234",
                "name": "Training lab",
                "description": "Week 1",
                "tags": ["training"],
                "label": [{ "label_category": "owner", "value": "ops" }],
            }))
        );
        Ok(())
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result = Manifest::from_toml("[[resource]]\nkind = \"bucket\"\nname = \"b\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_address_is_rejected() {
        let content = "[[resource]]\nkind = \"project\"\nname = \"p\"\n\n[[resource]]\nkind = \"project\"\nname = \"p\"\n";
        assert!(Manifest::from_toml(content).is_err_and(|e| e.to_string().contains("declared twice")));
    }

    #[test]
    fn test_dotted_name_is_rejected() {
        let content = "[[resource]]\nkind = \"project\"\nname = \"a.b\"\n";
        assert!(Manifest::from_toml(content).is_err());
    }

    #[test]
    fn test_empty_manifest() {
        assert!(Manifest::from_toml("").is_ok_and(|m| m.resources.is_empty()));
    }
}
