//! Wire types for the provisioning API.
//!
//! Request types only serialize fields that are set, so absent optional
//! values never override server-side defaults.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle label of an asynchronously transitioning environment or VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Runstate {
    Busy,
    Running,
    Stopped,
    Suspended,
    Halted,
    Reset,
    /// Any label the service reports that we do not model (e.g. an error state).
    Other(String),
}

impl Runstate {
    /// The label as reported by the service.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Busy => "busy",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Suspended => "suspended",
            Self::Halted => "halted",
            Self::Reset => "reset",
            Self::Other(label) => label,
        }
    }
}

impl From<String> for Runstate {
    fn from(label: String) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "busy" => Self::Busy,
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "suspended" => Self::Suspended,
            "halted" => Self::Halted,
            "reset" => Self::Reset,
            _ => Self::Other(label),
        }
    }
}

impl From<&str> for Runstate {
    fn from(label: &str) -> Self {
        Self::from(label.to_string())
    }
}

impl From<Runstate> for String {
    fn from(state: Runstate) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for Runstate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ids arrive as strings for most kinds and as numbers for some.
fn id_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum AnyId {
        Text(String),
        Number(u64),
    }

    Ok(match AnyId::deserialize(deserializer)? {
        AnyId::Text(s) => s,
        AnyId::Number(n) => n.to_string(),
    })
}

fn opt_id_from_any<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum AnyId {
        Text(String),
        Number(u64),
    }

    Ok(Option::<AnyId>::deserialize(deserializer)?.map(|id| match id {
        AnyId::Text(s) => s,
        AnyId::Number(n) => n.to_string(),
    }))
}

// ============================================================================
// Projects
// ============================================================================

/// Role granted to users automatically added to a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectRole {
    Viewer,
    Participant,
    Editor,
    Manager,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub auto_add_role_name: Option<ProjectRole>,
    #[serde(default)]
    pub show_project_members: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_add_role_name: Option<ProjectRole>,
    pub show_project_members: bool,
}

// ============================================================================
// Environments
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    #[serde(rename = "label_category")]
    pub category: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelRequest {
    #[serde(rename = "label_category", alias = "category")]
    pub category: String,
    pub value: String,
}

/// VM entry embedded in an environment response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSummary {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub runstate: Runstate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub runstate: Runstate,
    #[serde(default)]
    pub outbound_traffic: Option<bool>,
    #[serde(default)]
    pub routable: Option<bool>,
    #[serde(default)]
    pub suspend_on_idle: Option<u32>,
    #[serde(default)]
    pub suspend_at_time: Option<String>,
    #[serde(default)]
    pub shutdown_on_idle: Option<u32>,
    #[serde(default)]
    pub shutdown_at_time: Option<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub vms: Vec<VmSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEnvironmentRequest {
    pub template_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub outbound_traffic: bool,
    pub routable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_on_idle: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_at_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_on_idle: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_at_time: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

/// Mutable environment fields. The template id is never sent after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEnvironmentRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub outbound_traffic: bool,
    pub routable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_on_idle: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_at_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_on_idle: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_at_time: Option<String>,
}

// ============================================================================
// Networks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub tunnelable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub name: String,
    pub domain: String,
    pub subnet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    pub tunnelable: bool,
}

// ============================================================================
// VMs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    pub size: u32,
    #[serde(rename = "type", default)]
    pub disk_type: String,
    #[serde(default)]
    pub controller: String,
    pub lun: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hardware {
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub ram: u32,
    #[serde(default)]
    pub disks: Vec<Disk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedService {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    pub internal_port: u16,
    #[serde(default)]
    pub external_ip: String,
    #[serde(default)]
    pub external_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, deserialize_with = "opt_id_from_any")]
    pub network_id: Option<String>,
    #[serde(default)]
    pub nic_type: String,
    #[serde(default)]
    pub services: Vec<PublishedService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    pub name: String,
    pub runstate: Runstate,
    #[serde(default)]
    pub hardware: Hardware,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub template_id: String,
    pub vm_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateVmRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runstate: Option<Runstate>,
}

impl UpdateVmRequest {
    /// Request a runstate transition only.
    #[must_use]
    pub fn runstate(runstate: Runstate) -> Self {
        Self {
            runstate: Some(runstate),
            ..Self::default()
        }
    }

    /// Whether the request would change anything.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.name.is_none() && self.cpus.is_none() && self.ram.is_none() && self.runstate.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDiskRequest {
    pub size: u32,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInterfaceRequest {
    pub nic_type: String,
    pub network_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateServiceRequest {
    pub internal_port: u16,
}

// ============================================================================
// Label categories and tunnels
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCategory {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub single_value: bool,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

const fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCategoryRequest {
    pub name: String,
    pub single_value: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    #[serde(deserialize_with = "id_from_any")]
    pub id: String,
    #[serde(deserialize_with = "id_from_any")]
    pub source_network_id: String,
    #[serde(deserialize_with = "id_from_any")]
    pub target_network_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub source_network_id: String,
    pub target_network_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runstate_round_trips_unknown_labels() -> Result<(), serde_json::Error> {
        let state: Runstate = serde_json::from_str("\"error\"")?;
        assert_eq!(state, Runstate::Other("error".to_string()));
        assert_eq!(serde_json::to_string(&Runstate::Suspended)?, "\"suspended\"");
        Ok(())
    }

    #[test]
    fn test_numeric_ids_are_accepted() -> Result<(), serde_json::Error> {
        let category: LabelCategory =
            serde_json::from_str(r#"{"id": 4471, "name": "owner", "single_value": true}"#)?;
        assert_eq!(category.id, "4471");
        assert!(category.enabled);
        Ok(())
    }

    #[test]
    fn test_create_request_omits_unset_fields() -> Result<(), serde_json::Error> {
        let request = CreateEnvironmentRequest {
            template_id: "t1".to_string(),
            name: "lab".to_string(),
            ..CreateEnvironmentRequest::default()
        };
        let json = serde_json::to_value(&request)?;
        assert!(json.get("suspend_on_idle").is_none());
        assert!(json.get("tags").is_none());
        assert!(json.get("user_data").is_none());
        assert_eq!(json.get("outbound_traffic"), Some(&serde_json::json!(false)));
        Ok(())
    }

    #[test]
    fn test_interface_parses_service_list() -> Result<(), serde_json::Error> {
        let nic: Interface = serde_json::from_str(
            r#"{
                "id": "nic-20246343-38367563-0",
                "ip": "192.168.0.1",
                "hostname": "wins2016s",
                "network_id": "23917287",
                "nic_type": "vmxnet3",
                "services": [
                    {"id": "8080", "internal_port": 8080, "external_ip": "services-uswest.skytap.com", "external_port": 26160}
                ]
            }"#,
        )?;
        assert_eq!(nic.services.len(), 1);
        assert_eq!(nic.services.first().map(|s| s.external_port), Some(26160));
        Ok(())
    }
}
