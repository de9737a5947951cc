//! The Remote Service contract consumed by the reconcilers.
//!
//! Implementations must be safe for concurrent use by independent
//! reconciliations; nothing here holds per-resource state.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CreateDiskRequest, CreateEnvironmentRequest, CreateInterfaceRequest, CreateServiceRequest,
    CreateVmRequest, Disk, Environment, Interface, Label, LabelCategory, LabelCategoryRequest,
    LabelRequest, Network, NetworkRequest, Project, ProjectRequest, PublishedService, Tag, Tunnel,
    TunnelRequest, UpdateEnvironmentRequest, UpdateVmRequest, Vm,
};

/// Typed operations per resource kind.
///
/// Every method returns [`crate::RemoteError::NotFound`] when the addressed
/// resource (or its parent) does not exist.
#[async_trait]
pub trait RemoteService: Send + Sync {
    // Projects
    async fn create_project(&self, request: &ProjectRequest) -> Result<Project>;
    async fn get_project(&self, id: &str) -> Result<Project>;
    async fn update_project(&self, id: &str, request: &ProjectRequest) -> Result<Project>;
    async fn delete_project(&self, id: &str) -> Result<()>;
    async fn list_projects(&self) -> Result<Vec<Project>>;

    // Environments
    async fn create_environment(&self, request: &CreateEnvironmentRequest) -> Result<Environment>;
    async fn get_environment(&self, id: &str) -> Result<Environment>;
    async fn update_environment(
        &self,
        id: &str,
        request: &UpdateEnvironmentRequest,
    ) -> Result<Environment>;
    async fn delete_environment(&self, id: &str) -> Result<()>;
    async fn list_environments(&self) -> Result<Vec<Environment>>;

    /// Attach one tag to an environment.
    async fn create_tag(&self, environment_id: &str, value: &str) -> Result<Tag>;
    /// Detach one tag by its remote id.
    async fn delete_tag(&self, environment_id: &str, tag_id: &str) -> Result<()>;
    /// Attach one label to an environment.
    async fn create_label(&self, environment_id: &str, request: &LabelRequest) -> Result<Label>;
    /// Detach one label by its remote id.
    async fn delete_label(&self, environment_id: &str, label_id: &str) -> Result<()>;
    /// Replace the environment's user data document.
    async fn update_user_data(&self, environment_id: &str, contents: &str) -> Result<()>;

    // Networks
    async fn create_network(&self, environment_id: &str, request: &NetworkRequest)
    -> Result<Network>;
    async fn get_network(&self, environment_id: &str, id: &str) -> Result<Network>;
    async fn update_network(
        &self,
        environment_id: &str,
        id: &str,
        request: &NetworkRequest,
    ) -> Result<Network>;
    async fn delete_network(&self, environment_id: &str, id: &str) -> Result<()>;
    async fn list_networks(&self, environment_id: &str) -> Result<Vec<Network>>;

    // VMs
    /// Copy a template VM into the environment and return the new VM.
    async fn create_vm(&self, environment_id: &str, request: &CreateVmRequest) -> Result<Vm>;
    async fn get_vm(&self, environment_id: &str, id: &str) -> Result<Vm>;
    async fn update_vm(&self, environment_id: &str, id: &str, request: &UpdateVmRequest)
    -> Result<Vm>;
    async fn delete_vm(&self, environment_id: &str, id: &str) -> Result<()>;
    async fn list_vms(&self, environment_id: &str) -> Result<Vec<Vm>>;

    async fn add_disk(&self, environment_id: &str, vm_id: &str, request: &CreateDiskRequest)
    -> Result<Disk>;
    async fn remove_disk(&self, environment_id: &str, vm_id: &str, disk_id: &str) -> Result<()>;
    async fn create_interface(
        &self,
        environment_id: &str,
        vm_id: &str,
        request: &CreateInterfaceRequest,
    ) -> Result<Interface>;
    async fn create_published_service(
        &self,
        environment_id: &str,
        vm_id: &str,
        interface_id: &str,
        request: &CreateServiceRequest,
    ) -> Result<PublishedService>;
    async fn delete_published_service(
        &self,
        environment_id: &str,
        vm_id: &str,
        interface_id: &str,
        service_id: &str,
    ) -> Result<()>;

    // Label categories
    async fn create_label_category(&self, request: &LabelCategoryRequest) -> Result<LabelCategory>;
    async fn get_label_category(&self, id: &str) -> Result<LabelCategory>;
    /// Categories cannot be removed remotely, only disabled.
    async fn delete_label_category(&self, id: &str) -> Result<()>;
    async fn list_label_categories(&self) -> Result<Vec<LabelCategory>>;

    // Tunnels
    async fn create_tunnel(&self, request: &TunnelRequest) -> Result<Tunnel>;
    async fn get_tunnel(&self, id: &str) -> Result<Tunnel>;
    async fn delete_tunnel(&self, id: &str) -> Result<()>;
    async fn list_tunnels(&self) -> Result<Vec<Tunnel>>;
}
