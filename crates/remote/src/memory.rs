//! In-memory Remote Service for simulation and tests.
//!
//! Environments and VMs report `busy` for a configurable number of reads after
//! every mutating call, and deleted ones linger for a configurable number of
//! reads before turning into not-found. Failures can be injected per operation.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{RemoteError, Result};
use crate::service::RemoteService;
use crate::types::{
    CreateDiskRequest, CreateEnvironmentRequest, CreateInterfaceRequest, CreateServiceRequest,
    CreateVmRequest, Disk, Environment, Hardware, Interface, Label, LabelCategory,
    LabelCategoryRequest, LabelRequest, Network, NetworkRequest, Project, ProjectRequest,
    PublishedService, Runstate, Tag, Tunnel, TunnelRequest, UpdateEnvironmentRequest,
    UpdateVmRequest, Vm, VmSummary,
};

const BASE_DISK_SIZE: u32 = 30_720;
const SERVICE_HOST: &str = "services.labsync.test";

/// How many reads an asynchronous transition takes to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleConfig {
    /// Reads that report an environment as busy after a mutation.
    pub environment_reads: u32,
    /// Reads that report a VM as busy after a mutation.
    pub vm_reads: u32,
    /// Reads that still return a deleted environment or VM.
    pub delete_reads: u32,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            environment_reads: 1,
            vm_reads: 1,
            delete_reads: 1,
        }
    }
}

impl SettleConfig {
    /// Every transition completes before the first read.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            environment_reads: 0,
            vm_reads: 0,
            delete_reads: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct TemplateVm {
    id: String,
    name: String,
}

#[derive(Debug, Clone)]
struct StoredVm {
    vm: Vm,
    busy_reads: u32,
    deleting: Option<u32>,
}

impl StoredVm {
    fn observe(&mut self) -> Vm {
        let mut vm = self.vm.clone();
        if self.busy_reads > 0 {
            self.busy_reads = self.busy_reads.saturating_sub(1);
            vm.runstate = Runstate::Busy;
        }
        vm
    }
}

#[derive(Debug, Clone)]
struct StoredEnvironment {
    env: Environment,
    busy_reads: u32,
    deleting: Option<u32>,
    networks: BTreeMap<String, Network>,
    vms: BTreeMap<String, StoredVm>,
}

impl StoredEnvironment {
    fn observe(&mut self) -> Environment {
        let mut env = self.env.clone();
        if self.busy_reads > 0 {
            self.busy_reads = self.busy_reads.saturating_sub(1);
            env.runstate = Runstate::Busy;
        }
        env.vms = self
            .vms
            .values_mut()
            .filter(|stored| stored.deleting.is_none())
            .map(|stored| {
                let vm = stored.observe();
                VmSummary {
                    id: vm.id,
                    name: vm.name,
                    runstate: vm.runstate,
                }
            })
            .collect();
        env
    }

    fn live_vm_mut(&mut self, id: &str) -> Result<&mut StoredVm> {
        self.vms
            .get_mut(id)
            .filter(|stored| stored.deleting.is_none())
            .ok_or_else(|| RemoteError::not_found(format!("vms/{id}")))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    projects: BTreeMap<String, Project>,
    environments: BTreeMap<String, StoredEnvironment>,
    label_categories: BTreeMap<String, LabelCategory>,
    tunnels: BTreeMap<String, Tunnel>,
    templates: HashMap<String, Vec<TemplateVm>>,
    failures: HashMap<String, VecDeque<u16>>,
    calls: Vec<String>,
}

impl MemoryState {
    fn next_id(&mut self) -> String {
        self.next_id = self.next_id.saturating_add(1);
        self.next_id.to_string()
    }

    /// Log the call and consume an injected failure, if any.
    fn enter(&mut self, operation: &str, target: &str) -> Result<()> {
        debug!(operation, target, "Simulated remote call");
        self.calls.push(format!("{operation} {target}"));
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(status) => Err(RemoteError::status(
                status,
                format!("injected failure for {operation}"),
            )),
            None => Ok(()),
        }
    }

    fn live_environment_mut(&mut self, id: &str) -> Result<&mut StoredEnvironment> {
        self.environments
            .get_mut(id)
            .filter(|stored| stored.deleting.is_none())
            .ok_or_else(|| RemoteError::not_found(format!("configurations/{id}")))
    }

    fn network_exists(&self, id: &str) -> bool {
        self.environments
            .values()
            .filter(|stored| stored.deleting.is_none())
            .any(|stored| stored.networks.contains_key(id))
    }

    fn new_vm(&mut self, template_id: &str, source_vm_id: &str, busy_reads: u32) -> StoredVm {
        let name = self
            .templates
            .get(template_id)
            .and_then(|vms| vms.iter().find(|vm| vm.id == source_vm_id))
            .map_or_else(|| format!("vm-{source_vm_id}"), |vm| vm.name.clone());
        let id = self.next_id();
        let base_disk = Disk {
            id: format!("disk-{id}-0"),
            size: BASE_DISK_SIZE,
            disk_type: "SCSI".to_string(),
            controller: "0".to_string(),
            lun: "0".to_string(),
            name: None,
        };
        StoredVm {
            vm: Vm {
                id,
                name,
                runstate: Runstate::Stopped,
                hardware: Hardware {
                    cpus: 1,
                    ram: 2048,
                    disks: vec![base_disk],
                },
                interfaces: Vec::new(),
            },
            busy_reads,
            deleting: None,
        }
    }
}

/// Remote Service that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRemoteService {
    state: RwLock<MemoryState>,
    settle: SettleConfig,
}

impl InMemoryRemoteService {
    /// Create an empty service with default settle behavior.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how many reads transitions take.
    #[must_use]
    pub fn with_settle(mut self, settle: SettleConfig) -> Self {
        self.settle = settle;
        self
    }

    /// Register a template whose VMs are copied into new environments.
    #[must_use]
    pub fn with_template(mut self, template_id: &str, vms: &[(&str, &str)]) -> Self {
        let vms = vms
            .iter()
            .map(|(id, name)| TemplateVm {
                id: (*id).to_string(),
                name: (*name).to_string(),
            })
            .collect();
        self.state
            .get_mut()
            .templates
            .insert(template_id.to_string(), vms);
        self
    }

    /// Fail the next call of `operation` with the given HTTP status.
    pub async fn fail_next(&self, operation: &str, status: u16) {
        self.state
            .write()
            .await
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(status);
    }

    /// Every call made so far, as `"<operation> <target>"`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.read().await.calls.clone()
    }

    /// Number of calls of one operation.
    pub async fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{operation} ");
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    /// Remove an environment behind the reconciler's back.
    pub async fn drop_environment(&self, id: &str) -> bool {
        self.state.write().await.environments.remove(id).is_some()
    }

    /// Remove a project behind the reconciler's back.
    pub async fn drop_project(&self, id: &str) -> bool {
        self.state.write().await.projects.remove(id).is_some()
    }

    /// Replace an environment's tags behind the reconciler's back.
    pub async fn set_tags(&self, environment_id: &str, values: &[&str]) -> Result<()> {
        let mut state = self.state.write().await;
        let mut tags = Vec::with_capacity(values.len());
        for value in values {
            tags.push(Tag {
                id: state.next_id(),
                value: (*value).to_string(),
            });
        }
        state.live_environment_mut(environment_id)?.env.tags = tags;
        Ok(())
    }
}

#[async_trait]
impl RemoteService for InMemoryRemoteService {
    async fn create_project(&self, request: &ProjectRequest) -> Result<Project> {
        let mut state = self.state.write().await;
        state.enter("create_project", &request.name)?;
        if state.projects.values().any(|p| p.name == request.name) {
            return Err(RemoteError::status(
                422,
                format!("project name '{}' is taken", request.name),
            ));
        }
        let project = Project {
            id: state.next_id(),
            name: request.name.clone(),
            summary: request.summary.clone(),
            auto_add_role_name: request.auto_add_role_name,
            show_project_members: request.show_project_members,
        };
        state.projects.insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: &str) -> Result<Project> {
        let mut state = self.state.write().await;
        state.enter("get_project", id)?;
        state
            .projects
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("projects/{id}")))
    }

    async fn update_project(&self, id: &str, request: &ProjectRequest) -> Result<Project> {
        let mut state = self.state.write().await;
        state.enter("update_project", id)?;
        let project = state
            .projects
            .get_mut(id)
            .ok_or_else(|| RemoteError::not_found(format!("projects/{id}")))?;
        project.name.clone_from(&request.name);
        project.summary.clone_from(&request.summary);
        project.auto_add_role_name = request.auto_add_role_name;
        project.show_project_members = request.show_project_members;
        Ok(project.clone())
    }

    async fn delete_project(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("delete_project", id)?;
        state
            .projects
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(format!("projects/{id}")))
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut state = self.state.write().await;
        state.enter("list_projects", "")?;
        Ok(state.projects.values().cloned().collect())
    }

    async fn create_environment(&self, request: &CreateEnvironmentRequest) -> Result<Environment> {
        let mut state = self.state.write().await;
        state.enter("create_environment", &request.name)?;

        let template_vms = state
            .templates
            .get(&request.template_id)
            .cloned()
            .unwrap_or_default();
        let mut vms = BTreeMap::new();
        for template_vm in &template_vms {
            let mut stored =
                state.new_vm(&request.template_id, &template_vm.id, self.settle.vm_reads);
            stored.vm.runstate = Runstate::Running;
            vms.insert(stored.vm.id.clone(), stored);
        }

        let mut tags = Vec::with_capacity(request.tags.len());
        for value in &request.tags {
            tags.push(Tag {
                id: state.next_id(),
                value: value.clone(),
            });
        }
        let mut labels = Vec::with_capacity(request.labels.len());
        for label in &request.labels {
            labels.push(Label {
                id: state.next_id(),
                category: label.category.clone(),
                value: label.value.clone(),
            });
        }

        let env = Environment {
            id: state.next_id(),
            name: request.name.clone(),
            description: request.description.clone(),
            runstate: Runstate::Running,
            outbound_traffic: Some(request.outbound_traffic),
            routable: Some(request.routable),
            suspend_on_idle: request.suspend_on_idle,
            suspend_at_time: request.suspend_at_time.clone(),
            shutdown_on_idle: request.shutdown_on_idle,
            shutdown_at_time: request.shutdown_at_time.clone(),
            user_data: request.user_data.clone(),
            tags,
            labels,
            vms: Vec::new(),
        };
        let mut stored = StoredEnvironment {
            env,
            busy_reads: self.settle.environment_reads,
            deleting: None,
            networks: BTreeMap::new(),
            vms,
        };
        // The create response is itself a read of a busy environment.
        let mut response = stored.env.clone();
        response.runstate = Runstate::Busy;
        response.vms = stored
            .vms
            .values()
            .map(|vm| VmSummary {
                id: vm.vm.id.clone(),
                name: vm.vm.name.clone(),
                runstate: Runstate::Busy,
            })
            .collect();
        state.environments.insert(response.id.clone(), stored);
        Ok(response)
    }

    async fn get_environment(&self, id: &str) -> Result<Environment> {
        let mut state = self.state.write().await;
        state.enter("get_environment", id)?;
        let not_found = || RemoteError::not_found(format!("configurations/{id}"));
        let Some(stored) = state.environments.get_mut(id) else {
            return Err(not_found());
        };
        if let Some(left) = stored.deleting.as_mut() {
            if *left == 0 {
                state.environments.remove(id);
                return Err(not_found());
            }
            *left = left.saturating_sub(1);
            let mut env = stored.env.clone();
            env.runstate = Runstate::Busy;
            return Ok(env);
        }
        Ok(stored.observe())
    }

    async fn update_environment(
        &self,
        id: &str,
        request: &UpdateEnvironmentRequest,
    ) -> Result<Environment> {
        let mut state = self.state.write().await;
        state.enter("update_environment", id)?;
        let busy_reads = self.settle.environment_reads;
        let stored = state.live_environment_mut(id)?;
        let env = &mut stored.env;
        env.name.clone_from(&request.name);
        env.description.clone_from(&request.description);
        env.outbound_traffic = Some(request.outbound_traffic);
        env.routable = Some(request.routable);
        env.suspend_on_idle = request.suspend_on_idle;
        env.suspend_at_time.clone_from(&request.suspend_at_time);
        env.shutdown_on_idle = request.shutdown_on_idle;
        env.shutdown_at_time.clone_from(&request.shutdown_at_time);
        stored.busy_reads = busy_reads;
        Ok(stored.observe())
    }

    async fn delete_environment(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("delete_environment", id)?;
        let delete_reads = self.settle.delete_reads;
        state.live_environment_mut(id)?;
        if delete_reads == 0 {
            state.environments.remove(id);
        } else if let Some(stored) = state.environments.get_mut(id) {
            stored.deleting = Some(delete_reads);
        }
        Ok(())
    }

    async fn list_environments(&self) -> Result<Vec<Environment>> {
        let mut state = self.state.write().await;
        state.enter("list_environments", "")?;
        Ok(state
            .environments
            .values_mut()
            .filter(|stored| stored.deleting.is_none())
            .map(StoredEnvironment::observe)
            .collect())
    }

    async fn create_tag(&self, environment_id: &str, value: &str) -> Result<Tag> {
        let mut state = self.state.write().await;
        state.enter("create_tag", &format!("{environment_id}/{value}"))?;
        let tag_id = state.next_id();
        let env = &mut state.live_environment_mut(environment_id)?.env;
        if let Some(existing) = env.tags.iter().find(|t| t.value.eq_ignore_ascii_case(value)) {
            return Ok(existing.clone());
        }
        let tag = Tag {
            id: tag_id,
            value: value.to_string(),
        };
        env.tags.push(tag.clone());
        Ok(tag)
    }

    async fn delete_tag(&self, environment_id: &str, tag_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("delete_tag", &format!("{environment_id}/{tag_id}"))?;
        let env = &mut state.live_environment_mut(environment_id)?.env;
        let before = env.tags.len();
        env.tags.retain(|t| t.id != tag_id);
        if env.tags.len() == before {
            return Err(RemoteError::not_found(format!("tags/{tag_id}")));
        }
        Ok(())
    }

    async fn create_label(&self, environment_id: &str, request: &LabelRequest) -> Result<Label> {
        let mut state = self.state.write().await;
        state.enter(
            "create_label",
            &format!("{environment_id}/{}:{}", request.category, request.value),
        )?;
        let single_value = state
            .label_categories
            .values()
            .any(|c| c.enabled && c.single_value && c.name == request.category);
        let label_id = state.next_id();
        let env = &mut state.live_environment_mut(environment_id)?.env;
        if single_value && env.labels.iter().any(|l| l.category == request.category) {
            return Err(RemoteError::status(
                422,
                format!("category '{}' allows a single value", request.category),
            ));
        }
        let label = Label {
            id: label_id,
            category: request.category.clone(),
            value: request.value.clone(),
        };
        env.labels.push(label.clone());
        Ok(label)
    }

    async fn delete_label(&self, environment_id: &str, label_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("delete_label", &format!("{environment_id}/{label_id}"))?;
        let env = &mut state.live_environment_mut(environment_id)?.env;
        let before = env.labels.len();
        env.labels.retain(|l| l.id != label_id);
        if env.labels.len() == before {
            return Err(RemoteError::not_found(format!("labels/{label_id}")));
        }
        Ok(())
    }

    async fn update_user_data(&self, environment_id: &str, contents: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("update_user_data", environment_id)?;
        state.live_environment_mut(environment_id)?.env.user_data = Some(contents.to_string());
        Ok(())
    }

    async fn create_network(
        &self,
        environment_id: &str,
        request: &NetworkRequest,
    ) -> Result<Network> {
        let mut state = self.state.write().await;
        state.enter("create_network", &format!("{environment_id}/{}", request.name))?;
        let id = state.next_id();
        let stored = state.live_environment_mut(environment_id)?;
        let network = Network {
            id,
            name: request.name.clone(),
            domain: request.domain.clone(),
            subnet: request.subnet.clone(),
            gateway: request.gateway.clone(),
            tunnelable: request.tunnelable,
        };
        stored.networks.insert(network.id.clone(), network.clone());
        Ok(network)
    }

    async fn get_network(&self, environment_id: &str, id: &str) -> Result<Network> {
        let mut state = self.state.write().await;
        state.enter("get_network", &format!("{environment_id}/{id}"))?;
        state
            .live_environment_mut(environment_id)?
            .networks
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("networks/{id}")))
    }

    async fn update_network(
        &self,
        environment_id: &str,
        id: &str,
        request: &NetworkRequest,
    ) -> Result<Network> {
        let mut state = self.state.write().await;
        state.enter("update_network", &format!("{environment_id}/{id}"))?;
        let network = state
            .live_environment_mut(environment_id)?
            .networks
            .get_mut(id)
            .ok_or_else(|| RemoteError::not_found(format!("networks/{id}")))?;
        network.name.clone_from(&request.name);
        network.domain.clone_from(&request.domain);
        network.subnet.clone_from(&request.subnet);
        network.gateway.clone_from(&request.gateway);
        network.tunnelable = request.tunnelable;
        Ok(network.clone())
    }

    async fn delete_network(&self, environment_id: &str, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("delete_network", &format!("{environment_id}/{id}"))?;
        state
            .live_environment_mut(environment_id)?
            .networks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(format!("networks/{id}")))
    }

    async fn list_networks(&self, environment_id: &str) -> Result<Vec<Network>> {
        let mut state = self.state.write().await;
        state.enter("list_networks", environment_id)?;
        Ok(state
            .live_environment_mut(environment_id)?
            .networks
            .values()
            .cloned()
            .collect())
    }

    async fn create_vm(&self, environment_id: &str, request: &CreateVmRequest) -> Result<Vm> {
        let mut state = self.state.write().await;
        state.enter("create_vm", &format!("{environment_id}/{}", request.vm_id))?;
        state.live_environment_mut(environment_id)?;
        let mut stored = state.new_vm(&request.template_id, &request.vm_id, self.settle.vm_reads);
        let vm = stored.observe();
        let env = state.live_environment_mut(environment_id)?;
        env.vms.insert(vm.id.clone(), stored);
        Ok(vm)
    }

    async fn get_vm(&self, environment_id: &str, id: &str) -> Result<Vm> {
        let mut state = self.state.write().await;
        state.enter("get_vm", &format!("{environment_id}/{id}"))?;
        let env = state.live_environment_mut(environment_id)?;
        let not_found = || RemoteError::not_found(format!("vms/{id}"));
        let Some(stored) = env.vms.get_mut(id) else {
            return Err(not_found());
        };
        if let Some(left) = stored.deleting.as_mut() {
            if *left == 0 {
                env.vms.remove(id);
                return Err(not_found());
            }
            *left = left.saturating_sub(1);
            let mut vm = stored.vm.clone();
            vm.runstate = Runstate::Busy;
            return Ok(vm);
        }
        Ok(stored.observe())
    }

    async fn update_vm(
        &self,
        environment_id: &str,
        id: &str,
        request: &UpdateVmRequest,
    ) -> Result<Vm> {
        let mut state = self.state.write().await;
        state.enter("update_vm", &format!("{environment_id}/{id}"))?;
        let busy_reads = self.settle.vm_reads;
        let stored = state.live_environment_mut(environment_id)?.live_vm_mut(id)?;
        if let Some(name) = &request.name {
            stored.vm.name.clone_from(name);
        }
        if let Some(cpus) = request.cpus {
            stored.vm.hardware.cpus = cpus;
        }
        if let Some(ram) = request.ram {
            stored.vm.hardware.ram = ram;
        }
        if let Some(runstate) = &request.runstate {
            stored.vm.runstate = runstate.clone();
        }
        stored.busy_reads = busy_reads;
        Ok(stored.observe())
    }

    async fn delete_vm(&self, environment_id: &str, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("delete_vm", &format!("{environment_id}/{id}"))?;
        let delete_reads = self.settle.delete_reads;
        let env = state.live_environment_mut(environment_id)?;
        env.live_vm_mut(id)?;
        if delete_reads == 0 {
            env.vms.remove(id);
        } else if let Some(stored) = env.vms.get_mut(id) {
            stored.deleting = Some(delete_reads);
        }
        Ok(())
    }

    async fn list_vms(&self, environment_id: &str) -> Result<Vec<Vm>> {
        let mut state = self.state.write().await;
        state.enter("list_vms", environment_id)?;
        Ok(state
            .live_environment_mut(environment_id)?
            .vms
            .values_mut()
            .filter(|stored| stored.deleting.is_none())
            .map(StoredVm::observe)
            .collect())
    }

    async fn add_disk(
        &self,
        environment_id: &str,
        vm_id: &str,
        request: &CreateDiskRequest,
    ) -> Result<Disk> {
        let mut state = self.state.write().await;
        state.enter("add_disk", &format!("{environment_id}/{vm_id}/{}", request.size))?;
        let disk_id = state.next_id();
        let stored = state.live_environment_mut(environment_id)?.live_vm_mut(vm_id)?;
        let lun = stored.vm.hardware.disks.len();
        let disk = Disk {
            id: format!("disk-{disk_id}"),
            size: request.size,
            disk_type: request
                .disk_type
                .clone()
                .unwrap_or_else(|| "SCSI".to_string()),
            controller: "0".to_string(),
            lun: lun.to_string(),
            name: None,
        };
        stored.vm.hardware.disks.push(disk.clone());
        Ok(disk)
    }

    async fn remove_disk(&self, environment_id: &str, vm_id: &str, disk_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("remove_disk", &format!("{environment_id}/{vm_id}/{disk_id}"))?;
        let stored = state.live_environment_mut(environment_id)?.live_vm_mut(vm_id)?;
        let disks = &mut stored.vm.hardware.disks;
        let before = disks.len();
        disks.retain(|d| d.id != disk_id || d.lun == "0");
        if disks.len() == before {
            return Err(RemoteError::not_found(format!("disks/{disk_id}")));
        }
        Ok(())
    }

    async fn create_interface(
        &self,
        environment_id: &str,
        vm_id: &str,
        request: &CreateInterfaceRequest,
    ) -> Result<Interface> {
        let mut state = self.state.write().await;
        state.enter(
            "create_interface",
            &format!("{environment_id}/{vm_id}/{}", request.network_id),
        )?;
        let nic_id = state.next_id();
        let env = state.live_environment_mut(environment_id)?;
        if !env.networks.contains_key(&request.network_id) {
            return Err(RemoteError::not_found(format!(
                "networks/{}",
                request.network_id
            )));
        }
        let stored = env.live_vm_mut(vm_id)?;
        let ordinal = stored.vm.interfaces.len().saturating_add(1);
        let interface = Interface {
            id: format!("nic-{nic_id}"),
            ip: Some(
                request
                    .ip
                    .clone()
                    .unwrap_or_else(|| format!("10.0.0.{ordinal}")),
            ),
            hostname: Some(
                request
                    .hostname
                    .clone()
                    .unwrap_or_else(|| format!("host-{nic_id}")),
            ),
            network_id: Some(request.network_id.clone()),
            nic_type: request.nic_type.clone(),
            services: Vec::new(),
        };
        stored.vm.interfaces.push(interface.clone());
        Ok(interface)
    }

    async fn create_published_service(
        &self,
        environment_id: &str,
        vm_id: &str,
        interface_id: &str,
        request: &CreateServiceRequest,
    ) -> Result<PublishedService> {
        let mut state = self.state.write().await;
        state.enter(
            "create_published_service",
            &format!("{environment_id}/{vm_id}/{interface_id}/{}", request.internal_port),
        )?;
        let service_id = state.next_id();
        let external_port = 20_000_u16.saturating_add(u16::try_from(state.next_id).unwrap_or(0));
        let interface = state
            .live_environment_mut(environment_id)?
            .live_vm_mut(vm_id)?
            .vm
            .interfaces
            .iter_mut()
            .find(|nic| nic.id == interface_id)
            .ok_or_else(|| RemoteError::not_found(format!("interfaces/{interface_id}")))?;
        let service = PublishedService {
            id: service_id,
            internal_port: request.internal_port,
            external_ip: SERVICE_HOST.to_string(),
            external_port,
        };
        interface.services.push(service.clone());
        Ok(service)
    }

    async fn delete_published_service(
        &self,
        environment_id: &str,
        vm_id: &str,
        interface_id: &str,
        service_id: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter(
            "delete_published_service",
            &format!("{environment_id}/{vm_id}/{interface_id}/{service_id}"),
        )?;
        let interface = state
            .live_environment_mut(environment_id)?
            .live_vm_mut(vm_id)?
            .vm
            .interfaces
            .iter_mut()
            .find(|nic| nic.id == interface_id)
            .ok_or_else(|| RemoteError::not_found(format!("interfaces/{interface_id}")))?;
        let before = interface.services.len();
        interface.services.retain(|s| s.id != service_id);
        if interface.services.len() == before {
            return Err(RemoteError::not_found(format!("services/{service_id}")));
        }
        Ok(())
    }

    async fn create_label_category(&self, request: &LabelCategoryRequest) -> Result<LabelCategory> {
        let mut state = self.state.write().await;
        state.enter("create_label_category", &request.name)?;
        if let Some(disabled) = state
            .label_categories
            .values_mut()
            .find(|c| !c.enabled && c.name == request.name)
        {
            // Disabled categories are re-enabled rather than duplicated.
            disabled.enabled = true;
            disabled.single_value = request.single_value;
            return Ok(disabled.clone());
        }
        if state.label_categories.values().any(|c| c.name == request.name) {
            return Err(RemoteError::status(
                422,
                format!("label category '{}' exists", request.name),
            ));
        }
        let category = LabelCategory {
            id: state.next_id(),
            name: request.name.clone(),
            single_value: request.single_value,
            enabled: true,
        };
        state
            .label_categories
            .insert(category.id.clone(), category.clone());
        Ok(category)
    }

    async fn get_label_category(&self, id: &str) -> Result<LabelCategory> {
        let mut state = self.state.write().await;
        state.enter("get_label_category", id)?;
        state
            .label_categories
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("label_categories/{id}")))
    }

    async fn delete_label_category(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("delete_label_category", id)?;
        let category = state
            .label_categories
            .get_mut(id)
            .ok_or_else(|| RemoteError::not_found(format!("label_categories/{id}")))?;
        category.enabled = false;
        Ok(())
    }

    async fn list_label_categories(&self) -> Result<Vec<LabelCategory>> {
        let mut state = self.state.write().await;
        state.enter("list_label_categories", "")?;
        Ok(state.label_categories.values().cloned().collect())
    }

    async fn create_tunnel(&self, request: &TunnelRequest) -> Result<Tunnel> {
        let mut state = self.state.write().await;
        state.enter(
            "create_tunnel",
            &format!("{}->{}", request.source_network_id, request.target_network_id),
        )?;
        for network_id in [&request.source_network_id, &request.target_network_id] {
            if !state.network_exists(network_id) {
                return Err(RemoteError::not_found(format!("networks/{network_id}")));
            }
        }
        let tunnel = Tunnel {
            id: format!("tunnel-{}", state.next_id()),
            source_network_id: request.source_network_id.clone(),
            target_network_id: request.target_network_id.clone(),
            status: Some("connected".to_string()),
        };
        state.tunnels.insert(tunnel.id.clone(), tunnel.clone());
        Ok(tunnel)
    }

    async fn get_tunnel(&self, id: &str) -> Result<Tunnel> {
        let mut state = self.state.write().await;
        state.enter("get_tunnel", id)?;
        state
            .tunnels
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("tunnels/{id}")))
    }

    async fn delete_tunnel(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("delete_tunnel", id)?;
        state
            .tunnels
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(format!("tunnels/{id}")))
    }

    async fn list_tunnels(&self) -> Result<Vec<Tunnel>> {
        let mut state = self.state.write().await;
        state.enter("list_tunnels", "")?;
        Ok(state.tunnels.values().cloned().collect())
    }
}
