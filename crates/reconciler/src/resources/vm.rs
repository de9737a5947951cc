//! Virtual machines: a template VM copied into an environment, then shaped.
//!
//! Disks and published services carry no id in the desired state. Their
//! remote ids are bound to declared names by the correlation index and kept
//! in the observed state, so later passes see the same names.

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::time::Duration;

use async_trait::async_trait;
use labsync_remote::types::{
    CreateDiskRequest, CreateInterfaceRequest, CreateServiceRequest, CreateVmRequest, Interface,
    UpdateVmRequest, Vm,
};
use labsync_remote::{RemoteService, Runstate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{absent_if_missing, deleted_if_missing, present, require_non_blank};
use crate::context::ProviderContext;
use crate::correlation::{CorrelationIndex, DeclaredItem, ServiceKey, correlate_disks, normalize_ip};
use crate::diff::{CollectionChanges, DiffKey, apply_removals_then_additions, diff};
use crate::error::{Error, Result};
use crate::poller::{Observation, RunstateSets};
use crate::reconciler::{Applied, ResourceReconciler};
use crate::types::{ChangeReport, ResourceKind};

const CPU_RANGE: RangeInclusive<u32> = 1..=12;
const RAM_RANGE: RangeInclusive<u32> = 256..=131_072;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskSpec {
    pub name: String,
    /// Size in MB.
    pub size: u32,
    #[serde(default, rename = "type")]
    pub disk_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub name: String,
    pub internal_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceSpec {
    pub interface_type: String,
    pub network_id: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, rename = "published_service")]
    pub services: Vec<ServiceSpec>,
}

impl InterfaceSpec {
    /// Key an observed interface is matched on: its IP when one was
    /// declared, otherwise its network.
    fn correlation_key(&self) -> String {
        match &self.ip {
            Some(ip) => format!("ip:{}", normalize_ip(ip)),
            None => format!("net:{}", self.network_id),
        }
    }

    /// Everything but the published services, which can change in place.
    fn same_hardware(&self, other: &Self) -> bool {
        self.interface_type == other.interface_type
            && self.network_id == other.network_id
            && self.ip.as_deref().map(normalize_ip) == other.ip.as_deref().map(normalize_ip)
            && self.hostname == other.hostname
    }

    fn request(&self) -> CreateInterfaceRequest {
        CreateInterfaceRequest {
            nic_type: self.interface_type.clone(),
            network_id: self.network_id.clone(),
            ip: self.ip.clone(),
            hostname: self.hostname.clone(),
        }
    }
}

fn observed_keys(nic: &Interface) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    if let Some(ip) = &nic.ip {
        keys.push(format!("ip:{}", normalize_ip(ip)));
    }
    if let Some(network_id) = &nic.network_id {
        keys.push(format!("net:{network_id}"));
    }
    keys
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmDesired {
    pub environment_id: String,
    pub template_id: String,
    /// Id of the VM inside the template to copy.
    pub vm_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cpus: Option<u32>,
    /// RAM in MB.
    #[serde(default)]
    pub ram: Option<u32>,
    #[serde(default, rename = "disk")]
    pub disks: Vec<DiskSpec>,
    #[serde(default, rename = "network_interface")]
    pub interfaces: Vec<InterfaceSpec>,
}

impl VmDesired {
    /// Name and hardware fields that differ from `current`.
    fn hardware_request(&self, current: &Vm) -> UpdateVmRequest {
        UpdateVmRequest {
            name: self.name.clone().filter(|name| *name != current.name),
            cpus: self.cpus.filter(|cpus| *cpus != current.hardware.cpus),
            ram: self.ram.filter(|ram| *ram != current.hardware.ram),
            runstate: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedDisk {
    pub id: String,
    /// Declared name; `None` when no declaration matched.
    pub name: Option<String>,
    pub size: u32,
    #[serde(rename = "type")]
    pub disk_type: String,
    pub lun: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedService {
    pub id: String,
    pub name: Option<String>,
    pub internal_port: u16,
    pub external_ip: String,
    pub external_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedInterface {
    pub id: String,
    /// Position of the matching `network_interface` declaration.
    pub slot: Option<usize>,
    pub interface_type: String,
    pub network_id: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub services: Vec<ObservedService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmObserved {
    pub id: String,
    pub name: String,
    pub runstate: Runstate,
    pub cpus: u32,
    pub ram: u32,
    /// User-managed disks; the base disk is never listed.
    pub disks: Vec<ObservedDisk>,
    pub interfaces: Vec<ObservedInterface>,
}

impl DiffKey for DiskSpec {
    type Key = (Option<String>, u32);

    fn diff_key(&self) -> Self::Key {
        (Some(self.name.clone()), self.size)
    }
}

impl DiffKey for ObservedDisk {
    type Key = (Option<String>, u32);

    fn diff_key(&self) -> Self::Key {
        (self.name.clone(), self.size)
    }
}

impl DiffKey for ServiceSpec {
    type Key = (Option<String>, u16);

    fn diff_key(&self) -> Self::Key {
        (Some(self.name.clone()), self.internal_port)
    }
}

impl DiffKey for ObservedService {
    type Key = (Option<String>, u16);

    fn diff_key(&self) -> Self::Key {
        (self.name.clone(), self.internal_port)
    }
}

/// Remote ids already bound to declared names.
#[derive(Debug, Default)]
struct Bindings {
    disks: HashMap<String, String>,
    interfaces: HashMap<usize, String>,
    services: HashMap<(usize, String), String>,
}

impl Bindings {
    fn from_observed(observed: Option<&VmObserved>) -> Self {
        let mut bindings = Self::default();
        let Some(observed) = observed else {
            return bindings;
        };
        for disk in &observed.disks {
            if let Some(name) = &disk.name {
                bindings.disks.insert(name.clone(), disk.id.clone());
            }
        }
        for nic in &observed.interfaces {
            let Some(slot) = nic.slot else {
                continue;
            };
            bindings.interfaces.insert(slot, nic.id.clone());
            for service in &nic.services {
                if let Some(name) = &service.name {
                    bindings
                        .services
                        .insert((slot, name.clone()), service.id.clone());
                }
            }
        }
        bindings
    }
}

/// Present a remote VM under the names of its declarations.
fn flatten(vm: &Vm, desired: &VmDesired, bindings: &Bindings) -> VmObserved {
    let disks = correlate_disks(
        desired.disks.iter().map(|disk| {
            DeclaredItem::new(
                disk.name.clone(),
                disk.size,
                bindings.disks.get(&disk.name).cloned(),
            )
        }),
        &vm.hardware.disks,
    )
    .into_iter()
    .map(|(name, disk)| ObservedDisk {
        id: disk.id,
        name,
        size: disk.size,
        disk_type: disk.disk_type,
        lun: disk.lun,
    })
    .collect();

    let mut nic_index = CorrelationIndex::new(desired.interfaces.iter().enumerate().map(
        |(slot, spec)| {
            DeclaredItem::new(
                slot.to_string(),
                spec.correlation_key(),
                bindings.interfaces.get(&slot).cloned(),
            )
        },
    ));
    let slots: Vec<Option<usize>> = vm
        .interfaces
        .iter()
        .map(|nic| {
            nic_index
                .resolve_any(&nic.id, &observed_keys(nic))
                .and_then(|slot| slot.parse().ok())
        })
        .collect();

    let mut declared_services = Vec::new();
    for (nic, slot) in vm.interfaces.iter().zip(&slots) {
        let Some(slot) = *slot else {
            continue;
        };
        let Some(spec) = desired.interfaces.get(slot) else {
            continue;
        };
        let ip = normalize_ip(nic.ip.as_deref().unwrap_or_default());
        for service in &spec.services {
            declared_services.push(DeclaredItem::new(
                service.name.clone(),
                (ip.clone(), service.internal_port),
                bindings
                    .services
                    .get(&(slot, service.name.clone()))
                    .cloned(),
            ));
        }
    }
    let mut service_index: CorrelationIndex<ServiceKey> = CorrelationIndex::new(declared_services);

    let mut interfaces = Vec::with_capacity(vm.interfaces.len());
    for (nic, slot) in vm.interfaces.iter().zip(slots) {
        let ip = normalize_ip(nic.ip.as_deref().unwrap_or_default());
        let mut services = Vec::with_capacity(nic.services.len());
        for service in &nic.services {
            services.push(ObservedService {
                id: service.id.clone(),
                name: service_index.resolve(&service.id, &(ip.clone(), service.internal_port)),
                internal_port: service.internal_port,
                external_ip: service.external_ip.clone(),
                external_port: service.external_port,
            });
        }
        interfaces.push(ObservedInterface {
            id: nic.id.clone(),
            slot,
            interface_type: nic.nic_type.clone(),
            network_id: nic.network_id.clone(),
            ip: nic.ip.clone(),
            hostname: nic.hostname.clone(),
            services,
        });
    }

    if service_index.has_unclaimed() {
        warn!(id = %vm.id, "Declared published service not found on VM");
    }

    VmObserved {
        id: vm.id.clone(),
        name: vm.name.clone(),
        runstate: vm.runstate.clone(),
        cpus: vm.hardware.cpus,
        ram: vm.hardware.ram,
        disks,
        interfaces,
    }
}

fn duplicates<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = HashSet::new();
    names.into_iter().find(|name| !seen.insert(*name))
}

async fn fetch(service: &dyn RemoteService, environment_id: &str, id: &str) -> Result<Vm> {
    service
        .get_vm(environment_id, id)
        .await
        .map_err(|e| Error::remote("read vm", e))
}

/// VMs settle asynchronously after copies, hardware changes and power changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmReconciler;

impl VmReconciler {
    async fn settle(
        ctx: &ProviderContext,
        environment_id: &str,
        id: &str,
        sets: RunstateSets,
        timeout: Duration,
    ) -> Result<Vm> {
        let service = ctx.service();
        let config = ctx.runstate_wait(sets, timeout);
        ctx.waiter()
            .await_state(&config, move || async move {
                let vm = fetch(service, environment_id, id).await?;
                let label = vm.runstate.as_str().to_string();
                Ok(Observation::new(vm, label))
            })
            .await
    }

    async fn set_runstate(
        ctx: &ProviderContext,
        environment_id: &str,
        id: &str,
        runstate: Runstate,
        timeout: Duration,
    ) -> Result<Vm> {
        let sets = if runstate == Runstate::Running {
            RunstateSets::CREATE
        } else {
            RunstateSets::UPDATE
        };
        debug!(id, runstate = %runstate, "Changing VM runstate");
        ctx.service()
            .update_vm(environment_id, id, &UpdateVmRequest::runstate(runstate))
            .await
            .map_err(|e| Error::remote("update vm runstate", e))?;
        Self::settle(ctx, environment_id, id, sets, timeout).await
    }

    /// Apply name and hardware changes; cpu and ram need the VM powered off.
    async fn reshape(
        ctx: &ProviderContext,
        desired: &VmDesired,
        id: &str,
        current: Vm,
        timeout: Duration,
    ) -> Result<(Vm, bool)> {
        let environment_id = desired.environment_id.as_str();
        let request = desired.hardware_request(&current);
        if request.is_empty() {
            return Ok((current, false));
        }

        let power_cycle = current.runstate == Runstate::Running
            && (request.cpus.is_some() || request.ram.is_some());
        if power_cycle {
            Self::set_runstate(ctx, environment_id, id, Runstate::Stopped, timeout).await?;
        }

        ctx.service()
            .update_vm(environment_id, id, &request)
            .await
            .map_err(|e| Error::remote("update vm", e))?;
        let vm = Self::settle(ctx, environment_id, id, RunstateSets::UPDATE, timeout).await?;
        Ok((vm, power_cycle))
    }

    async fn reconcile_disks(
        service: &dyn RemoteService,
        desired: &VmDesired,
        id: &str,
        observed: &[ObservedDisk],
        bindings: &mut Bindings,
    ) -> Result<CollectionChanges> {
        let environment_id = desired.environment_id.as_str();
        let disks = diff(&desired.disks, observed);

        let mut outcome = apply_removals_then_additions(
            &disks,
            move |disk: &ObservedDisk| {
                let disk_id = disk.id.clone();
                async move {
                    service
                        .remove_disk(environment_id, id, &disk_id)
                        .await
                        .map_err(|e| Error::remote("remove disk", e))
                }
            },
            move |spec: &DiskSpec| {
                let spec = spec.clone();
                async move {
                    let request = CreateDiskRequest {
                        size: spec.size,
                        disk_type: spec.disk_type.clone(),
                    };
                    let disk = service
                        .add_disk(environment_id, id, &request)
                        .await
                        .map_err(|e| Error::remote("add disk", e))?;
                    Ok((spec.name, disk.id))
                }
            },
        )
        .await;

        bindings.disks.extend(std::mem::take(&mut outcome.added));
        outcome.into_result("disks")
    }

    async fn reconcile_services(
        service: &dyn RemoteService,
        desired: &VmDesired,
        id: &str,
        interfaces: &[ObservedInterface],
        bindings: &mut Bindings,
    ) -> Result<CollectionChanges> {
        let environment_id = desired.environment_id.as_str();
        let mut total = CollectionChanges::default();

        for nic in interfaces {
            let Some((slot, spec)) = nic
                .slot
                .and_then(|slot| desired.interfaces.get(slot).map(|spec| (slot, spec)))
            else {
                continue;
            };
            let services = diff(&spec.services, &nic.services);
            let nic_id = nic.id.as_str();

            let mut outcome = apply_removals_then_additions(
                &services,
                move |published: &ObservedService| {
                    let service_id = published.id.clone();
                    async move {
                        service
                            .delete_published_service(environment_id, id, nic_id, &service_id)
                            .await
                            .map_err(|e| Error::remote("delete published service", e))
                    }
                },
                move |spec: &ServiceSpec| {
                    let spec = spec.clone();
                    async move {
                        let request = CreateServiceRequest {
                            internal_port: spec.internal_port,
                        };
                        let published = service
                            .create_published_service(environment_id, id, nic_id, &request)
                            .await
                            .map_err(|e| Error::remote("create published service", e))?;
                        Ok(((slot, spec.name), published.id))
                    }
                },
            )
            .await;

            bindings.services.extend(std::mem::take(&mut outcome.added));
            let changes = outcome.into_result("published_services")?;
            total.removed = total.removed.saturating_add(changes.removed);
            total.added = total.added.saturating_add(changes.added);
        }
        Ok(total)
    }
}

#[async_trait]
impl ResourceReconciler for VmReconciler {
    type Desired = VmDesired;
    type Observed = VmObserved;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Vm
    }

    fn validate(&self, desired: &VmDesired) -> Result<()> {
        let kind = ResourceKind::Vm;
        require_non_blank(kind, "environment_id", &desired.environment_id)?;
        require_non_blank(kind, "template_id", &desired.template_id)?;
        require_non_blank(kind, "vm_id", &desired.vm_id)?;

        if let Some(cpus) = desired.cpus.filter(|cpus| !CPU_RANGE.contains(cpus)) {
            return Err(Error::invalid_desired(
                kind.as_str(),
                format!("cpus must be between {} and {}, got {cpus}", CPU_RANGE.start(), CPU_RANGE.end()),
            ));
        }
        if let Some(ram) = desired.ram.filter(|ram| !RAM_RANGE.contains(ram)) {
            return Err(Error::invalid_desired(
                kind.as_str(),
                format!("ram must be between {} and {} MB, got {ram}", RAM_RANGE.start(), RAM_RANGE.end()),
            ));
        }

        if let Some(name) = duplicates(desired.disks.iter().map(|disk| disk.name.as_str())) {
            return Err(Error::invalid_desired(
                kind.as_str(),
                format!("disk name '{name}' is declared twice"),
            ));
        }
        for nic in &desired.interfaces {
            require_non_blank(kind, "network_id", &nic.network_id)?;
            if let Some(name) = duplicates(nic.services.iter().map(|service| service.name.as_str())) {
                return Err(Error::invalid_desired(
                    kind.as_str(),
                    format!("published service '{name}' is declared twice on one interface"),
                ));
            }
        }
        Ok(())
    }

    fn requires_replacement(&self, prior: &VmDesired, desired: &VmDesired) -> Option<&'static str> {
        if prior.environment_id != desired.environment_id {
            return Some("environment_id");
        }
        if prior.template_id != desired.template_id {
            return Some("template_id");
        }
        if prior.vm_id != desired.vm_id {
            return Some("vm_id");
        }
        let same_interfaces = prior.interfaces.len() == desired.interfaces.len()
            && prior
                .interfaces
                .iter()
                .zip(&desired.interfaces)
                .all(|(before, after)| before.same_hardware(after));
        (!same_interfaces).then_some("network_interface")
    }

    /// Interfaces are create-only, so only hardware, disks and published
    /// services can drift.
    fn drifted(&self, desired: &VmDesired, observed: &VmObserved) -> bool {
        let hardware = desired.name.as_ref().is_some_and(|name| *name != observed.name)
            || desired.cpus.is_some_and(|cpus| cpus != observed.cpus)
            || desired.ram.is_some_and(|ram| ram != observed.ram);
        let services = observed.interfaces.iter().any(|nic| {
            nic.slot
                .and_then(|slot| desired.interfaces.get(slot))
                .is_some_and(|spec| !diff(&spec.services, &nic.services).is_empty())
        });
        hardware || services || !diff(&desired.disks, &observed.disks).is_empty()
    }

    async fn create(&self, ctx: &ProviderContext, desired: &VmDesired) -> Result<String> {
        let request = CreateVmRequest {
            template_id: desired.template_id.clone(),
            vm_id: desired.vm_id.clone(),
        };
        let vm = ctx
            .service()
            .create_vm(&desired.environment_id, &request)
            .await
            .map_err(|e| Error::remote("create vm", e))?;
        info!(id = %vm.id, environment_id = %desired.environment_id, "Copied VM into environment");
        Ok(vm.id)
    }

    async fn finish_create(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &VmDesired,
    ) -> Result<Applied<VmObserved>> {
        let service = ctx.service();
        let environment_id = desired.environment_id.as_str();
        let timeout = ctx.timeouts(ResourceKind::Vm).create;
        let mut bindings = Bindings::default();
        let mut report = ChangeReport::new();

        // A fresh copy settles powered off.
        let copied = Self::settle(ctx, environment_id, id, RunstateSets::UPDATE, timeout).await?;
        Self::reshape(ctx, desired, id, copied, timeout).await?;

        for disk in &desired.disks {
            let request = CreateDiskRequest {
                size: disk.size,
                disk_type: disk.disk_type.clone(),
            };
            let created = service
                .add_disk(environment_id, id, &request)
                .await
                .map_err(|e| Error::remote("add disk", e))?;
            bindings.disks.insert(disk.name.clone(), created.id);
        }
        report.record(
            "disks",
            CollectionChanges {
                removed: 0,
                added: desired.disks.len(),
            },
        );

        let mut published = 0_usize;
        for (slot, spec) in desired.interfaces.iter().enumerate() {
            let nic = service
                .create_interface(environment_id, id, &spec.request())
                .await
                .map_err(|e| Error::remote("create interface", e))?;
            for declared in &spec.services {
                let request = CreateServiceRequest {
                    internal_port: declared.internal_port,
                };
                let created = service
                    .create_published_service(environment_id, id, &nic.id, &request)
                    .await
                    .map_err(|e| Error::remote("create published service", e))?;
                bindings
                    .services
                    .insert((slot, declared.name.clone()), created.id);
                published = published.saturating_add(1);
            }
            bindings.interfaces.insert(slot, nic.id);
        }
        report.record(
            "interfaces",
            CollectionChanges {
                removed: 0,
                added: desired.interfaces.len(),
            },
        );
        report.record(
            "published_services",
            CollectionChanges {
                removed: 0,
                added: published,
            },
        );

        let vm = Self::set_runstate(ctx, environment_id, id, Runstate::Running, timeout).await?;
        info!(id, "VM running");
        Ok(Applied::new(id, flatten(&vm, desired, &bindings)).with_report(report))
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &VmDesired,
        prior: Option<&VmObserved>,
    ) -> Result<Option<VmObserved>> {
        let vm = absent_if_missing(
            ResourceKind::Vm,
            id,
            ctx.service().get_vm(&desired.environment_id, id).await,
        )?;
        Ok(vm.map(|vm| flatten(&vm, desired, &Bindings::from_observed(prior))))
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        id: &str,
        desired: &VmDesired,
        prior: Option<&VmObserved>,
    ) -> Result<Applied<VmObserved>> {
        let service = ctx.service();
        let environment_id = desired.environment_id.as_str();
        let timeout = ctx.timeouts(ResourceKind::Vm).update;
        let mut bindings = Bindings::from_observed(prior);
        let mut report = ChangeReport::new();

        let current = fetch(service, environment_id, id).await?;
        let (current, power_cycled) = Self::reshape(ctx, desired, id, current, timeout).await?;
        let observed = flatten(&current, desired, &bindings);

        for slot in 0..desired.interfaces.len() {
            if !observed.interfaces.iter().any(|nic| nic.slot == Some(slot)) {
                warn!(id, slot, "Declared network interface not found on VM");
            }
        }

        report.record(
            "disks",
            Self::reconcile_disks(service, desired, id, &observed.disks, &mut bindings).await?,
        );
        report.record(
            "published_services",
            Self::reconcile_services(service, desired, id, &observed.interfaces, &mut bindings)
                .await?,
        );

        let vm = if power_cycled {
            Self::set_runstate(ctx, environment_id, id, Runstate::Running, timeout).await?
        } else {
            fetch(service, environment_id, id).await?
        };
        debug!(id, changes = report.total(), "VM reconciled");
        Ok(Applied::new(id, flatten(&vm, desired, &bindings)).with_report(report))
    }

    async fn delete(&self, ctx: &ProviderContext, id: &str, desired: &VmDesired) -> Result<()> {
        let service = ctx.service();
        let environment_id = desired.environment_id.as_str();
        deleted_if_missing(
            ResourceKind::Vm,
            id,
            service.delete_vm(environment_id, id).await,
        )?;

        let config = ctx.absence_wait(ctx.timeouts(ResourceKind::Vm).delete);
        ctx.waiter()
            .await_absence(&config, move || async move {
                present(service.get_vm(environment_id, id).await)
            })
            .await?;
        info!(id, "VM deleted");
        Ok(())
    }
}
