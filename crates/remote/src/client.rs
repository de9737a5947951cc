//! HTTP implementation of the Remote Service.
//!
//! Paths follow the v2 provisioning API. Transport-level retries are the
//! caller's concern; every non-success status is surfaced once.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use labsync_core::ProviderConfig;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::error::{RemoteError, Result};
use crate::service::RemoteService;
use crate::types::{
    CreateDiskRequest, CreateEnvironmentRequest, CreateInterfaceRequest, CreateServiceRequest,
    CreateVmRequest, Disk, Environment, Interface, Label, LabelCategory, LabelCategoryRequest,
    LabelRequest, Network, NetworkRequest, Project, ProjectRequest, PublishedService, Tag, Tunnel,
    TunnelRequest, UpdateEnvironmentRequest, UpdateVmRequest, Vm,
};

/// Account credentials forwarded as HTTP basic auth.
#[derive(Clone)]
struct Credentials {
    username: String,
    api_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

/// Remote Service backed by the provisioning HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRemoteService {
    base_url: Url,
    credentials: Arc<Credentials>,
    http_client: reqwest::Client,
}

impl HttpRemoteService {
    /// Build a client from provider configuration.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let base_url = config
            .base_url()
            .map_err(|e| RemoteError::config_error(e.to_string()))?;
        Self::new(
            base_url,
            &config.username,
            &config.api_token,
            config.request_timeout(),
        )
    }

    /// Build a client for an explicit base URL.
    pub fn new(
        base_url: Url,
        username: &str,
        api_token: &str,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::config_error(e.to_string()))?;

        Ok(Self {
            base_url,
            credentials: Arc::new(Credentials {
                username: username.to_string(),
                api_token: api_token.to_string(),
            }),
            http_client,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let response = self.dispatch(method, path, body).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            warn!(path = %path, error = %e, "Unparseable response body");
            RemoteError::invalid_response(format!("{path}: {e}"))
        })
    }

    async fn send_empty<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<()>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.dispatch(method, path, body).await.map(|_| ())
    }

    async fn dispatch<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response>
    where
        B: Serialize + ?Sized + Sync,
    {
        let url = self.url(path)?;
        debug!(method = %method, url = %url, "Remote request");

        let request = self
            .http_client
            .request(method, url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.api_token))
            .header(reqwest::header::ACCEPT, "application/json");
        let request = match body {
            Some(body) => request.json(body),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::not_found(path));
        }
        Err(RemoteError::status(status.as_u16(), message))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send::<(), T>(Method::GET, path, None).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.send_empty::<()>(Method::DELETE, path, None).await
    }
}

fn environment_path(id: &str) -> String {
    format!("v2/configurations/{id}")
}

fn vm_path(environment_id: &str, vm_id: &str) -> String {
    format!("v2/configurations/{environment_id}/vms/{vm_id}")
}

fn interface_path(environment_id: &str, vm_id: &str, interface_id: &str) -> String {
    format!("{}/interfaces/{interface_id}", vm_path(environment_id, vm_id))
}

#[async_trait]
impl RemoteService for HttpRemoteService {
    async fn create_project(&self, request: &ProjectRequest) -> Result<Project> {
        self.send(Method::POST, "v2/projects", Some(request)).await
    }

    async fn get_project(&self, id: &str) -> Result<Project> {
        self.get(&format!("v2/projects/{id}")).await
    }

    async fn update_project(&self, id: &str, request: &ProjectRequest) -> Result<Project> {
        self.send(Method::PUT, &format!("v2/projects/{id}"), Some(request))
            .await
    }

    async fn delete_project(&self, id: &str) -> Result<()> {
        self.delete(&format!("v2/projects/{id}")).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        self.get("v2/projects").await
    }

    async fn create_environment(&self, request: &CreateEnvironmentRequest) -> Result<Environment> {
        self.send(Method::POST, "v2/configurations", Some(request))
            .await
    }

    async fn get_environment(&self, id: &str) -> Result<Environment> {
        self.get(&environment_path(id)).await
    }

    async fn update_environment(
        &self,
        id: &str,
        request: &UpdateEnvironmentRequest,
    ) -> Result<Environment> {
        self.send(Method::PUT, &environment_path(id), Some(request))
            .await
    }

    async fn delete_environment(&self, id: &str) -> Result<()> {
        self.delete(&environment_path(id)).await
    }

    async fn list_environments(&self) -> Result<Vec<Environment>> {
        self.get("v2/configurations").await
    }

    async fn create_tag(&self, environment_id: &str, value: &str) -> Result<Tag> {
        let path = format!("{}/tags", environment_path(environment_id));
        let tags: Vec<Tag> = self
            .send(Method::PUT, &path, Some(&json!([{ "value": value }])))
            .await?;
        tags.into_iter()
            .find(|tag| tag.value.eq_ignore_ascii_case(value))
            .ok_or_else(|| RemoteError::invalid_response(format!("tag '{value}' missing after create")))
    }

    async fn delete_tag(&self, environment_id: &str, tag_id: &str) -> Result<()> {
        self.delete(&format!("{}/tags/{tag_id}", environment_path(environment_id)))
            .await
    }

    async fn create_label(&self, environment_id: &str, request: &LabelRequest) -> Result<Label> {
        let path = format!("{}/labels", environment_path(environment_id));
        let labels: Vec<Label> = self
            .send(Method::PUT, &path, Some(&[request]))
            .await?;
        labels
            .into_iter()
            .find(|label| label.category == request.category && label.value == request.value)
            .ok_or_else(|| {
                RemoteError::invalid_response(format!(
                    "label '{}:{}' missing after create",
                    request.category, request.value
                ))
            })
    }

    async fn delete_label(&self, environment_id: &str, label_id: &str) -> Result<()> {
        self.delete(&format!(
            "{}/labels/{label_id}",
            environment_path(environment_id)
        ))
        .await
    }

    async fn update_user_data(&self, environment_id: &str, contents: &str) -> Result<()> {
        let path = format!("{}/user_data.json", environment_path(environment_id));
        self.send_empty(Method::PUT, &path, Some(&json!({ "contents": contents })))
            .await
    }

    async fn create_network(
        &self,
        environment_id: &str,
        request: &NetworkRequest,
    ) -> Result<Network> {
        let path = format!("{}/networks", environment_path(environment_id));
        self.send(Method::POST, &path, Some(request)).await
    }

    async fn get_network(&self, environment_id: &str, id: &str) -> Result<Network> {
        self.get(&format!("{}/networks/{id}", environment_path(environment_id)))
            .await
    }

    async fn update_network(
        &self,
        environment_id: &str,
        id: &str,
        request: &NetworkRequest,
    ) -> Result<Network> {
        let path = format!("{}/networks/{id}", environment_path(environment_id));
        self.send(Method::PUT, &path, Some(request)).await
    }

    async fn delete_network(&self, environment_id: &str, id: &str) -> Result<()> {
        self.delete(&format!("{}/networks/{id}", environment_path(environment_id)))
            .await
    }

    async fn list_networks(&self, environment_id: &str) -> Result<Vec<Network>> {
        self.get(&format!("{}/networks", environment_path(environment_id)))
            .await
    }

    /// The API copies template VMs by updating the environment; the new VM is
    /// the one whose id was not present before the call.
    async fn create_vm(&self, environment_id: &str, request: &CreateVmRequest) -> Result<Vm> {
        let before: HashSet<String> = self
            .get_environment(environment_id)
            .await?
            .vms
            .into_iter()
            .map(|vm| vm.id)
            .collect();

        let body = json!({
            "template_id": request.template_id,
            "vm_ids": [request.vm_id],
        });
        let after: Environment = self
            .send(Method::PUT, &environment_path(environment_id), Some(&body))
            .await?;

        let created = after
            .vms
            .into_iter()
            .find(|vm| !before.contains(&vm.id))
            .ok_or_else(|| {
                RemoteError::invalid_response(format!(
                    "no new VM in environment {environment_id} after copying {}",
                    request.vm_id
                ))
            })?;
        self.get_vm(environment_id, &created.id).await
    }

    async fn get_vm(&self, environment_id: &str, id: &str) -> Result<Vm> {
        self.get(&vm_path(environment_id, id)).await
    }

    async fn update_vm(
        &self,
        environment_id: &str,
        id: &str,
        request: &UpdateVmRequest,
    ) -> Result<Vm> {
        let body = json!({
            "name": request.name,
            "runstate": request.runstate,
            "hardware": { "cpus": request.cpus, "ram": request.ram },
        });
        self.send(Method::PUT, &vm_path(environment_id, id), Some(&strip_nulls(body)))
            .await
    }

    async fn delete_vm(&self, environment_id: &str, id: &str) -> Result<()> {
        self.delete(&vm_path(environment_id, id)).await
    }

    async fn list_vms(&self, environment_id: &str) -> Result<Vec<Vm>> {
        self.get(&format!("{}/vms", environment_path(environment_id)))
            .await
    }

    async fn add_disk(
        &self,
        environment_id: &str,
        vm_id: &str,
        request: &CreateDiskRequest,
    ) -> Result<Disk> {
        let before: HashSet<String> = self
            .get_vm(environment_id, vm_id)
            .await?
            .hardware
            .disks
            .into_iter()
            .map(|disk| disk.id)
            .collect();

        let body = json!({ "hardware": { "disks": { "new": [request.size] } } });
        let after: Vm = self
            .send(Method::PUT, &vm_path(environment_id, vm_id), Some(&body))
            .await?;

        after
            .hardware
            .disks
            .into_iter()
            .find(|disk| !before.contains(&disk.id))
            .ok_or_else(|| {
                RemoteError::invalid_response(format!("no new disk on VM {vm_id} after add"))
            })
    }

    async fn remove_disk(&self, environment_id: &str, vm_id: &str, disk_id: &str) -> Result<()> {
        let body = json!({
            "hardware": { "disks": { "existing": { disk_id: { "id": disk_id, "size": null } } } }
        });
        self.send_empty(Method::PUT, &vm_path(environment_id, vm_id), Some(&body))
            .await
    }

    async fn create_interface(
        &self,
        environment_id: &str,
        vm_id: &str,
        request: &CreateInterfaceRequest,
    ) -> Result<Interface> {
        let path = format!("{}/interfaces", vm_path(environment_id, vm_id));
        self.send(Method::POST, &path, Some(request)).await
    }

    async fn create_published_service(
        &self,
        environment_id: &str,
        vm_id: &str,
        interface_id: &str,
        request: &CreateServiceRequest,
    ) -> Result<PublishedService> {
        let path = format!(
            "{}/services",
            interface_path(environment_id, vm_id, interface_id)
        );
        self.send(Method::POST, &path, Some(request)).await
    }

    async fn delete_published_service(
        &self,
        environment_id: &str,
        vm_id: &str,
        interface_id: &str,
        service_id: &str,
    ) -> Result<()> {
        self.delete(&format!(
            "{}/services/{service_id}",
            interface_path(environment_id, vm_id, interface_id)
        ))
        .await
    }

    async fn create_label_category(&self, request: &LabelCategoryRequest) -> Result<LabelCategory> {
        self.send(Method::POST, "v2/label_categories", Some(request))
            .await
    }

    async fn get_label_category(&self, id: &str) -> Result<LabelCategory> {
        self.get(&format!("v2/label_categories/{id}")).await
    }

    async fn delete_label_category(&self, id: &str) -> Result<()> {
        self.send_empty(
            Method::PUT,
            &format!("v2/label_categories/{id}"),
            Some(&json!({ "enabled": false })),
        )
        .await
    }

    async fn list_label_categories(&self) -> Result<Vec<LabelCategory>> {
        self.get("v2/label_categories").await
    }

    async fn create_tunnel(&self, request: &TunnelRequest) -> Result<Tunnel> {
        self.send(Method::POST, "v2/tunnels", Some(request)).await
    }

    async fn get_tunnel(&self, id: &str) -> Result<Tunnel> {
        self.get(&format!("v2/tunnels/{id}")).await
    }

    async fn delete_tunnel(&self, id: &str) -> Result<()> {
        self.delete(&format!("v2/tunnels/{id}")).await
    }

    async fn list_tunnels(&self) -> Result<Vec<Tunnel>> {
        self.get("v2/tunnels").await
    }
}

/// Drop null members so unset optional fields never reach the server.
fn strip_nulls(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let cleaned: serde_json::Map<String, serde_json::Value> = map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .filter(|(_, v)| !matches!(v, serde_json::Value::Object(m) if m.is_empty()))
                .collect();
            serde_json::Value::Object(cleaned)
        }
        other => other,
    }
}
