//! Orchestrator client backed by `kube`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt, stream};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams, Patch,
    PatchParams, PostParams,
};
use kube::Client;
use serde_json::Value;

use crate::application::ports::{KubeApi, LogStream};

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// `apiVersion`, `kind` and `metadata.name` of a manifest.
fn identity(manifest: &Value) -> Result<(String, String, String)> {
    let field = |pointer: &str| {
        manifest
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::to_string)
            .with_context(|| format!("manifest has no {pointer}"))
    };
    Ok((field("/apiVersion")?, field("/kind")?, field("/metadata/name")?))
}

fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = api_version.rsplit_once('/').unwrap_or(("", api_version));
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    /// Connect with the in-cluster or kubeconfig defaults.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("cannot build orchestrator client")?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Dynamic API for a manifest plus its object name.
    fn dynamic(&self, namespace: &str, manifest: &Value) -> Result<(Api<DynamicObject>, String)> {
        let (api_version, kind, name) = identity(manifest)?;
        let resource = api_resource(&api_version, &kind);
        Ok((
            Api::namespaced_with(self.client.clone(), namespace, &resource),
            name,
        ))
    }
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn ping(&self) -> Result<()> {
        let version = self
            .client
            .apiserver_version()
            .await
            .context("orchestrator API server is unreachable")?;
        tracing::debug!(version = %version.git_version, "orchestrator reachable");
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .context("cannot create pod")
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.pods(namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("cannot read pod {namespace}/{name}"))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .with_context(|| format!("cannot list pods in {namespace}"))?;
        Ok(pods.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("cannot delete pod {namespace}/{name}")),
        }
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        self.services(namespace)
            .create(&PostParams::default(), service)
            .await
            .context("cannot create service")
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.services(namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("cannot read service {namespace}/{name}"))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool> {
        match self
            .services(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("cannot delete service {namespace}/{name}")),
        }
    }

    async fn get_manifest(&self, namespace: &str, manifest: &Value) -> Result<Option<Value>> {
        let (api, name) = self.dynamic(namespace, manifest)?;
        let live = api
            .get_opt(&name)
            .await
            .with_context(|| format!("cannot read {name} in {namespace}"))?;
        live.map(|object| serde_json::to_value(object).context("cannot encode manifest"))
            .transpose()
    }

    async fn create_manifest(&self, namespace: &str, manifest: &Value) -> Result<()> {
        let (api, name) = self.dynamic(namespace, manifest)?;
        let object: DynamicObject =
            serde_json::from_value(manifest.clone()).context("cannot decode manifest")?;
        api.create(&PostParams::default(), &object)
            .await
            .with_context(|| format!("cannot create {name} in {namespace}"))?;
        Ok(())
    }

    async fn patch_manifest(&self, namespace: &str, manifest: &Value) -> Result<()> {
        let (api, name) = self.dynamic(namespace, manifest)?;
        api.patch(&name, &PatchParams::default(), &Patch::Merge(manifest))
            .await
            .with_context(|| format!("cannot patch {name} in {namespace}"))?;
        Ok(())
    }

    async fn delete_manifest(&self, namespace: &str, manifest: &Value) -> Result<bool> {
        let (api, name) = self.dynamic(namespace, manifest)?;
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("cannot delete {name} in {namespace}")),
        }
    }

    fn pod_logs(&self, namespace: &str, name: &str) -> LogStream {
        let api = self.pods(namespace);
        let name = name.to_string();
        let lines = async move {
            let params = LogParams {
                follow: true,
                ..LogParams::default()
            };
            let reader = api
                .log_stream(&name, &params)
                .await
                .with_context(|| format!("cannot attach to pod {name}"))?;
            Ok::<_, anyhow::Error>(reader.lines().map_err(anyhow::Error::from))
        };
        stream::once(lines).try_flatten().boxed()
    }
}
