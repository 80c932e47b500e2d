//! Kubernetes cluster applier and readiness waiter.
//!
//! Applies rendered manifest texts with create-or-update semantics over a
//! closed set of resource kinds, deletes them idempotently, and polls pod
//! phases until a workload's replicas are all running.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clients::Cluster;
use crate::error::{is_not_found, Error, Result};
use crate::pipeline::retry::Deadline;

/// Upper bound on a single apply or delete call, independent of the
/// caller's deadline, so a misbehaving API server cannot hang a pipeline.
const CLUSTER_CALL_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Pod-template annotation stamped to force a rolling restart.
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Default pod poll interval for the readiness waiter.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Typed resources the applier understands. The set is closed; extend it
/// by adding a variant and its dispatch arms.
#[derive(Debug)]
enum KubeResource {
    Deployment(Box<Deployment>),
    Namespace(Box<Namespace>),
    ConfigMap(Box<ConfigMap>),
    Service(Box<Service>),
    Ingress(Box<Ingress>),
}

/// Minimal probe to route a manifest to its typed deserializer.
#[derive(Deserialize)]
struct KindProbe {
    kind: String,
}

/// Decode a manifest text into one of the supported typed resources.
fn decode_resource(manifest: &str) -> Result<KubeResource> {
    let probe: KindProbe =
        serde_yaml::from_str(manifest).map_err(|e| Error::Decode(e.to_string()))?;

    let decoded = match probe.kind.as_str() {
        "Deployment" => KubeResource::Deployment(Box::new(
            serde_yaml::from_str(manifest).map_err(|e| Error::Decode(e.to_string()))?,
        )),
        "Namespace" => KubeResource::Namespace(Box::new(
            serde_yaml::from_str(manifest).map_err(|e| Error::Decode(e.to_string()))?,
        )),
        "ConfigMap" => KubeResource::ConfigMap(Box::new(
            serde_yaml::from_str(manifest).map_err(|e| Error::Decode(e.to_string()))?,
        )),
        "Service" => KubeResource::Service(Box::new(
            serde_yaml::from_str(manifest).map_err(|e| Error::Decode(e.to_string()))?,
        )),
        "Ingress" => KubeResource::Ingress(Box::new(
            serde_yaml::from_str(manifest).map_err(|e| Error::Decode(e.to_string()))?,
        )),
        other => return Err(Error::UnsupportedKind(other.to_string())),
    };
    Ok(decoded)
}

impl KubeResource {
    fn kind(&self) -> &'static str {
        match self {
            KubeResource::Deployment(_) => "Deployment",
            KubeResource::Namespace(_) => "Namespace",
            KubeResource::ConfigMap(_) => "ConfigMap",
            KubeResource::Service(_) => "Service",
            KubeResource::Ingress(_) => "Ingress",
        }
    }
}

/// Cluster client over the five supported resource kinds plus pod listing.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    poll_interval: Duration,
}

impl KubeClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the readiness poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn apply_inner(
        &self,
        manifest: &str,
        namespace: &str,
        image_tag: &str,
    ) -> Result<(BTreeMap<String, String>, i32)> {
        let resource = decode_resource(manifest)?;
        info!(kind = resource.kind(), namespace, "applying resource");

        match resource {
            KubeResource::Deployment(deployment) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                self.apply_deployment(&api, *deployment, image_tag).await
            }
            KubeResource::Namespace(ns) => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                let applied = create_or_update(&api, *ns).await?;
                Ok((labels_of(&applied), 0))
            }
            KubeResource::ConfigMap(cm) => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let applied = create_or_update(&api, *cm).await?;
                Ok((labels_of(&applied), 0))
            }
            KubeResource::Service(svc) => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                let applied = create_or_update(&api, *svc).await?;
                Ok((labels_of(&applied), 0))
            }
            KubeResource::Ingress(ing) => {
                let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
                let applied = create_or_update(&api, *ing).await?;
                Ok((labels_of(&applied), 0))
            }
        }
    }

    /// Deployments get special update handling: when the live pod template
    /// already carries the target tag, the image change alone will not
    /// roll the pods, so stamp a restart annotation.
    async fn apply_deployment(
        &self,
        api: &Api<Deployment>,
        mut deployment: Deployment,
        image_tag: &str,
    ) -> Result<(BTreeMap<String, String>, i32)> {
        let name = deployment.name_any();
        let labels = labels_of(&deployment);
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(0);

        match api.get(&name).await {
            Ok(existing) => {
                if live_image_contains_tag(&existing, image_tag) {
                    info!(deployment = %name, image_tag, "image tag unchanged, stamping rolling restart");
                    mark_rolling_restart(&mut deployment);
                }
                deployment.metadata.resource_version = existing.resource_version();
                api.replace(&name, &PostParams::default(), &deployment)
                    .await?;
            }
            Err(err) if is_not_found(&err) => {
                info!(deployment = %name, "resource not found, creating");
                api.create(&PostParams::default(), &deployment).await?;
            }
            Err(err) => return Err(err.into()),
        }

        Ok((labels, replicas))
    }

    async fn delete_inner(&self, manifest: &str, namespace: &str) -> Result<()> {
        let resource = decode_resource(manifest)?;
        info!(kind = resource.kind(), namespace, "deleting resource");

        match resource {
            KubeResource::Deployment(deployment) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                delete_if_present(&api, &deployment.name_any()).await
            }
            KubeResource::Namespace(ns) => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                delete_if_present(&api, &ns.name_any()).await
            }
            KubeResource::ConfigMap(cm) => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                delete_if_present(&api, &cm.name_any()).await
            }
            KubeResource::Service(svc) => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                delete_if_present(&api, &svc.name_any()).await
            }
            KubeResource::Ingress(ing) => {
                let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
                delete_if_present(&api, &ing.name_any()).await
            }
        }
    }
}

/// GET by name, then create when absent or replace when present.
async fn create_or_update<K>(api: &Api<K>, mut obj: K) -> Result<K>
where
    K: kube::Resource + Clone + std::fmt::Debug + Serialize + DeserializeOwned,
    <K as kube::Resource>::DynamicType: Default,
{
    let name = obj.name_any();
    match api.get(&name).await {
        Ok(existing) => {
            debug!(name = %name, "resource found, updating");
            obj.meta_mut().resource_version = existing.resource_version();
            Ok(api.replace(&name, &PostParams::default(), &obj).await?)
        }
        Err(err) if is_not_found(&err) => {
            debug!(name = %name, "resource not found, creating");
            Ok(api.create(&PostParams::default(), &obj).await?)
        }
        Err(err) => Err(err.into()),
    }
}

/// Delete by name; absence is success.
async fn delete_if_present<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: kube::Resource + Clone + std::fmt::Debug + DeserializeOwned,
    <K as kube::Resource>::DynamicType: Default,
{
    match api.get(name).await {
        Ok(_) => {
            api.delete(name, &DeleteParams::default()).await?;
            Ok(())
        }
        Err(err) if is_not_found(&err) => {
            info!(name = %name, "resource not found, skipping deletion");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn labels_of<K: kube::Resource>(obj: &K) -> BTreeMap<String, String> {
    obj.meta().labels.clone().unwrap_or_default()
}

/// Whether the live deployment's first container image already carries
/// the target tag.
fn live_image_contains_tag(existing: &Deployment, image_tag: &str) -> bool {
    existing
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.containers.first())
        .and_then(|container| container.image.as_deref())
        .is_some_and(|image| image.contains(image_tag))
}

fn mark_rolling_restart(deployment: &mut Deployment) {
    let template = &mut deployment
        .spec
        .get_or_insert_with(Default::default)
        .template;
    template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
        .insert(
            RESTARTED_AT_ANNOTATION.to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
}

/// Build a `k=v,k=v` selector string from a label map.
fn label_selector(labels: &BTreeMap<String, String>) -> Result<String> {
    if labels.is_empty() {
        return Err(Error::EmptySelector);
    }
    Ok(labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(","))
}

/// All expected pods are running and nothing else matched the selector.
fn readiness_reached(running: usize, listed: usize, expected: i32) -> bool {
    running > 0 && running == listed && running as i64 == i64::from(expected)
}

#[async_trait]
impl Cluster for KubeClient {
    async fn apply(
        &self,
        manifest: &str,
        namespace: &str,
        image_tag: &str,
    ) -> Result<(BTreeMap<String, String>, i32)> {
        tokio::time::timeout(
            CLUSTER_CALL_TIMEOUT,
            self.apply_inner(manifest, namespace, image_tag),
        )
        .await
        .map_err(|_| Error::Cancelled)?
    }

    async fn delete(&self, manifest: &str, namespace: &str) -> Result<()> {
        tokio::time::timeout(CLUSTER_CALL_TIMEOUT, self.delete_inner(manifest, namespace))
            .await
            .map_err(|_| Error::Cancelled)?
    }

    async fn wait_for_pods_running(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        expected: i32,
        deadline: Deadline,
    ) -> Result<()> {
        let selector = label_selector(labels)?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector);

        loop {
            let pod_list = pods.list(&params).await?;
            let listed = pod_list.items.len();
            let running = pod_list
                .items
                .iter()
                .filter(|pod| {
                    pod.status
                        .as_ref()
                        .and_then(|status| status.phase.as_deref())
                        == Some("Running")
                })
                .count();

            info!(
                selector = %selector,
                namespace,
                running,
                listed,
                expected,
                "waiting for pods to be running"
            );

            if readiness_reached(running, listed, expected) {
                return Ok(());
            }
            if running as i64 > i64::from(expected) {
                warn!(
                    selector = %selector,
                    running,
                    expected,
                    "more running pods than expected, still waiting"
                );
            }

            deadline.sleep(self.poll_interval).await?;
        }
    }
}
