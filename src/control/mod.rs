//! Model control plane: deploy, list, and delete model workloads on
//! the cluster orchestrator.
//!
//! The orchestrator itself is an external collaborator behind the
//! [`DeploymentManager`] capability. When no manager is wired in
//! (the gateway runs outside a cluster) every operation fails with a
//! precondition error, not a server error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{get_with_fallback, CacheService};
use crate::error::ApiError;

const K8S_STATUS_TTL: Duration = Duration::from_secs(2 * 60);
const CLUSTER_STATUS_TTL: Duration = Duration::from_secs(2 * 60);
const GPU_TTL: Duration = Duration::from_secs(5 * 60);
const MODELS_TTL: Duration = Duration::from_secs(5 * 60);

const MODELS_KEY: &str = "control:models";

// ---------------------------------------------------------------------------
// Capability types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesStatus {
    pub in_cluster: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node_count: u32,
    pub ready_nodes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuNode {
    pub name: String,
    pub gpus: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

/// Requested compute resources for a model workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadResources {
    pub cpu: String,
    pub memory: String,
}

/// A deployed (or requested) model workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDeployment {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    pub gpu_count: u32,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub status: String,
}

/// `POST /v1/models` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateModelSpec {
    pub model_name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub gpu_count: i64,
    #[serde(default)]
    pub resources: Option<WorkloadResources>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
}

/// Orchestrator client capability.
#[async_trait]
pub trait DeploymentManager: Send + Sync {
    async fn kubernetes_status(&self) -> anyhow::Result<KubernetesStatus>;
    async fn cluster_status(&self) -> anyhow::Result<ClusterStatus>;
    async fn list_gpu_nodes(&self) -> anyhow::Result<Vec<GpuNode>>;
    async fn default_storage_class(&self) -> anyhow::Result<Option<String>>;
    async fn list_deployments(&self) -> anyhow::Result<Vec<ModelDeployment>>;
    async fn create_deployment(&self, spec: &CreateModelSpec) -> anyhow::Result<ModelDeployment>;
    async fn delete_deployment(&self, name: &str) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// `--served-model-name` must name the model, either as two adjacent
/// args or in `--served-model-name=<name>` form.
fn served_model_name_matches(command: &[String], model_name: &str) -> bool {
    let joined = format!("--served-model-name={model_name}");
    if command.iter().any(|arg| *arg == joined) {
        return true;
    }
    command
        .windows(2)
        .any(|w| w[0] == "--served-model-name" && w[1] == model_name)
}

/// Validation gates on model creation.
pub fn validate_create(spec: &CreateModelSpec) -> Result<(), ApiError> {
    if spec.model_name.is_empty() {
        return Err(ApiError::InvalidRequest("model_name is required".into()));
    }
    if spec.image.is_empty() {
        return Err(ApiError::InvalidRequest("image is required".into()));
    }
    if spec.command.is_empty() {
        return Err(ApiError::InvalidRequest("command is required".into()));
    }
    if spec.gpu_count < 0 {
        return Err(ApiError::InvalidRequest("gpu_count must be >= 0".into()));
    }
    if spec.resources.is_none() {
        return Err(ApiError::InvalidRequest("resources are required".into()));
    }
    if !served_model_name_matches(&spec.command, &spec.model_name) {
        return Err(ApiError::InvalidRequest(
            "--served-model-name must match model_name".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct ControlPlane {
    manager: Option<Arc<dyn DeploymentManager>>,
    cache: Arc<dyn CacheService>,
}

impl ControlPlane {
    pub fn new(manager: Option<Arc<dyn DeploymentManager>>, cache: Arc<dyn CacheService>) -> Self {
        Self { manager, cache }
    }

    fn manager(&self) -> Result<&Arc<dyn DeploymentManager>, ApiError> {
        self.manager.as_ref().ok_or_else(|| {
            ApiError::PreconditionFailed("gateway is not running in a cluster".into())
        })
    }

    async fn cached<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<T, ApiError>
    where
        T: serde::de::DeserializeOwned + Serialize,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let loaded = get_with_fallback(self.cache.as_ref(), key, ttl, false, || async {
            let value = loader().await?;
            serde_json::to_string(&value).map_err(anyhow::Error::from)
        })
        .await
        .map_err(|e| ApiError::PreconditionFailed(e.to_string()))?;
        serde_json::from_str(&loaded.value)
            .map_err(|e| ApiError::Internal(format!("bad cached control-plane entry: {e}")))
    }

    pub async fn kubernetes_status(&self) -> Result<KubernetesStatus, ApiError> {
        let manager = self.manager()?.clone();
        self.cached("control:k8s-status", K8S_STATUS_TTL, || async move {
            manager.kubernetes_status().await
        })
        .await
    }

    pub async fn cluster_status(&self) -> Result<ClusterStatus, ApiError> {
        let manager = self.manager()?.clone();
        self.cached("control:cluster-status", CLUSTER_STATUS_TTL, || async move {
            manager.cluster_status().await
        })
        .await
    }

    pub async fn gpu_resources(&self) -> Result<Vec<GpuNode>, ApiError> {
        let manager = self.manager()?.clone();
        self.cached("control:gpus", GPU_TTL, || async move {
            manager.list_gpu_nodes().await
        })
        .await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelDeployment>, ApiError> {
        let manager = self.manager()?.clone();
        self.cached(MODELS_KEY, MODELS_TTL, || async move {
            manager.list_deployments().await
        })
        .await
    }

    pub async fn create_model(&self, spec: &CreateModelSpec) -> Result<ModelDeployment, ApiError> {
        let manager = self.manager()?;
        validate_create(spec)?;

        let mut spec = spec.clone();
        if spec.storage_class.is_none() {
            match manager.default_storage_class().await {
                Ok(class) => spec.storage_class = class,
                Err(e) => warn!(error = %e, "default storage class lookup failed"),
            }
        }

        let deployment = manager
            .create_deployment(&spec)
            .await
            .map_err(|e| ApiError::PreconditionFailed(e.to_string()))?;
        self.invalidate(&spec.model_name, spec.organization_id.as_deref())
            .await;
        Ok(deployment)
    }

    pub async fn delete_model(
        &self,
        name: &str,
        organization_id: Option<&str>,
    ) -> Result<(), ApiError> {
        let manager = self.manager()?;
        manager
            .delete_deployment(name)
            .await
            .map_err(|e| ApiError::PreconditionFailed(e.to_string()))?;
        self.invalidate(name, organization_id).await;
        Ok(())
    }

    /// Drop the per-model, organization, and catalogue cache entries.
    async fn invalidate(&self, model_name: &str, organization_id: Option<&str>) {
        let mut keys = vec![
            format!("control:model:{model_name}"),
            MODELS_KEY.to_string(),
        ];
        if let Some(org) = organization_id {
            keys.push(format!("control:models:org:{org}"));
        }
        for key in keys {
            if let Err(e) = self.cache.delete(&key).await {
                warn!(key, error = %e, "control-plane cache invalidation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec() -> CreateModelSpec {
        CreateModelSpec {
            model_name: "jan-v1-4b".into(),
            image: "vllm/vllm-openai:v0.8".into(),
            command: vec![
                "python3".into(),
                "-m".into(),
                "vllm.entrypoints.openai.api_server".into(),
                "--served-model-name".into(),
                "jan-v1-4b".into(),
            ],
            gpu_count: 1,
            resources: Some(WorkloadResources {
                cpu: "4".into(),
                memory: "16Gi".into(),
            }),
            storage_class: None,
            organization_id: Some("org-1".into()),
        }
    }

    #[derive(Default)]
    struct FakeManager {
        creates: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl DeploymentManager for FakeManager {
        async fn kubernetes_status(&self) -> anyhow::Result<KubernetesStatus> {
            Ok(KubernetesStatus {
                in_cluster: true,
                version: Some("v1.31".into()),
            })
        }

        async fn cluster_status(&self) -> anyhow::Result<ClusterStatus> {
            Ok(ClusterStatus {
                node_count: 3,
                ready_nodes: 3,
            })
        }

        async fn list_gpu_nodes(&self) -> anyhow::Result<Vec<GpuNode>> {
            Ok(vec![GpuNode {
                name: "node-a".into(),
                gpus: 8,
                product: Some("H100".into()),
            }])
        }

        async fn default_storage_class(&self) -> anyhow::Result<Option<String>> {
            Ok(Some("standard".into()))
        }

        async fn list_deployments(&self) -> anyhow::Result<Vec<ModelDeployment>> {
            Ok(Vec::new())
        }

        async fn create_deployment(
            &self,
            spec: &CreateModelSpec,
        ) -> anyhow::Result<ModelDeployment> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(ModelDeployment {
                name: spec.model_name.clone(),
                image: spec.image.clone(),
                command: spec.command.clone(),
                gpu_count: spec.gpu_count as u32,
                replicas: 1,
                status: "pending".into(),
            })
        }

        async fn delete_deployment(&self, _name: &str) -> anyhow::Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn served_model_name_forms() {
        let two_args = vec![
            "--served-model-name".to_string(),
            "jan-v1-4b".to_string(),
        ];
        assert!(served_model_name_matches(&two_args, "jan-v1-4b"));
        assert!(!served_model_name_matches(&two_args, "other"));

        let joined = vec!["--served-model-name=jan-v1-4b".to_string()];
        assert!(served_model_name_matches(&joined, "jan-v1-4b"));

        assert!(!served_model_name_matches(&[], "jan-v1-4b"));
    }

    #[test]
    fn create_validation_gates() {
        assert!(validate_create(&spec()).is_ok());

        let mut no_image = spec();
        no_image.image.clear();
        assert!(validate_create(&no_image).is_err());

        let mut no_command = spec();
        no_command.command.clear();
        assert!(validate_create(&no_command).is_err());

        let mut negative_gpus = spec();
        negative_gpus.gpu_count = -1;
        assert!(validate_create(&negative_gpus).is_err());

        let mut no_resources = spec();
        no_resources.resources = None;
        assert!(validate_create(&no_resources).is_err());

        let mut wrong_name = spec();
        wrong_name.command.pop();
        wrong_name.command.push("other-model".into());
        assert!(validate_create(&wrong_name).is_err());
    }

    #[tokio::test]
    async fn absent_manager_is_a_precondition_failure() {
        let plane = ControlPlane::new(None, Arc::new(NoopCache));
        for err in [
            plane.kubernetes_status().await.map(|_| ()).unwrap_err(),
            plane.list_models().await.map(|_| ()).unwrap_err(),
            plane.create_model(&spec()).await.map(|_| ()).unwrap_err(),
            plane.delete_model("jan-v1-4b", None).await.unwrap_err(),
        ] {
            assert!(matches!(err, ApiError::PreconditionFailed(_)));
        }
    }

    #[tokio::test]
    async fn create_fills_default_storage_class_and_counts() {
        let manager = Arc::new(FakeManager::default());
        let plane = ControlPlane::new(Some(manager.clone()), Arc::new(NoopCache));

        let deployment = plane.create_model(&spec()).await.unwrap();
        assert_eq!(deployment.name, "jan-v1-4b");
        assert_eq!(manager.creates.load(Ordering::SeqCst), 1);

        plane.delete_model("jan-v1-4b", Some("org-1")).await.unwrap();
        assert_eq!(manager.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_spec_never_reaches_the_manager() {
        let manager = Arc::new(FakeManager::default());
        let plane = ControlPlane::new(Some(manager.clone()), Arc::new(NoopCache));

        let mut bad = spec();
        bad.gpu_count = -2;
        assert!(plane.create_model(&bad).await.is_err());
        assert_eq!(manager.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn status_queries_pass_through() {
        let manager = Arc::new(FakeManager::default());
        let plane = ControlPlane::new(Some(manager), Arc::new(NoopCache));

        let k8s = plane.kubernetes_status().await.unwrap();
        assert!(k8s.in_cluster);
        let cluster = plane.cluster_status().await.unwrap();
        assert_eq!(cluster.node_count, 3);
        let gpus = plane.gpu_resources().await.unwrap();
        assert_eq!(gpus[0].gpus, 8);
    }
}
