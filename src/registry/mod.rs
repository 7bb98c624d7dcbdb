//! Model registry: which inference endpoint serves which model.
//!
//! Holds `endpoint → models` in memory and derives `model → endpoints`
//! on demand. Refresh is all-or-nothing per endpoint: a successful
//! poll atomically replaces that endpoint's model set, a failed poll
//! atomically removes it. Readers take snapshots and never observe a
//! partially-updated endpoint.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::cache::CacheService;
use crate::config::RegistryConfig;
use crate::providers::ModelInfo;

/// Per-endpoint catalogue poll timeout.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Mutex name serialising refresh passes across processes.
const REFRESH_MUTEX: &str = "registry:refresh";

pub struct ModelRegistry {
    endpoint_models: RwLock<HashMap<String, Arc<Vec<ModelInfo>>>>,
    http: reqwest::Client,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            endpoint_models: RwLock::new(HashMap::new()),
            http: reqwest::Client::builder()
                .timeout(DISCOVERY_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Vec<ModelInfo>>>> {
        self.endpoint_models.read().expect("registry poisoned")
    }

    /// Snapshot of `model_id → set<endpoint>`.
    pub fn get_model_to_endpoints(&self) -> HashMap<String, BTreeSet<String>> {
        let mut out: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (endpoint, models) in self.read().iter() {
            for model in models.iter() {
                out.entry(model.id.clone())
                    .or_default()
                    .insert(endpoint.clone());
            }
        }
        out
    }

    /// Endpoints currently serving `model_id`.
    pub fn endpoints_for_model(&self, model_id: &str) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, models)| models.iter().any(|m| m.id == model_id))
            .map(|(e, _)| e.clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    /// The model set last discovered on `endpoint`, if any.
    pub fn models_for_endpoint(&self, endpoint: &str) -> Option<Arc<Vec<ModelInfo>>> {
        self.read().get(endpoint).cloned()
    }

    /// Deduplicated union of every endpoint's models.
    pub fn all_models(&self) -> Vec<ModelInfo> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for models in self.read().values() {
            for model in models.iter() {
                if seen.insert(model.id.clone()) {
                    out.push(model.clone());
                }
            }
        }
        out
    }

    /// Poll one endpoint's catalogue and swap its entry: replace on
    /// success, remove on failure.
    pub async fn refresh_endpoint(&self, endpoint: &str) {
        match self.discover(endpoint).await {
            Ok(models) => {
                info!(endpoint, models = models.len(), "registry endpoint refreshed");
                self.endpoint_models
                    .write()
                    .expect("registry poisoned")
                    .insert(endpoint.to_string(), Arc::new(models));
            }
            Err(e) => {
                warn!(endpoint, error = %e, "registry discovery failed, removing endpoint");
                self.endpoint_models
                    .write()
                    .expect("registry poisoned")
                    .remove(endpoint);
            }
        }
    }

    async fn discover(&self, endpoint: &str) -> anyhow::Result<Vec<ModelInfo>> {
        #[derive(serde::Deserialize)]
        struct ModelList {
            #[serde(default)]
            data: Vec<ModelInfo>,
        }

        let url = format!("{}/models", endpoint.trim_end_matches('/'));
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("discovery returned {status}");
        }
        let list: ModelList = resp.json().await?;
        Ok(list.data)
    }

    /// Refresh every configured endpoint, serialised across processes
    /// through the cache mutex.
    pub async fn refresh_all(&self, endpoints: &[String], cache: &dyn CacheService) {
        let mut mutex = cache.new_mutex(REFRESH_MUTEX);
        let locked = match mutex.lock().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "registry refresh mutex unavailable, refreshing anyway");
                false
            }
        };

        for endpoint in endpoints {
            self.refresh_endpoint(endpoint).await;
        }

        if locked {
            if let Err(e) = mutex.unlock().await {
                warn!(error = %e, "registry refresh mutex unlock failed");
            }
        }
    }
}

/// Run an immediate refresh pass, then schedule periodic ones.
///
/// Returns the scheduler so the caller keeps it alive for the process
/// lifetime.
pub async fn spawn_refresh(
    registry: Arc<ModelRegistry>,
    cfg: &RegistryConfig,
    cache: Arc<dyn CacheService>,
) -> anyhow::Result<Option<JobScheduler>> {
    if cfg.endpoints.is_empty() {
        info!("model registry disabled (no endpoints configured)");
        return Ok(None);
    }

    registry.refresh_all(&cfg.endpoints, cache.as_ref()).await;

    let sched = JobScheduler::new().await?;
    let endpoints = cfg.endpoints.clone();
    let job = Job::new_async(cfg.refresh_schedule.as_str(), move |_uuid, _lock| {
        let registry = registry.clone();
        let endpoints = endpoints.clone();
        let cache = cache.clone();
        Box::pin(async move {
            registry.refresh_all(&endpoints, cache.as_ref()).await;
        })
    })?;
    sched.add(job).await?;
    sched.start().await?;
    info!(
        endpoints = cfg.endpoints.len(),
        schedule = %cfg.refresh_schedule,
        "model registry refresh scheduled"
    );
    Ok(Some(sched))
}
