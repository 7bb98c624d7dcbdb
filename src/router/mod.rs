//! Multi-provider inference router.
//!
//! Resolves a [`ProviderSelection`] to a single provider instance,
//! caches constructed instances, and aggregates per-scope model
//! catalogues with Redis-backed caching.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::cache::{get_with_fallback, CacheService};
use crate::config::{Config, ProviderType, Vendor};
use crate::error::ApiError;
use crate::providers::{build_provider, AggregatedModel, InferenceProvider, ModelInfo};
use crate::registry::ModelRegistry;

/// Constructed provider instances are reused for this long.
const INSTANCE_TTL: Duration = Duration::from_secs(60);
/// Aggregated catalogue cache TTL.
const MODELS_TTL: Duration = Duration::from_secs(10 * 60);

// ---------------------------------------------------------------------------
// Descriptors and the directory capability
// ---------------------------------------------------------------------------

/// Stored metadata for a provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub public_id: String,
    pub name: String,
    pub provider_type: ProviderType,
    pub vendor: Vendor,
    pub organization_id: Option<String>,
    pub project_id: Option<String>,
    pub endpoint: String,
    pub active: bool,
    /// Redacted tail of the API key, for display only.
    pub api_key_hint: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// External capability: descriptor storage with key retrieval.
#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    /// Load a descriptor together with its decrypted API key.
    async fn get_by_public_id_with_key(
        &self,
        public_id: &str,
    ) -> anyhow::Result<Option<(ProviderDescriptor, String)>>;

    /// Descriptors owned by an organization (org-scoped only).
    async fn list_for_org(&self, organization_id: &str) -> anyhow::Result<Vec<ProviderDescriptor>>;

    /// Descriptors scoped to a project.
    async fn list_for_project(&self, project_id: &str) -> anyhow::Result<Vec<ProviderDescriptor>>;
}

/// Config-file-backed directory.
pub struct ConfigProviderDirectory {
    entries: Vec<(ProviderDescriptor, String)>,
}

impl ConfigProviderDirectory {
    pub fn from_config(cfg: &Config) -> Self {
        let now = Utc::now();
        let entries = cfg
            .providers
            .iter()
            .map(|p| {
                let key = crate::config::resolve_secret(p.api_key.as_deref());
                let hint = key.chars().rev().take(4).collect::<Vec<_>>();
                let descriptor = ProviderDescriptor {
                    public_id: p.public_id.clone(),
                    name: p.name.clone(),
                    provider_type: ProviderType::Organization,
                    vendor: p.vendor,
                    organization_id: Some(p.organization_id.clone()),
                    project_id: p.project_id.clone(),
                    endpoint: p.endpoint.clone(),
                    active: p.active,
                    api_key_hint: hint.into_iter().rev().collect(),
                    last_synced_at: None,
                    updated_at: now,
                };
                (descriptor, key)
            })
            .collect();
        Self { entries }
    }
}

#[async_trait]
impl ProviderDirectory for ConfigProviderDirectory {
    async fn get_by_public_id_with_key(
        &self,
        public_id: &str,
    ) -> anyhow::Result<Option<(ProviderDescriptor, String)>> {
        Ok(self
            .entries
            .iter()
            .find(|(d, _)| d.public_id == public_id)
            .cloned())
    }

    async fn list_for_org(&self, organization_id: &str) -> anyhow::Result<Vec<ProviderDescriptor>> {
        Ok(self
            .entries
            .iter()
            .filter(|(d, _)| {
                d.project_id.is_none()
                    && d.organization_id.as_deref() == Some(organization_id)
            })
            .map(|(d, _)| d.clone())
            .collect())
    }

    async fn list_for_project(&self, project_id: &str) -> anyhow::Result<Vec<ProviderDescriptor>> {
        Ok(self
            .entries
            .iter()
            .filter(|(d, _)| d.project_id.as_deref() == Some(project_id))
            .map(|(d, _)| d.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// The resolved routing input for one request.
#[derive(Debug, Clone, Default)]
pub struct ProviderSelection {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub provider_type: Option<ProviderType>,
    pub vendor: Option<Vendor>,
    pub organization_id: Option<String>,
    pub project_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

struct CachedInstance {
    descriptor: ProviderDescriptor,
    instance: Arc<dyn InferenceProvider>,
    loaded_at: Instant,
}

pub struct InferenceRouter {
    system: Arc<dyn InferenceProvider>,
    system_id: String,
    system_vendor: Vendor,
    directory: Arc<dyn ProviderDirectory>,
    registry: Arc<ModelRegistry>,
    cache: Arc<dyn CacheService>,
    instances: RwLock<std::collections::HashMap<String, CachedInstance>>,
}

impl InferenceRouter {
    pub fn new(
        system: Arc<dyn InferenceProvider>,
        system_id: String,
        system_vendor: Vendor,
        directory: Arc<dyn ProviderDirectory>,
        registry: Arc<ModelRegistry>,
        cache: Arc<dyn CacheService>,
    ) -> Self {
        Self {
            system,
            system_id,
            system_vendor,
            directory,
            registry,
            cache,
            instances: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Build a router from config (system provider + config directory).
    pub fn from_config(
        cfg: &Config,
        registry: Arc<ModelRegistry>,
        cache: Arc<dyn CacheService>,
    ) -> Self {
        let key = crate::config::resolve_secret(cfg.system_provider.api_key.as_deref());
        let system = build_provider(
            &cfg.system_provider.id,
            cfg.system_provider.vendor,
            ProviderType::System,
            &cfg.system_provider.endpoint,
            &key,
        );
        Self::new(
            system,
            cfg.system_provider.id.clone(),
            cfg.system_provider.vendor,
            Arc::new(ConfigProviderDirectory::from_config(cfg)),
            registry,
            cache,
        )
    }

    pub fn system_provider(&self) -> Arc<dyn InferenceProvider> {
        self.system.clone()
    }

    /// Resolve a selection to a provider instance. First match wins:
    /// explicit provider id, then model lookup across scopes, then the
    /// best scoped provider, then the system provider.
    pub async fn resolve(
        &self,
        sel: &ProviderSelection,
    ) -> Result<Arc<dyn InferenceProvider>, ApiError> {
        if let Some(pid) = &sel.provider_id {
            if *pid == self.system_id {
                return Ok(self.system.clone());
            }
            return self.instance_checked(pid, Some(sel)).await;
        }

        if let Some(model) = &sel.model_id {
            if let Some(pid) = self.find_model_owner(model, sel).await? {
                if pid == self.system_id {
                    return Ok(self.system.clone());
                }
                return self.instance_checked(&pid, None).await;
            }
            // Unknown model: fall through to the scoped/system pick and
            // let the upstream reject it.
        }

        if let Some(pid) = self.best_scoped_provider(sel).await? {
            return self.instance_checked(&pid, None).await;
        }

        Ok(self.system.clone())
    }

    /// Aggregated catalogue for the selection's scope: project models,
    /// then organization models, then system models; the first
    /// occurrence of a model id wins.
    pub async fn get_models(
        &self,
        sel: &ProviderSelection,
    ) -> Result<Vec<AggregatedModel>, ApiError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for project_id in &sel.project_ids {
            let models = self
                .cached_scope_models(
                    &format!("models:project:{project_id}"),
                    Scope::Project(project_id.clone()),
                )
                .await?;
            merge_models(&mut out, &mut seen, models);
        }

        if let Some(org) = &sel.organization_id {
            let models = self
                .cached_scope_models(&format!("models:org:{org}"), Scope::Org(org.clone()))
                .await?;
            merge_models(&mut out, &mut seen, models);
        }

        let system = self
            .cached_scope_models("models:jan", Scope::System)
            .await?;
        merge_models(&mut out, &mut seen, system);

        Ok(out)
    }

    // -- instance cache ----------------------------------------------------

    /// Load (or reuse) the instance for an explicit provider id,
    /// enforcing activity and, when a selection is given, scope access.
    async fn instance_checked(
        &self,
        public_id: &str,
        access: Option<&ProviderSelection>,
    ) -> Result<Arc<dyn InferenceProvider>, ApiError> {
        let cached = {
            let instances = self.instances.read().expect("instance cache poisoned");
            instances.get(public_id).and_then(|e| {
                (e.loaded_at.elapsed() < INSTANCE_TTL)
                    .then(|| (e.descriptor.clone(), e.instance.clone()))
            })
        };

        let (descriptor, instance) = match cached {
            Some(hit) => hit,
            None => {
                let (descriptor, key) = self
                    .directory
                    .get_by_public_id_with_key(public_id)
                    .await
                    .map_err(|e| ApiError::Internal(e.to_string()))?
                    .ok_or_else(|| ApiError::NotFound(format!("provider {public_id}")))?;

                let instance = build_provider(
                    &descriptor.public_id,
                    descriptor.vendor,
                    descriptor.provider_type,
                    &descriptor.endpoint,
                    &key,
                );
                let mut instances = self.instances.write().expect("instance cache poisoned");
                instances.insert(
                    public_id.to_string(),
                    CachedInstance {
                        descriptor: descriptor.clone(),
                        instance: instance.clone(),
                        loaded_at: Instant::now(),
                    },
                );
                (descriptor, instance)
            }
        };

        if !descriptor.active {
            self.instances
                .write()
                .expect("instance cache poisoned")
                .remove(public_id);
            return Err(ApiError::ForbiddenProvider(format!(
                "provider {public_id} is inactive"
            )));
        }

        if let Some(sel) = access {
            check_access(&descriptor, sel)?;
        }

        Ok(instance)
    }

    // -- model lookup ------------------------------------------------------

    /// Find which provider serves `model`, scanning project scopes,
    /// then the organization, then the system catalogue.
    async fn find_model_owner(
        &self,
        model: &str,
        sel: &ProviderSelection,
    ) -> Result<Option<String>, ApiError> {
        for project_id in &sel.project_ids {
            let models = self
                .cached_scope_models(
                    &format!("models:project:{project_id}"),
                    Scope::Project(project_id.clone()),
                )
                .await?;
            if let Some(m) = models.iter().find(|m| m.model.id == model) {
                return Ok(Some(m.provider_id.clone()));
            }
        }

        if let Some(org) = &sel.organization_id {
            let models = self
                .cached_scope_models(&format!("models:org:{org}"), Scope::Org(org.clone()))
                .await?;
            if let Some(m) = models.iter().find(|m| m.model.id == model) {
                return Ok(Some(m.provider_id.clone()));
            }
        }

        let system = self
            .cached_scope_models("models:jan", Scope::System)
            .await?;
        if system.iter().any(|m| m.model.id == model) {
            return Ok(Some(self.system_id.clone()));
        }

        Ok(None)
    }

    /// Pick the most recently synced active provider in scope:
    /// project providers first, then organization ones, filtered by
    /// the selection's optional type/vendor.
    async fn best_scoped_provider(
        &self,
        sel: &ProviderSelection,
    ) -> Result<Option<String>, ApiError> {
        let mut candidates: Vec<ProviderDescriptor> = Vec::new();
        for project_id in &sel.project_ids {
            candidates.extend(
                self.directory
                    .list_for_project(project_id)
                    .await
                    .map_err(|e| ApiError::Internal(e.to_string()))?,
            );
        }
        if let Some(pid) = pick_descriptor(&mut candidates, sel) {
            return Ok(Some(pid));
        }

        let mut candidates: Vec<ProviderDescriptor> = Vec::new();
        if let Some(org) = &sel.organization_id {
            candidates.extend(
                self.directory
                    .list_for_org(org)
                    .await
                    .map_err(|e| ApiError::Internal(e.to_string()))?,
            );
        }
        Ok(pick_descriptor(&mut candidates, sel))
    }

    // -- catalogue loading -------------------------------------------------

    async fn cached_scope_models(
        &self,
        key: &str,
        scope: Scope,
    ) -> Result<Vec<AggregatedModel>, ApiError> {
        let loaded = get_with_fallback(self.cache.as_ref(), key, MODELS_TTL, true, || async {
            let models = self.load_scope_models(&scope).await;
            serde_json::to_string(&models).map_err(anyhow::Error::from)
        })
        .await
        .map_err(|e| ApiError::UpstreamFailed(e.to_string()))?;

        serde_json::from_str(&loaded.value)
            .map_err(|e| ApiError::Internal(format!("bad cached catalogue: {e}")))
    }

    /// Query every provider in scope for its catalogue. Individual
    /// provider failures are logged and skipped.
    async fn load_scope_models(&self, scope: &Scope) -> Vec<AggregatedModel> {
        match scope {
            Scope::System => {
                let mut out: Vec<AggregatedModel> = Vec::new();
                let mut seen = HashSet::new();
                match self.system.get_models().await {
                    Ok(models) => {
                        for m in models {
                            if seen.insert(m.id.clone()) {
                                out.push(self.system_model(m));
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "system provider catalogue failed"),
                }
                // Cluster-deployed models discovered by the registry.
                for m in self.registry.all_models() {
                    if seen.insert(m.id.clone()) {
                        out.push(self.system_model(m));
                    }
                }
                out
            }
            Scope::Org(org) => match self.directory.list_for_org(org).await {
                Ok(descriptors) => self.catalogue_of(descriptors).await,
                Err(e) => {
                    warn!(org, error = %e, "org provider listing failed");
                    Vec::new()
                }
            },
            Scope::Project(project) => match self.directory.list_for_project(project).await {
                Ok(descriptors) => self.catalogue_of(descriptors).await,
                Err(e) => {
                    warn!(project, error = %e, "project provider listing failed");
                    Vec::new()
                }
            },
        }
    }

    async fn catalogue_of(&self, descriptors: Vec<ProviderDescriptor>) -> Vec<AggregatedModel> {
        let mut out = Vec::new();
        for descriptor in descriptors.into_iter().filter(|d| d.active) {
            let instance = match self.instance_checked(&descriptor.public_id, None).await {
                Ok(i) => i,
                Err(e) => {
                    warn!(provider = %descriptor.public_id, error = %e, "provider unavailable");
                    continue;
                }
            };
            match instance.get_models().await {
                Ok(models) => {
                    for m in models {
                        out.push(AggregatedModel {
                            model: m,
                            provider_id: descriptor.public_id.clone(),
                            provider_type: descriptor.provider_type,
                            vendor: descriptor.vendor,
                        });
                    }
                }
                Err(e) => {
                    warn!(provider = %descriptor.public_id, error = %e, "catalogue query failed")
                }
            }
        }
        out
    }

    fn system_model(&self, model: ModelInfo) -> AggregatedModel {
        AggregatedModel {
            model,
            provider_id: self.system_id.clone(),
            provider_type: ProviderType::System,
            vendor: self.system_vendor,
        }
    }
}

enum Scope {
    System,
    Org(String),
    Project(String),
}

fn merge_models(
    out: &mut Vec<AggregatedModel>,
    seen: &mut HashSet<String>,
    models: Vec<AggregatedModel>,
) {
    for m in models {
        if seen.insert(m.model.id.clone()) {
            out.push(m);
        }
    }
}

/// Project-scoped descriptors require the project in the caller's set;
/// org-scoped ones require the caller's organization to match.
fn check_access(descriptor: &ProviderDescriptor, sel: &ProviderSelection) -> Result<(), ApiError> {
    if descriptor.provider_type == ProviderType::System {
        return Ok(());
    }
    if let Some(project) = &descriptor.project_id {
        if sel.project_ids.iter().any(|p| p == project) {
            return Ok(());
        }
        return Err(ApiError::ForbiddenProvider(format!(
            "provider {} is scoped to another project",
            descriptor.public_id
        )));
    }
    if let Some(org) = &descriptor.organization_id {
        if sel.organization_id.as_deref() == Some(org.as_str()) {
            return Ok(());
        }
        return Err(ApiError::ForbiddenProvider(format!(
            "provider {} belongs to another organization",
            descriptor.public_id
        )));
    }
    Ok(())
}

/// Filter by the selection's type/vendor, sort by `last_synced_at`
/// (falling back to `updated_at`) descending, and return the first
/// active descriptor's id.
fn pick_descriptor(
    candidates: &mut Vec<ProviderDescriptor>,
    sel: &ProviderSelection,
) -> Option<String> {
    candidates.retain(|d| {
        sel.provider_type.map_or(true, |t| d.provider_type == t)
            && sel.vendor.map_or(true, |v| d.vendor == v)
    });
    candidates.sort_by_key(|d| {
        std::cmp::Reverse(d.last_synced_at.unwrap_or(d.updated_at))
    });
    candidates
        .iter()
        .find(|d| d.active)
        .map(|d| d.public_id.clone())
}
