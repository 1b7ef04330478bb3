//! Versioned registries for orchestrations, activities, and entities.
//!
//! One generic `Registry<H>` stores handlers by name and semver version.
//! Orchestrations use real versioning (explicit registrations, monotonic
//! versions, start policies); activities and entities are registered at
//! 1.0.0 with the Latest policy. Registries are immutable once built and
//! passed to the runtime explicitly — there is no ambient global state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use semver::Version;

use super::entities::{EntityHandler, FnEntity};
use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::codec::{Codec, Json};
use crate::runtime::entities::EntityContext;
use crate::{ActivityContext, OrchestrationContext};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// How `resolve_for_start` picks a version for a new instance.
#[derive(Clone, Debug)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

/// Immutable name -> version -> handler map.
pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type EntityRegistry = Registry<dyn EntityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;
pub type EntityRegistryBuilder = RegistryBuilder<dyn EntityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
        }
    }

    /// Resolve a handler for a new instance using the name's version policy.
    /// Returns the pinned version alongside the handler.
    pub fn resolve_for_start(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let policy = self
            .policy
            .lock()
            .expect("registry policy lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest);
        let result = match &policy {
            VersionPolicy::Latest => self
                .inner
                .get(name)
                .and_then(|versions| versions.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => self
                .inner
                .get(name)
                .and_then(|versions| versions.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };
        if result.is_none() {
            tracing::debug!(
                target: "taskloom::registry",
                name,
                ?policy,
                registered = ?self.list_names(),
                "registry miss on start"
            );
        }
        result
    }

    /// Resolve the handler for an instance already pinned to `version`.
    /// Replay must run exactly the registered code for that version; the
    /// registry never substitutes a newer one.
    pub fn resolve_exact(&self, name: &str, version: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|versions| versions.get(version)).cloned();
        if result.is_none() {
            tracing::debug!(
                target: "taskloom::registry",
                name,
                %version,
                available = ?self.list_versions(name).iter().map(Version::to_string).collect::<Vec<_>>(),
                "registry miss on pinned version"
            );
        }
        result
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy
            .lock()
            .expect("registry policy lock poisoned")
            .insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    fn insert(&mut self, name: String, version: Version, handler: Arc<H>, what: &str) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            panic!("duplicate {what} registration: {name}@{version}");
        }
        if let Some((latest, _)) = entry.iter().next_back() {
            if &version <= latest {
                panic!("non-monotonic {what} version for {name}: {version} is not later than {latest}");
            }
        }
        entry.insert(version, handler);
    }
}

impl OrchestrationRegistryBuilder {
    /// Register an orchestration at the default version 1.0.0.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_versioned(name, "1.0.0", f)
    }

    /// Register an orchestration at an explicit version. Versions must be
    /// registered in increasing order per name.
    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let version = Version::parse(version.as_ref()).expect("orchestration version must be valid semver");
        self.insert(name.into(), version, Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    /// Typed registration: input decoded from JSON, output encoded to JSON.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register(name, move |ctx: OrchestrationContext, input: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&input)?;
                let out = f(ctx, input).await?;
                Json::encode(&out)
            }
        })
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnActivity(f)), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        self.register(name, move |ctx: ActivityContext, input: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&input)?;
                let out = f(ctx, input).await?;
                Json::encode(&out)
            }
        })
    }
}

impl EntityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(EntityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<String>, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnEntity(f)), "entity");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo(_ctx: OrchestrationContext, input: String) -> Result<String, String> {
        Ok(input)
    }

    #[test]
    fn latest_policy_picks_highest_version() {
        let reg = OrchestrationRegistry::builder()
            .register_versioned("Order", "1.0.0", echo)
            .register_versioned("Order", "2.0.0", echo)
            .build();
        let (version, _) = reg.resolve_for_start("Order").unwrap();
        assert_eq!(version, Version::new(2, 0, 0));
    }

    #[test]
    fn exact_policy_pins_start_version() {
        let reg = OrchestrationRegistry::builder()
            .register_versioned("Order", "1.0.0", echo)
            .register_versioned("Order", "2.0.0", echo)
            .set_policy("Order", VersionPolicy::Exact(Version::new(1, 0, 0)))
            .build();
        let (version, _) = reg.resolve_for_start("Order").unwrap();
        assert_eq!(version, Version::new(1, 0, 0));
    }

    #[test]
    fn resolve_exact_misses_unregistered_versions() {
        let reg = OrchestrationRegistry::builder()
            .register_versioned("Order", "2.0.0", echo)
            .build();
        assert!(reg.resolve_exact("Order", &Version::new(1, 0, 0)).is_none());
        assert!(reg.resolve_exact("Order", &Version::new(2, 0, 0)).is_some());
    }

    #[test]
    #[should_panic(expected = "non-monotonic")]
    fn non_monotonic_versions_are_rejected() {
        let _ = OrchestrationRegistry::builder()
            .register_versioned("Order", "2.0.0", echo)
            .register_versioned("Order", "1.5.0", echo);
    }
}
