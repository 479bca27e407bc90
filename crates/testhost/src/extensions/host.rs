//! Extension registrations and the per-session active set.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock};

use futures::FutureExt;

use super::points::{
    DataConsumer, EnvironmentProvider, Extension, ExtensionInfo, ExtensionPoint,
    ProcessLifetimeHandler, SessionLifetimeHandler,
};
use crate::dispatcher::panic_message;

type Factory = Box<dyn FnOnce() -> anyhow::Result<Arc<dyn Extension>> + Send>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtensionError {
    #[error("extension '{0}' is already registered")]
    DuplicateId(String),

    #[error("extension '{0}' declares no extension points")]
    NoExtensionPoints(String),
}

/// Run an extension callback, logging and swallowing errors and panics.
pub(crate) async fn contain<T, F>(info: &ExtensionInfo, callback: &'static str, fut: F) -> Option<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(extension = %info.id, callback, error = %e, "Extension callback failed");
            None
        }
        Err(panic) => {
            tracing::error!(
                extension = %info.id,
                callback,
                panic = %panic_message(panic.as_ref()),
                "Extension callback panicked"
            );
            None
        }
    }
}

pub struct ExtensionRegistration {
    info: ExtensionInfo,
    points: BTreeSet<ExtensionPoint>,
    factory: Mutex<Option<Factory>>,
    instance: OnceLock<Option<Arc<dyn Extension>>>,
    enabled: tokio::sync::OnceCell<bool>,
}

impl std::fmt::Debug for ExtensionRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistration")
            .field("info", &self.info)
            .field("points", &self.points)
            .field("constructed", &self.instance.get().is_some())
            .field("enabled", &self.enabled.get())
            .finish()
    }
}

impl ExtensionRegistration {
    pub fn info(&self) -> &ExtensionInfo {
        &self.info
    }

    pub fn points(&self) -> &BTreeSet<ExtensionPoint> {
        &self.points
    }

    /// Construct the instance on first use. A failing or panicking factory
    /// leaves the registration permanently without an instance.
    pub fn instance(&self) -> Option<Arc<dyn Extension>> {
        self.instance
            .get_or_init(|| {
                let factory = match self.factory.lock() {
                    Ok(mut guard) => guard.take(),
                    Err(poisoned) => poisoned.into_inner().take(),
                };
                let factory = factory?;
                match std::panic::catch_unwind(AssertUnwindSafe(factory)) {
                    Ok(Ok(instance)) => {
                        tracing::debug!(extension = %self.info.id, "Constructed extension");
                        Some(instance)
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(extension = %self.info.id, error = %e, "Extension factory failed");
                        None
                    }
                    Err(panic) => {
                        tracing::error!(
                            extension = %self.info.id,
                            panic = %panic_message(panic.as_ref()),
                            "Extension factory panicked"
                        );
                        None
                    }
                }
            })
            .clone()
    }

    /// Memoized `is_enabled`.
    pub async fn is_enabled(&self) -> bool {
        *self
            .enabled
            .get_or_init(|| async {
                let Some(instance) = self.instance() else {
                    return false;
                };
                contain(&self.info, "is_enabled", instance.is_enabled())
                    .await
                    .unwrap_or(false)
            })
            .await
    }
}

#[derive(Debug, Default)]
pub struct ExtensionHost {
    registrations: Vec<Arc<ExtensionRegistration>>,
}

impl ExtensionHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &mut self,
        point: ExtensionPoint,
        info: ExtensionInfo,
        factory: F,
    ) -> Result<(), ExtensionError>
    where
        F: FnOnce() -> anyhow::Result<Arc<dyn Extension>> + Send + 'static,
    {
        self.register_composite([point], info, factory)
    }

    /// Register one instance for several points. It is constructed once and
    /// listed under each point it declares.
    pub fn register_composite<F>(
        &mut self,
        points: impl IntoIterator<Item = ExtensionPoint>,
        info: ExtensionInfo,
        factory: F,
    ) -> Result<(), ExtensionError>
    where
        F: FnOnce() -> anyhow::Result<Arc<dyn Extension>> + Send + 'static,
    {
        let points: BTreeSet<_> = points.into_iter().collect();
        if points.is_empty() {
            return Err(ExtensionError::NoExtensionPoints(info.id));
        }
        if self.registrations.iter().any(|r| r.info.id == info.id) {
            return Err(ExtensionError::DuplicateId(info.id));
        }
        tracing::debug!(extension = %info.id, ?points, "Registered extension");
        self.registrations.push(Arc::new(ExtensionRegistration {
            info,
            points,
            factory: Mutex::new(Some(Box::new(factory))),
            instance: OnceLock::new(),
            enabled: tokio::sync::OnceCell::new(),
        }));
        Ok(())
    }

    pub fn registrations(&self) -> &[Arc<ExtensionRegistration>] {
        &self.registrations
    }

    /// Construct, filter by `is_enabled` and group by extension point.
    pub async fn build_active_set(&self) -> ActiveExtensions {
        let mut by_point: BTreeMap<ExtensionPoint, Vec<ActiveExtension>> = BTreeMap::new();
        for registration in &self.registrations {
            if !registration.is_enabled().await {
                tracing::debug!(extension = %registration.info.id, "Extension disabled");
                continue;
            }
            let Some(instance) = registration.instance() else {
                continue;
            };
            let info = Arc::new(registration.info.clone());
            for point in &registration.points {
                if !instance.supports(*point) {
                    tracing::warn!(
                        extension = %registration.info.id,
                        %point,
                        "Extension declares a point it does not implement"
                    );
                    continue;
                }
                by_point.entry(*point).or_default().push(ActiveExtension {
                    info: Arc::clone(&info),
                    instance: Arc::clone(&instance),
                });
            }
        }
        ActiveExtensions {
            by_point: Arc::new(by_point),
        }
    }
}

/// An enabled extension as seen by one point.
#[derive(Clone)]
pub struct ActiveExtension {
    pub info: Arc<ExtensionInfo>,
    pub instance: Arc<dyn Extension>,
}

impl std::fmt::Debug for ActiveExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveExtension")
            .field("id", &self.info.id)
            .finish()
    }
}

/// Enabled extensions grouped by point. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ActiveExtensions {
    by_point: Arc<BTreeMap<ExtensionPoint, Vec<ActiveExtension>>>,
}

impl ActiveExtensions {
    pub fn get(&self, point: ExtensionPoint) -> &[ActiveExtension] {
        self.by_point.get(&point).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_point.values().all(Vec::is_empty)
    }

    pub fn data_consumers(&self) -> impl Iterator<Item = (&ActiveExtension, &dyn DataConsumer)> {
        self.get(ExtensionPoint::DataConsumer)
            .iter()
            .filter_map(|e| e.instance.as_data_consumer().map(|c| (e, c)))
    }

    pub fn session_lifetime_handlers(
        &self,
    ) -> impl Iterator<Item = (&ActiveExtension, &dyn SessionLifetimeHandler)> {
        self.get(ExtensionPoint::SessionLifetimeHandler)
            .iter()
            .filter_map(|e| e.instance.as_session_lifetime_handler().map(|h| (e, h)))
    }

    pub fn process_lifetime_handlers(
        &self,
    ) -> impl Iterator<Item = (&ActiveExtension, &dyn ProcessLifetimeHandler)> {
        self.get(ExtensionPoint::ProcessLifetimeHandler)
            .iter()
            .filter_map(|e| e.instance.as_process_lifetime_handler().map(|h| (e, h)))
    }

    pub fn environment_providers(
        &self,
    ) -> impl Iterator<Item = (&ActiveExtension, &dyn EnvironmentProvider)> {
        self.get(ExtensionPoint::EnvironmentProvider)
            .iter()
            .filter_map(|e| e.instance.as_environment_provider().map(|p| (e, p)))
    }
}
