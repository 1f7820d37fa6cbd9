//! Location resolution for worker contexts.
//!
//! A handoff message names a `location`; inside the worker that location
//! is turned into [`Bindings`]: the host interface to link against, the
//! module family the location belongs to, and optionally an entry point
//! override.
//!
//! Locations are either names registered up front by the controller, or
//! module files given as `file://` URLs or paths ending in `.wasm` /
//! `.cwasm`, which are loaded on first use and cached.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, instrument};
use url::Url;

use crate::{CompiledModule, InstanceRunner, WasmEngine};
use wasm_handoff_common::HandoffError;

/// What a location resolves to.
#[derive(Clone)]
pub struct Bindings {
    family: String,
    entry_point: Option<String>,
    runner: Arc<InstanceRunner>,
}

impl Bindings {
    /// Bind a module family to a host interface.
    pub fn new(family: impl Into<String>, runner: Arc<InstanceRunner>) -> Self {
        Self {
            family: family.into(),
            entry_point: None,
            runner,
        }
    }

    /// Override the configured entry point for this location.
    #[must_use]
    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    /// Content hash of the module family.
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Entry point override, if any.
    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    /// Host interface used to instantiate the module.
    pub fn runner(&self) -> &InstanceRunner {
        &self.runner
    }

    /// Check that `module` belongs to this family.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::FamilyMismatch`] if the hashes differ.
    pub fn verify_family(&self, module: &CompiledModule) -> Result<(), HandoffError> {
        if module.content_hash() == self.family {
            Ok(())
        } else {
            Err(HandoffError::FamilyMismatch {
                expected: self.family.clone(),
                actual: module.content_hash().to_string(),
            })
        }
    }
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("family", &self.family)
            .field("entry_point", &self.entry_point)
            .finish_non_exhaustive()
    }
}

/// Resolves a location into bindings from inside a worker.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    /// Resolve `location`.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::ResolutionFailed`] if the location is unknown
    /// or cannot be loaded.
    async fn resolve(&self, location: &str) -> Result<Bindings, HandoffError>;
}

/// Registry of locations shared by the controller and its workers.
pub struct BindingRegistry {
    engine: WasmEngine,
    default_runner: Arc<InstanceRunner>,
    bindings: DashMap<String, Bindings>,
    images: DashMap<String, Arc<CompiledModule>>,
}

impl BindingRegistry {
    /// Create a registry whose locations default to `runner`'s host interface.
    pub fn new(engine: WasmEngine, runner: Arc<InstanceRunner>) -> Self {
        Self {
            engine,
            default_runner: runner,
            bindings: DashMap::new(),
            images: DashMap::new(),
        }
    }

    /// Register `module` under `location` with the default host interface.
    pub fn register(&self, location: &str, module: &CompiledModule) -> Bindings {
        let bindings = Bindings::new(module.content_hash(), self.default_runner.clone());
        self.insert(location, bindings.clone());
        bindings
    }

    /// Register explicit bindings under `location`.
    pub fn insert(&self, location: &str, bindings: Bindings) {
        debug!(location, family = %bindings.family(), "Bindings registered");
        self.bindings.insert(location.to_string(), bindings);
    }

    /// Compile a module file and register it under `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or compiled.
    pub fn load_file(
        &self,
        location: &str,
        path: impl AsRef<Path>,
    ) -> Result<Arc<CompiledModule>, HandoffError> {
        let module = Arc::new(CompiledModule::from_file(self.engine.inner(), path)?);
        self.register(location, &module);
        self.images.insert(location.to_string(), module.clone());
        Ok(module)
    }

    /// The module image loaded for `location`, if it came from a file.
    pub fn module(&self, location: &str) -> Option<Arc<CompiledModule>> {
        self.images.get(location).map(|m| m.clone())
    }

    /// Remove a location.
    pub fn remove(&self, location: &str) -> Option<Bindings> {
        self.images.remove(location);
        self.bindings.remove(location).map(|(_, b)| b)
    }

    /// List registered locations.
    pub fn locations(&self) -> Vec<String> {
        self.bindings.iter().map(|r| r.key().clone()).collect()
    }

    /// The engine modules are compiled with.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }
}

#[async_trait]
impl ModuleResolver for BindingRegistry {
    #[instrument(skip(self))]
    async fn resolve(&self, location: &str) -> Result<Bindings, HandoffError> {
        if let Some(bindings) = self.bindings.get(location) {
            return Ok(bindings.clone());
        }

        let Some(path) = module_path(location) else {
            return Err(HandoffError::resolution_failed(
                location,
                "no bindings registered for this location",
            ));
        };

        let engine = self.engine.clone();
        let module = tokio::task::spawn_blocking({
            let path = path.clone();
            move || CompiledModule::from_file(engine.inner(), path)
        })
        .await
        .map_err(|e| HandoffError::resolution_failed(location, format!("loader aborted: {e}")))?
        .map_err(|e| HandoffError::resolution_failed(location, e.to_string()))?;

        info!(location, path = %path.display(), "Module loaded from location");

        let module = Arc::new(module);
        let bindings = self.register(location, &module);
        self.images.insert(location.to_string(), module);
        Ok(bindings)
    }
}

impl std::fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingRegistry")
            .field("locations", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

/// Interpret a location as a module file, if it looks like one.
fn module_path(location: &str) -> Option<PathBuf> {
    if let Ok(url) = Url::parse(location) {
        return if url.scheme() == "file" {
            url.to_file_path().ok()
        } else {
            None
        };
    }

    let path = Path::new(location);
    path.extension()
        .is_some_and(|ext| ext == "wasm" || ext == "cwasm")
        .then(|| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_handoff_common::EngineConfig;

    const WAT: &str = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param i32))
        )
    "#;

    fn registry() -> BindingRegistry {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let runner = Arc::new(InstanceRunner::new(Arc::new(engine.inner().clone())));
        BindingRegistry::new(engine, runner)
    }

    #[test]
    fn test_module_path() {
        assert_eq!(
            module_path("file:///tmp/app.wasm"),
            Some(PathBuf::from("/tmp/app.wasm"))
        );
        assert_eq!(module_path("./app.cwasm"), Some(PathBuf::from("./app.cwasm")));
        assert_eq!(module_path("app"), None);
        assert_eq!(module_path("https://example.com/app.wasm"), None);
    }

    #[tokio::test]
    async fn test_resolve_registered() {
        let registry = registry();
        let module = CompiledModule::from_wat(registry.engine().inner(), WAT).unwrap();
        registry.register("app", &module);

        let bindings = registry.resolve("app").await.unwrap();
        assert_eq!(bindings.family(), module.content_hash());
        assert!(bindings.verify_family(&module).is_ok());
        assert_eq!(registry.locations(), vec!["app"]);
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let err = registry().resolve("missing").await.unwrap_err();
        assert!(matches!(err, HandoffError::ResolutionFailed { .. }));
    }

    #[tokio::test]
    async fn test_resolve_missing_file() {
        let err = registry()
            .resolve("file:///nonexistent/dir/app.wasm")
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::ResolutionFailed { .. }));
    }

    #[tokio::test]
    async fn test_resolve_file_caches_module() {
        let registry = registry();
        let module = CompiledModule::from_wat(registry.engine().inner(), WAT).unwrap();

        let dir =
            std::env::temp_dir().join(format!("wasm-handoff-resolver-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("app.cwasm");
        std::fs::write(&path, module.serialize().unwrap()).unwrap();
        let location = path.display().to_string();

        let bindings = registry.resolve(&location).await.unwrap();
        let cached = registry.module(&location).unwrap();
        assert_eq!(bindings.family(), cached.content_hash());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_family_mismatch() {
        let registry = registry();
        let module = CompiledModule::from_wat(registry.engine().inner(), WAT).unwrap();
        let other = CompiledModule::from_wat(
            registry.engine().inner(),
            r#"(module (import "env" "memory" (memory 1 1 shared)))"#,
        )
        .unwrap();

        let bindings = registry.register("app", &module);
        let err = bindings.verify_family(&other).unwrap_err();
        assert!(matches!(err, HandoffError::FamilyMismatch { .. }));
    }

    #[test]
    fn test_entry_point_override_and_remove() {
        let registry = registry();
        let module = CompiledModule::from_wat(registry.engine().inner(), WAT).unwrap();
        let bindings = registry.register("app", &module).with_entry_point("run");
        registry.insert("app", bindings);

        assert_eq!(registry.remove("app").unwrap().entry_point(), Some("run"));
        assert!(registry.locations().is_empty());
    }
}
