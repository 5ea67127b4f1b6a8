// packages/proxy/src/modules/loader.rs
//! Module load orchestration
//!
//! Decides which modules activate at which lifecycle point and in what order:
//!
//! ```text
//! process start ──► startup pass     (once, region code only)
//! session created ─► connect pass     (per session)
//! handshake done ──► versioncheck pass (per session, legacy included)
//! ```
//!
//! Every pass orders descriptors by `(not bootstrap, registration index)`,
//! so infrastructure modules are always initialised before their dependents.
//! Each session owns a private [`ModuleNamespace`]; nothing is shared between
//! sessions and purging a namespace runs every module's teardown hook.

use crate::modules::descriptor::{ModuleDescriptor, UpdateSnapshot};
use crate::session::proxy_session::SessionId;
use crate::utils::errors::{ProxyError, Result};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Infrastructure modules other modules depend on
///
/// `tera-game-state` is the directory name the game-state module ships under.
pub const BOOTSTRAP_MODULES: &[&str] = &["command", "game-state", "tera-game-state"];

pub fn is_bootstrap(name: &str) -> bool {
    BOOTSTRAP_MODULES.contains(&name)
}

/// Stable activation order: bootstrap modules first, registration order otherwise
pub fn activation_order<'a, I>(descriptors: I) -> Vec<&'a ModuleDescriptor>
where
    I: IntoIterator<Item = &'a ModuleDescriptor>,
{
    let mut indexed: Vec<(usize, &ModuleDescriptor)> = descriptors.into_iter().enumerate().collect();
    indexed.sort_by_key(|(index, descriptor)| (!is_bootstrap(&descriptor.name), *index));
    indexed.into_iter().map(|(_, descriptor)| descriptor).collect()
}

/// Session lifecycle notification delivered to loaded modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Routed {
        downstream: SocketAddr,
        upstream: SocketAddr,
    },
    HandshakeComplete,
    Closing,
}

/// What a module sees when it is instantiated
pub struct ModuleContext<'a> {
    pub session_id: SessionId,
    pub region: &'a str,
    pub descriptor: &'a ModuleDescriptor,
    pub protocol_data: &'a HashMap<String, serde_json::Value>,
}

/// A module instance living inside one session
pub trait ProxyModule: Send {
    fn on_notice(&mut self, _notice: &SessionNotice) {}

    /// Release anything the module holds outside its own memory
    fn teardown(&mut self) {}
}

/// Creates module instances
pub trait ModuleFactory: Send + Sync {
    /// Process-wide initialisation for `startup` modules
    fn on_startup(&self, _region: &str) -> Result<()> {
        Ok(())
    }

    fn instantiate(&self, ctx: &ModuleContext<'_>) -> Result<Box<dyn ProxyModule>>;
}

/// Name → factory registry
#[derive(Default, Clone)]
pub struct ModuleCatalog {
    factories: HashMap<String, Arc<dyn ModuleFactory>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn ModuleFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn with(mut self, name: impl Into<String>, factory: Arc<dyn ModuleFactory>) -> Self {
        self.register(name, factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModuleFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// Per-session activation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationPass {
    Connect,
    VersionCheck,
}

struct LoadedModule {
    name: String,
    instance: Box<dyn ProxyModule>,
}

/// Modules instantiated for one session
#[derive(Default)]
pub struct ModuleNamespace {
    modules: Vec<LoadedModule>,
    passes: HashSet<ActivationPass>,
}

impl ModuleNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loaded module names in activation order
    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m.name == name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn notify(&mut self, notice: &SessionNotice) {
        for module in &mut self.modules {
            let result = catch_unwind(AssertUnwindSafe(|| module.instance.on_notice(notice)));
            if result.is_err() {
                error!("Module {} panicked while handling {:?}", module.name, notice);
            }
        }
    }

    /// Tear down and drop every module, newest first
    pub fn purge(&mut self) -> usize {
        let count = self.modules.len();
        while let Some(mut module) = self.modules.pop() {
            let result = catch_unwind(AssertUnwindSafe(|| module.instance.teardown()));
            if result.is_err() {
                error!("Module {} panicked during teardown", module.name);
            }
            debug!("Unloaded module {}", module.name);
        }
        self.passes.clear();
        count
    }

    fn insert(&mut self, name: &str, instance: Box<dyn ProxyModule>) {
        self.modules.push(LoadedModule {
            name: name.to_string(),
            instance,
        });
    }
}

impl Drop for ModuleNamespace {
    fn drop(&mut self) {
        self.purge();
    }
}

/// Outcome of one activation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub activated: Vec<String>,
    pub errors: Vec<(String, String)>,
}

/// Applies the snapshot to the startup pass and to sessions
pub struct ModuleLoader {
    catalog: Arc<ModuleCatalog>,
    snapshot: Arc<UpdateSnapshot>,
    region: String,
}

impl ModuleLoader {
    pub fn new(catalog: Arc<ModuleCatalog>, snapshot: Arc<UpdateSnapshot>, region: impl Into<String>) -> Self {
        Self {
            catalog,
            snapshot,
            region: region.into(),
        }
    }

    /// Initialise `startup` modules once per process
    pub fn run_startup(&self) -> ActivationReport {
        let mut report = ActivationReport::default();

        for descriptor in activation_order(self.snapshot.startup_modules()) {
            info!("[proxy] Initializing module {}", descriptor.name);

            let Some(factory) = self.catalog.get(&descriptor.name) else {
                warn!("Module {} is not available in this build", descriptor.name);
                report
                    .errors
                    .push((descriptor.name.clone(), "not available".to_string()));
                continue;
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| factory.on_startup(&self.region)));
            match flatten_outcome(&descriptor.name, outcome) {
                Ok(()) => report.activated.push(descriptor.name.clone()),
                Err(e) => {
                    error!("Failed to initialize module {}: {}", descriptor.name, e);
                    report.errors.push((descriptor.name.clone(), e.to_string()));
                }
            }
        }

        report
    }

    /// Run one per-session pass; a pass runs at most once per namespace
    pub fn activate(
        &self,
        pass: ActivationPass,
        session_id: SessionId,
        namespace: &mut ModuleNamespace,
    ) -> ActivationReport {
        let mut report = ActivationReport::default();

        if !namespace.passes.insert(pass) {
            debug!(session = %session_id, "{:?} pass already ran", pass);
            return report;
        }

        let descriptors = match pass {
            ActivationPass::Connect => {
                self.warn_unavailable();
                self.snapshot.connect_modules()
            }
            ActivationPass::VersionCheck => self.snapshot.versioncheck_modules(),
        };

        for descriptor in activation_order(descriptors) {
            if namespace.is_loaded(&descriptor.name) {
                continue;
            }

            match self.instantiate(session_id, descriptor) {
                Ok(instance) => {
                    debug!(session = %session_id, "Loaded module {}", descriptor.name);
                    namespace.insert(&descriptor.name, instance);
                    report.activated.push(descriptor.name.clone());
                }
                Err(e) => {
                    error!(session = %session_id, "Failed to load module {}: {}", descriptor.name, e);
                    report.errors.push((descriptor.name.clone(), e.to_string()));
                }
            }
        }

        report
    }

    fn instantiate(&self, session_id: SessionId, descriptor: &ModuleDescriptor) -> Result<Box<dyn ProxyModule>> {
        let factory = self
            .catalog
            .get(&descriptor.name)
            .ok_or_else(|| ProxyError::ModuleFailed {
                name: descriptor.name.clone(),
                reason: "not available in this build".to_string(),
            })?;

        let ctx = ModuleContext {
            session_id,
            region: &self.region,
            descriptor,
            protocol_data: &self.snapshot.protocol_data,
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| factory.instantiate(&ctx)));
        flatten_outcome(&descriptor.name, outcome)
    }

    fn warn_unavailable(&self) {
        for descriptor in &self.snapshot.failed {
            warn!("WARNING: Module {} could not be updated and will not be loaded!", descriptor.name);
        }
        for descriptor in &self.snapshot.legacy {
            warn!("WARNING: Module {} does not support auto-updating!", descriptor.name);
        }
    }
}

fn flatten_outcome<T>(name: &str, outcome: std::thread::Result<Result<T>>) -> Result<T> {
    match outcome {
        Ok(result) => result,
        Err(_) => Err(ProxyError::ModuleFailed {
            name: name.to_string(),
            reason: "panicked during activation".to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modules::descriptor::LoadPhase;
    use proptest::prelude::*;
    use std::sync::Mutex;

    /// Records activation order and per-session counters
    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        pub activations: Arc<Mutex<Vec<String>>>,
        pub teardowns: Arc<Mutex<Vec<(String, u32)>>>,
        pub startups: Arc<Mutex<Vec<(String, String)>>>,
    }

    pub(crate) struct RecordingFactory {
        pub name: String,
        pub recorder: Recorder,
        pub fail: bool,
        pub panic: bool,
    }

    struct CountingModule {
        name: String,
        notices: u32,
        recorder: Recorder,
    }

    impl ProxyModule for CountingModule {
        fn on_notice(&mut self, _notice: &SessionNotice) {
            self.notices += 1;
        }

        fn teardown(&mut self) {
            self.recorder
                .teardowns
                .lock()
                .unwrap()
                .push((self.name.clone(), self.notices));
        }
    }

    impl ModuleFactory for RecordingFactory {
        fn on_startup(&self, region: &str) -> Result<()> {
            self.recorder
                .startups
                .lock()
                .unwrap()
                .push((self.name.clone(), region.to_string()));
            Ok(())
        }

        fn instantiate(&self, _ctx: &ModuleContext<'_>) -> Result<Box<dyn ProxyModule>> {
            if self.panic {
                panic!("module {} exploded", self.name);
            }
            if self.fail {
                return Err(ProxyError::ModuleFailed {
                    name: self.name.clone(),
                    reason: "refused".to_string(),
                });
            }
            self.recorder.activations.lock().unwrap().push(self.name.clone());
            Ok(Box::new(CountingModule {
                name: self.name.clone(),
                notices: 0,
                recorder: self.recorder.clone(),
            }))
        }
    }

    pub(crate) fn catalog_for(names: &[&str], recorder: &Recorder) -> ModuleCatalog {
        let mut catalog = ModuleCatalog::new();
        for name in names {
            catalog.register(
                *name,
                Arc::new(RecordingFactory {
                    name: name.to_string(),
                    recorder: recorder.clone(),
                    fail: false,
                    panic: false,
                }),
            );
        }
        catalog
    }

    fn sample_snapshot() -> UpdateSnapshot {
        UpdateSnapshot {
            updated: vec![
                ModuleDescriptor::new("auto-loot"),
                ModuleDescriptor::new("game-state"),
                ModuleDescriptor::new("ping").with_phase(LoadPhase::Connect),
                ModuleDescriptor::new("command"),
                ModuleDescriptor::new("logger").with_phase(LoadPhase::Startup),
                ModuleDescriptor::new("dps-meter").with_phase(LoadPhase::Connect),
            ],
            legacy: vec![ModuleDescriptor::new("old-skool")],
            failed: vec![ModuleDescriptor::new("broken")],
            protocol_data: HashMap::new(),
        }
    }

    fn loader(snapshot: UpdateSnapshot, recorder: &Recorder) -> ModuleLoader {
        let catalog = catalog_for(
            &["auto-loot", "game-state", "ping", "command", "logger", "dps-meter", "old-skool", "broken"],
            recorder,
        );
        ModuleLoader::new(Arc::new(catalog), Arc::new(snapshot), "eu")
    }

    #[test]
    fn test_shipped_game_state_name_is_bootstrap() {
        let descriptors = vec![
            ModuleDescriptor::new("auto-loot"),
            ModuleDescriptor::new("tera-game-state"),
            ModuleDescriptor::new("command"),
        ];
        let names: Vec<&str> = activation_order(&descriptors).iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["tera-game-state", "command", "auto-loot"]);
    }

    #[test]
    fn test_versioncheck_order_puts_bootstrap_first() {
        let recorder = Recorder::default();
        let loader = loader(sample_snapshot(), &recorder);
        let mut namespace = ModuleNamespace::new();

        let report = loader.activate(ActivationPass::VersionCheck, SessionId::new(), &mut namespace);
        assert_eq!(report.activated, vec!["game-state", "command", "old-skool", "auto-loot"]);
        assert!(!namespace.is_loaded("broken"));
    }

    #[test]
    fn test_connect_pass_runs_once() {
        let recorder = Recorder::default();
        let loader = loader(sample_snapshot(), &recorder);
        let mut namespace = ModuleNamespace::new();
        let id = SessionId::new();

        let first = loader.activate(ActivationPass::Connect, id, &mut namespace);
        assert_eq!(first.activated, vec!["ping", "dps-meter"]);

        let second = loader.activate(ActivationPass::Connect, id, &mut namespace);
        assert!(second.activated.is_empty());
        assert_eq!(recorder.activations.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_startup_pass_receives_region() {
        let recorder = Recorder::default();
        let loader = loader(sample_snapshot(), &recorder);

        let report = loader.run_startup();
        assert_eq!(report.activated, vec!["logger"]);
        assert_eq!(
            *recorder.startups.lock().unwrap(),
            vec![("logger".to_string(), "eu".to_string())]
        );
    }

    #[test]
    fn test_failing_module_does_not_stop_others() {
        let recorder = Recorder::default();
        let mut catalog = catalog_for(&["command", "b"], &recorder);
        catalog.register(
            "a",
            Arc::new(RecordingFactory {
                name: "a".into(),
                recorder: recorder.clone(),
                fail: true,
                panic: false,
            }),
        );
        catalog.register(
            "c",
            Arc::new(RecordingFactory {
                name: "c".into(),
                recorder: recorder.clone(),
                fail: false,
                panic: true,
            }),
        );

        let snapshot = UpdateSnapshot {
            updated: vec![
                ModuleDescriptor::new("a"),
                ModuleDescriptor::new("c"),
                ModuleDescriptor::new("b"),
                ModuleDescriptor::new("command"),
                ModuleDescriptor::new("unknown"),
            ],
            ..Default::default()
        };
        let loader = ModuleLoader::new(Arc::new(catalog), Arc::new(snapshot), "eu");
        let mut namespace = ModuleNamespace::new();

        let report = loader.activate(ActivationPass::VersionCheck, SessionId::new(), &mut namespace);
        assert_eq!(report.activated, vec!["command", "b"]);
        let failed: Vec<&str> = report.errors.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(failed, vec!["a", "c", "unknown"]);
    }

    #[test]
    fn test_session_isolation() {
        let recorder = Recorder::default();
        let loader = loader(sample_snapshot(), &recorder);

        let mut first = ModuleNamespace::new();
        loader.activate(ActivationPass::Connect, SessionId::new(), &mut first);
        for _ in 0..3 {
            first.notify(&SessionNotice::HandshakeComplete);
        }
        assert_eq!(first.purge(), 2);
        assert!(first.is_empty());

        let mut second = ModuleNamespace::new();
        loader.activate(ActivationPass::Connect, SessionId::new(), &mut second);
        second.notify(&SessionNotice::HandshakeComplete);
        second.purge();

        let teardowns = recorder.teardowns.lock().unwrap().clone();
        assert_eq!(
            teardowns,
            vec![
                ("dps-meter".to_string(), 3),
                ("ping".to_string(), 3),
                ("dps-meter".to_string(), 1),
                ("ping".to_string(), 1),
            ]
        );
    }

    fn descriptor_names() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(
            prop_oneof![
                Just("command".to_string()),
                Just("game-state".to_string()),
                "[a-z]{3,8}",
            ],
            0..20,
        )
    }

    proptest! {
        #[test]
        fn prop_bootstrap_precedes_everything(names in descriptor_names()) {
            let descriptors: Vec<ModuleDescriptor> =
                names.iter().map(|n| ModuleDescriptor::new(n.clone())).collect();
            let ordered = activation_order(&descriptors);

            prop_assert_eq!(ordered.len(), descriptors.len());

            let first_regular = ordered.iter().position(|d| !is_bootstrap(&d.name));
            if let Some(split) = first_regular {
                prop_assert!(ordered[split..].iter().all(|d| !is_bootstrap(&d.name)));
            }

            // Relative registration order survives within each group
            let bootstrap: Vec<&str> = names.iter().map(String::as_str).filter(|n| is_bootstrap(n)).collect();
            let ordered_bootstrap: Vec<&str> = ordered.iter().map(|d| d.name.as_str()).filter(|n| is_bootstrap(n)).collect();
            prop_assert_eq!(bootstrap, ordered_bootstrap);

            let regular: Vec<&str> = names.iter().map(String::as_str).filter(|n| !is_bootstrap(n)).collect();
            let ordered_regular: Vec<&str> = ordered.iter().map(|d| d.name.as_str()).filter(|n| !is_bootstrap(n)).collect();
            prop_assert_eq!(regular, ordered_regular);
        }
    }
}
