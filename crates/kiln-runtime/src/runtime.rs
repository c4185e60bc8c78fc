//! Process-wide runtime state
//!
//! A `Runtime` owns everything shared between execution contexts: the
//! configuration, the heap collaborator, the event logger and the registries
//! behind the global lock. It is created once with [`Runtime::init`] and
//! passed around as `Arc<Runtime>`.
//!
//! # Examples
//!
//! ```
//! use kiln_config::RuntimeConfig;
//! use kiln_runtime::{ExecutionContext, NativeFunction, Runtime, Value};
//!
//! let runtime = Runtime::init(RuntimeConfig::default())?;
//! let mut ctx = ExecutionContext::new(&runtime)?;
//!
//! let answer = NativeFunction::fixed("answer", 0, |ctx, _frame| {
//!     Ok(ctx.set_value(Value::Fixnum(42)))
//! });
//! ctx.funcall(&answer, &[])?;
//! assert_eq!(ctx.primary_value(), Value::Fixnum(42));
//!
//! drop(ctx);
//! runtime.shutdown()?;
//! # Ok::<(), kiln_runtime::RuntimeError>(())
//! ```

use crate::context::ContextId;
use crate::error::{fatal, RuntimeError};
use crate::events::{EventLogger, NullEventLogger, RuntimeEvent};
use crate::ffi::{EntryPoint, ForeignFunction, ForeignSignature, LibraryLoader, LoadError, SymbolTable};
use crate::heap::{ArenaHeap, Collector};
use crate::interrupt::os::{install_interrupt_signal, SignalRegistration};
use crate::interrupt::{InterruptHandle, InterruptKind};
use crate::locks::{LockDomain, LockError};
use crate::value::Handle;
use kiln_config::{ConfigLoader, RuntimeConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Registries protected by the global lock
#[derive(Default)]
pub struct GlobalRegistry {
    packages: HashMap<String, Handle>,
    error_handlers: Vec<Handle>,
    contexts: HashMap<ContextId, InterruptHandle>,
    symbols: SymbolTable,
    libraries: LibraryLoader,
}

impl GlobalRegistry {
    fn new(libraries: LibraryLoader) -> Self {
        Self {
            libraries,
            ..Default::default()
        }
    }

    /// Registered package names, sorted
    pub fn package_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.packages.keys().cloned().collect();
        names.sort();
        names
    }

    /// Error handlers, innermost last
    pub fn error_handlers(&self) -> &[Handle] {
        &self.error_handlers
    }

    /// Ids of the live contexts, sorted
    pub fn context_ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.contexts.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn libraries(&self) -> &LibraryLoader {
        &self.libraries
    }
}

/// SIGINT route and the context it currently feeds
struct ConsoleRoute {
    owner: ContextId,
    registration: SignalRegistration,
}

/// Builder for a [`Runtime`] with custom collaborators
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    heap: Option<Arc<dyn Collector>>,
    events: Option<Arc<dyn EventLogger>>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            heap: None,
            events: None,
        }
    }

    /// Start from the layered configuration found from `dir`
    pub fn from_directory(dir: &Path) -> Result<Self, RuntimeError> {
        let config = ConfigLoader::new().load_from_directory(dir)?;
        Ok(Self::new(config.runtime))
    }

    /// Use `heap` instead of a fresh `ArenaHeap`
    pub fn heap(mut self, heap: Arc<dyn Collector>) -> Self {
        self.heap = Some(heap);
        self
    }

    /// Log runtime events to `events` (default: discard)
    pub fn events(mut self, events: Arc<dyn EventLogger>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the configuration, load preloaded libraries and start
    pub fn build(self) -> Result<Arc<Runtime>, RuntimeError> {
        self.config.validate()?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(NullEventLogger));
        let heap = self.heap.unwrap_or_else(|| Arc::new(ArenaHeap::new()));

        let mut libraries = LibraryLoader::with_search_paths(self.config.library_paths().to_vec());
        for name in self.config.preload() {
            let path = libraries.load(name)?;
            events.log(RuntimeEvent::LibraryLoaded { path });
        }

        Ok(Arc::new(Runtime {
            config: self.config,
            locks: LockDomain::new(GlobalRegistry::new(libraries)),
            heap,
            events,
            next_context: AtomicU64::new(1),
            console: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }
}

/// Shared runtime state
pub struct Runtime {
    config: RuntimeConfig,
    locks: LockDomain<GlobalRegistry>,
    heap: Arc<dyn Collector>,
    events: Arc<dyn EventLogger>,
    next_context: AtomicU64,
    /// SIGINT route, installed by the first context when configured and
    /// handed to another live context when its owner is dropped
    console: Mutex<Option<ConsoleRoute>>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Start a runtime with the default heap and no event logging
    pub fn init(config: RuntimeConfig) -> Result<Arc<Runtime>, RuntimeError> {
        RuntimeBuilder::new(config).build()
    }

    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// Stop accepting new contexts
    ///
    /// Fails while any context is alive. The console interrupt route, if
    /// any, is removed.
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        let registry = self.global()?;
        if !registry.contexts.is_empty() {
            return Err(RuntimeError::ContextsActive(registry.contexts.len()));
        }
        self.shut_down.store(true, Ordering::Release);
        drop(registry);
        self.console
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn heap(&self) -> &Arc<dyn Collector> {
        &self.heap
    }

    pub fn events(&self) -> &dyn EventLogger {
        self.events.as_ref()
    }

    pub(crate) fn events_handle(&self) -> &Arc<dyn EventLogger> {
        &self.events
    }

    /// The lock domain guarding the registries
    pub fn locks(&self) -> &LockDomain<GlobalRegistry> {
        &self.locks
    }

    fn checked<G>(&self, acquired: Result<G, LockError>) -> Result<G, RuntimeError> {
        acquired.map_err(|err| {
            if let LockError::OrderViolation { held, requested } = err {
                self.events.log(RuntimeEvent::LockOrderViolation {
                    held: held.to_string(),
                    requested: requested.to_string(),
                });
            }
            RuntimeError::Lock(err)
        })
    }

    fn global(&self) -> Result<crate::locks::GlobalGuard<'_, GlobalRegistry>, RuntimeError> {
        self.checked(self.locks.global())
    }

    // Packages and error handlers

    /// Register `package` under `name`, returning the one it replaces
    pub fn register_package(&self, name: &str, package: Handle) -> Result<Option<Handle>, RuntimeError> {
        let mut registry = self.checked(self.locks.package_lock())?;
        Ok(registry.packages.insert(name.to_string(), package))
    }

    pub fn find_package(&self, name: &str) -> Result<Option<Handle>, RuntimeError> {
        let registry = self.checked(self.locks.package_lock())?;
        Ok(registry.packages.get(name).copied())
    }

    pub fn remove_package(&self, name: &str) -> Result<Option<Handle>, RuntimeError> {
        let mut registry = self.checked(self.locks.package_lock())?;
        Ok(registry.packages.remove(name))
    }

    pub fn push_error_handler(&self, handler: Handle) -> Result<(), RuntimeError> {
        let mut registry = self.checked(self.locks.error_handler_lock())?;
        registry.error_handlers.push(handler);
        Ok(())
    }

    pub fn pop_error_handler(&self) -> Result<Option<Handle>, RuntimeError> {
        let mut registry = self.checked(self.locks.error_handler_lock())?;
        Ok(registry.error_handlers.pop())
    }

    // Contexts

    pub(crate) fn register_context(&self, handle: InterruptHandle) -> Result<ContextId, RuntimeError> {
        let mut registry = self.global()?;
        if self.is_shut_down() {
            return Err(RuntimeError::ShutDown);
        }
        let id = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        registry.contexts.insert(id, handle);
        Ok(id)
    }

    pub(crate) fn unregister_context(&self, id: ContextId) {
        let mut registry = match self.global() {
            Ok(registry) => registry,
            Err(err) => fatal(
                self.events(),
                format!("cannot unregister {}: {}", id, err),
            ),
        };
        registry.contexts.remove(&id);

        let mut console = self.console.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(console.as_ref(), Some(route) if route.owner == id) {
            return;
        }
        let next = registry
            .contexts
            .iter()
            .min_by_key(|(other, _)| **other)
            .map(|(other, handle)| (*other, handle.clone()));
        match next {
            Some((owner, handle)) => {
                if let Some(route) = console.as_mut() {
                    route.registration.retarget(&handle);
                    route.owner = owner;
                }
            }
            // Nobody left to receive it; restore the previous handler.
            None => *console = None,
        }
    }

    /// Route SIGINT to context `id` unless another context already owns it
    pub(crate) fn route_console_interrupt(&self, id: ContextId, handle: &InterruptHandle) {
        let mut console = self.console.lock().unwrap_or_else(|e| e.into_inner());
        if console.is_none() {
            *console = install_interrupt_signal(handle)
                .ok()
                .map(|registration| ConsoleRoute {
                    owner: id,
                    registration,
                });
        }
    }

    /// Whether SIGINT is currently routed to a context of this runtime
    pub fn console_routed(&self) -> bool {
        self.console_owner().is_some()
    }

    /// The context SIGINT is routed to, if any
    pub fn console_owner(&self) -> Option<ContextId> {
        self.console
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|route| route.owner)
    }

    /// Post a user interrupt to context `id`; false if no such context
    pub fn interrupt_context(&self, id: ContextId) -> Result<bool, RuntimeError> {
        let registry = self.global()?;
        let Some(handle) = registry.contexts.get(&id) else {
            return Ok(false);
        };
        handle.post(InterruptKind::User);
        self.events.log(RuntimeEvent::InterruptPosted {
            context: id.as_u64(),
            kind: InterruptKind::User.to_string(),
        });
        Ok(true)
    }

    pub fn active_contexts(&self) -> Result<usize, RuntimeError> {
        Ok(self.global()?.contexts.len())
    }

    // Foreign symbols

    /// Make `entry` resolvable as `name`, ahead of any library symbol
    pub fn register_symbol(&self, name: &str, entry: EntryPoint) -> Result<Option<EntryPoint>, RuntimeError> {
        let mut registry = self.global()?;
        Ok(registry.symbols.register(name, entry)?)
    }

    /// Load a shared library by name or path
    pub fn load_library(&self, name: &str) -> Result<PathBuf, RuntimeError> {
        let path = self.global()?.libraries.load(name)?;
        self.events.log(RuntimeEvent::LibraryLoaded { path: path.clone() });
        Ok(path)
    }

    /// Resolve `name`: registered symbols, loaded libraries, then the process
    pub fn resolve(&self, name: &str) -> Result<EntryPoint, RuntimeError> {
        let registry = self.global()?;
        registry
            .symbols
            .get(name)
            .or_else(|| registry.libraries.find_symbol(name))
            .ok_or_else(|| LoadError::SymbolNotFound(name.to_string()).into())
    }

    /// Resolve `name` as a callable foreign function
    ///
    /// # Safety
    ///
    /// `signature` must match the real signature of the resolved function,
    /// and the library defining it must stay loaded.
    pub unsafe fn foreign_function(
        &self,
        name: &str,
        signature: ForeignSignature,
    ) -> Result<ForeignFunction, RuntimeError> {
        let entry = self.resolve(name)?;
        Ok(ForeignFunction::new(name, entry, signature))
    }
}
