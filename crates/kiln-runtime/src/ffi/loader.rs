//! Dynamic library loading and symbol resolution
//!
//! Libraries are opened with `libloading`. Entry points resolve against explicitly registered symbols first, then
//! every loaded library in load order, then the process image itself.

use libloading::Library;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Address of a native function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPoint(usize);

impl EntryPoint {
    pub const fn from_addr(addr: usize) -> Self {
        EntryPoint(addr)
    }

    pub fn from_ptr(ptr: *const c_void) -> Self {
        EntryPoint(ptr as usize)
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0 as *const c_void
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<entry {:#x}>", self.0)
    }
}

/// Library loading errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    #[error("Foreign symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Failed to load library {path}: {reason}")]
    LoadFailed { path: PathBuf, reason: String },

    #[error("Cannot register null entry point for {0}")]
    NullEntry(String),
}

/// Symbols registered by the embedder, by name
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, EntryPoint>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` under `name`, returning the entry it replaces
    pub fn register(&mut self, name: &str, entry: EntryPoint) -> Result<Option<EntryPoint>, LoadError> {
        if entry.is_null() {
            return Err(LoadError::NullEntry(name.to_string()));
        }
        Ok(self.symbols.insert(name.to_string(), entry))
    }

    pub fn get(&self, name: &str) -> Option<EntryPoint> {
        self.symbols.get(name).copied()
    }

    pub fn remove(&mut self, name: &str) -> Option<EntryPoint> {
        self.symbols.remove(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Loaded libraries plus the paths searched for new ones
///
/// # Safety
///
/// Loading dynamic libraries is inherently unsafe. The loaded code runs in the
/// same process and can perform arbitrary operations.
pub struct LibraryLoader {
    /// Loaded libraries in load order
    loaded: Vec<(PathBuf, Library)>,
    search_paths: Vec<PathBuf>,
    /// Handle on the running executable and its dependencies
    process: Option<Library>,
}

impl LibraryLoader {
    pub fn new() -> Self {
        Self::with_search_paths(Vec::new())
    }

    /// Loader searching `paths` before the platform defaults
    pub fn with_search_paths(paths: Vec<PathBuf>) -> Self {
        let mut search_paths = paths;
        search_paths.extend(Self::default_search_paths());
        Self {
            loaded: Vec::new(),
            search_paths,
            process: Self::process_image(),
        }
    }

    #[cfg(unix)]
    fn process_image() -> Option<Library> {
        Some(libloading::os::unix::Library::this().into())
    }

    #[cfg(windows)]
    fn process_image() -> Option<Library> {
        libloading::os::windows::Library::this().ok().map(Into::into)
    }

    #[cfg(not(any(unix, windows)))]
    fn process_image() -> Option<Library> {
        None
    }

    /// Working directory, then the system library directories of the target
    fn default_search_paths() -> Vec<PathBuf> {
        let system: &[&str] = if cfg!(target_os = "macos") {
            &["/usr/lib", "/usr/local/lib", "/opt/homebrew/lib"]
        } else if cfg!(all(target_os = "linux", target_pointer_width = "64")) {
            &["/usr/lib", "/usr/local/lib", "/lib", "/usr/lib64", "/lib64"]
        } else if cfg!(target_os = "linux") {
            &["/usr/lib", "/usr/local/lib", "/lib"]
        } else {
            &[]
        };

        let mut paths: Vec<PathBuf> = std::env::current_dir().into_iter().collect();
        paths.extend(system.iter().map(PathBuf::from));
        if cfg!(target_os = "windows") {
            if let Some(root) = std::env::var_os("SystemRoot") {
                paths.push(PathBuf::from(root).join("System32"));
            }
        }
        paths
    }

    /// Resolve a short name (`m` → `libm.so`) or a path to an existing file
    fn resolve_library_path(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.components().count() > 1 || path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }

        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };
        let prefixes: &[&str] = if cfg!(target_os = "windows") {
            &["", "lib"]
        } else {
            &["lib", ""]
        };

        for search_path in &self.search_paths {
            // Exact file name first, e.g. "libc.so.6"
            let exact = search_path.join(name);
            if exact.is_file() {
                return Some(exact);
            }
            for prefix in prefixes {
                for ext in extensions {
                    let full_path = search_path.join(format!("{}{}.{}", prefix, name, ext));
                    if full_path.is_file() {
                        return Some(full_path);
                    }
                }
            }
        }

        None
    }

    /// Load a library by name or path; loading it again is a no-op
    ///
    /// Returns the resolved path.
    pub fn load(&mut self, name: &str) -> Result<PathBuf, LoadError> {
        let path = self
            .resolve_library_path(name)
            .ok_or_else(|| LoadError::LibraryNotFound(name.to_string()))?;

        if self.loaded.iter().any(|(loaded, _)| *loaded == path) {
            return Ok(path);
        }

        // SAFETY: running library initializers is the contract of loading.
        let library = unsafe {
            Library::new(&path).map_err(|e| LoadError::LoadFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?
        };
        self.loaded.push((path.clone(), library));
        Ok(path)
    }

    /// Find `symbol` in the loaded libraries, then in the process image
    pub fn find_symbol(&self, symbol: &str) -> Option<EntryPoint> {
        self.loaded
            .iter()
            .map(|(_, library)| library)
            .chain(self.process.iter())
            .find_map(|library| {
                // SAFETY: the address is only recorded, never called here.
                let found = unsafe { library.get::<unsafe extern "C" fn()>(symbol.as_bytes()) };
                found.ok().map(|f| EntryPoint::from_addr(*f as usize))
            })
    }

    /// Add a search path ahead of the existing ones
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_directory_searched_first() {
        let paths = LibraryLoader::default_search_paths();
        if let Ok(cwd) = std::env::current_dir() {
            assert_eq!(paths.first(), Some(&cwd));
        }
    }

    #[test]
    fn test_configured_paths_first() {
        let loader = LibraryLoader::with_search_paths(vec![PathBuf::from("/opt/kiln/lib")]);
        assert_eq!(loader.search_paths()[0], PathBuf::from("/opt/kiln/lib"));
    }

    #[test]
    fn test_missing_library() {
        let mut loader = LibraryLoader::new();
        assert_eq!(
            loader.load("kiln_missing_library"),
            Err(LoadError::LibraryNotFound("kiln_missing_library".to_string()))
        );
        assert_eq!(loader.loaded_count(), 0);
    }

    #[test]
    fn test_added_path_takes_priority() {
        let mut loader = LibraryLoader::with_search_paths(vec![PathBuf::from("/opt/kiln/lib")]);
        loader.add_search_path(PathBuf::from("/srv/plugins"));
        assert_eq!(
            &loader.search_paths()[..2],
            &[PathBuf::from("/srv/plugins"), PathBuf::from("/opt/kiln/lib")]
        );
    }

    #[test]
    fn test_symbol_table() {
        extern "C" fn one() -> i32 {
            1
        }
        let mut table = SymbolTable::new();
        let entry = EntryPoint::from_addr(one as usize);
        assert_eq!(table.register("one", entry).unwrap(), None);
        assert_eq!(table.get("one"), Some(entry));
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.register("null", EntryPoint::from_addr(0)),
            Err(LoadError::NullEntry("null".to_string()))
        );
        assert_eq!(table.remove("one"), Some(entry));
        assert!(table.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_image_symbols() {
        let loader = LibraryLoader::new();
        assert!(loader.find_symbol("strlen").is_some());
        assert!(loader.find_symbol("kiln_no_such_symbol_xyz").is_none());
    }
}
