//! Locating and loading the engine's shared library.
//!
//! Handles platform-specific library naming (including versioned sonames) and
//! search paths. Loaded libraries are cached by resolved path.

use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Library loading errors
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    /// Library file not found in search paths
    LibraryNotFound(String),
    /// Symbol not found in library
    SymbolNotFound { library: String, symbol: String },
    /// Failed to load library
    LoadFailed(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::LibraryNotFound(name) => write!(f, "Library not found: {}", name),
            LoadError::SymbolNotFound { library, symbol } => {
                write!(f, "Symbol '{}' not found in library '{}'", symbol, library)
            }
            LoadError::LoadFailed(msg) => write!(f, "Failed to load library: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

/// Engine library loader with path resolution and caching
///
/// # Safety
///
/// Loading a shared library runs its initialisers in this process. Only point
/// the loader at libraries you trust.
pub struct LibraryLoader {
    loaded: HashMap<PathBuf, Arc<Library>>,
    search_paths: Vec<PathBuf>,
}

impl LibraryLoader {
    pub fn new() -> Self {
        Self {
            loaded: HashMap::new(),
            search_paths: Self::default_search_paths(),
        }
    }

    /// Loader searching `extra` before the platform defaults.
    pub fn with_search_paths(extra: &[PathBuf]) -> Self {
        let mut loader = Self::new();
        for path in extra.iter().rev() {
            loader.add_search_path(path.clone());
        }
        loader
    }

    /// Platform library directories, current directory first.
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/lib"));

            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
                paths.push(PathBuf::from("/usr/lib/x86_64-linux-gnu"));
                paths.push(PathBuf::from("/usr/lib/aarch64-linux-gnu"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(program_files) = std::env::var("ProgramFiles") {
                paths.push(PathBuf::from(program_files).join("mosquitto"));
            }
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.insert(0, cwd);
        }

        paths
    }

    /// Candidate file names for a short library name, in priority order.
    ///
    /// Runtime-only installs usually ship just the versioned soname
    /// (`libmosquitto.so.1`), so that is tried after the plain name.
    fn candidate_file_names(name: &str) -> Vec<String> {
        if cfg!(target_os = "windows") {
            vec![format!("{}.dll", name), format!("lib{}.dll", name)]
        } else if cfg!(target_os = "macos") {
            vec![
                format!("lib{}.dylib", name),
                format!("lib{}.1.dylib", name),
                format!("lib{}.so", name),
            ]
        } else {
            vec![
                format!("lib{}.so", name),
                format!("lib{}.so.1", name),
                format!("{}.so", name),
            ]
        }
    }

    /// Resolve a short name or path to an existing file
    fn resolve_library_path(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.components().count() > 1 || path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }

        let candidates = Self::candidate_file_names(name);
        self.search_paths
            .iter()
            .flat_map(|dir| candidates.iter().map(move |file| dir.join(file)))
            .find(|full_path| full_path.exists())
    }

    /// Load a library by short name (`"mosquitto"`) or path.
    ///
    /// Falls back to the system loader's own lookup when no search path matches.
    pub fn load(&mut self, name: &str) -> Result<Arc<Library>, LoadError> {
        let path = match self.resolve_library_path(name) {
            Some(path) => path,
            None => return self.load_from_system(name),
        };

        if let Some(library) = self.loaded.get(&path) {
            return Ok(library.clone());
        }

        tracing::debug!(path = %path.display(), "loading engine library");
        let library = unsafe { Library::new(&path) }
            .map_err(|e| LoadError::LoadFailed(format!("{}: {}", path.display(), e)))?;
        let library = Arc::new(library);
        self.loaded.insert(path, library.clone());
        Ok(library)
    }

    fn load_from_system(&mut self, name: &str) -> Result<Arc<Library>, LoadError> {
        if Path::new(name).components().count() > 1 {
            return Err(LoadError::LibraryNotFound(name.to_string()));
        }

        let file_name = libloading::library_filename(name);
        let key = PathBuf::from(&file_name);
        if let Some(library) = self.loaded.get(&key) {
            return Ok(library.clone());
        }

        match unsafe { Library::new(&file_name) } {
            Ok(library) => {
                let library = Arc::new(library);
                self.loaded.insert(key, library.clone());
                Ok(library)
            }
            Err(_) => Err(LoadError::LibraryNotFound(name.to_string())),
        }
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

/// Copy a function pointer out of `library`.
///
/// # Safety
///
/// `T` must match the C signature of `symbol`, and the returned pointer must not
/// be called after `library` is unloaded.
pub(crate) unsafe fn resolve<T: Copy>(library: &Library, library_name: &str, symbol: &str) -> Result<T, LoadError> {
    let mut name = Vec::with_capacity(symbol.len() + 1);
    name.extend_from_slice(symbol.as_bytes());
    name.push(0);

    library
        .get::<T>(&name)
        .map(|sym| *sym)
        .map_err(|_| LoadError::SymbolNotFound {
            library: library_name.to_string(),
            symbol: symbol.to_string(),
        })
}
