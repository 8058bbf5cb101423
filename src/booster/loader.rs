//! Dynamic loading for boosters
//!
//! Preloaded libraries are opened with `RTLD_NOW | RTLD_GLOBAL` so every
//! later `dlopen` of an application resolves against the already mapped,
//! already relocated copies. That is where the startup time goes.

use crate::error::LauncherError;
use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use std::ffi::{c_char, c_int};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Entry point of an application loaded into a booster
pub type MainFn = unsafe extern "C" fn(argc: c_int, argv: *mut *mut c_char) -> c_int;

/// `dlopen` with `RTLD_NOW | RTLD_GLOBAL`
pub fn open(path: &Path) -> Result<Library, libloading::Error> {
    // SAFETY: running the object's initializers is what loading it is for
    unsafe { Library::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }
}

/// Open the invoked application and resolve its `main`
pub fn load_main(path: &Path) -> Result<(Library, MainFn), LauncherError> {
    let library = open(path).map_err(|e| LauncherError::LoadFailed(e.to_string()))?;

    // SAFETY: applications built for the booster export `int main(int, char **)`
    let main = unsafe { library.get::<MainFn>(b"main\0") }
        .map(|symbol| *symbol)
        .map_err(|e| LauncherError::SymbolMissing {
            symbol: "main".to_string(),
            reason: e.to_string(),
        })?;

    Ok((library, main))
}

/// Open every library of a runtime profile. Failures are logged and skipped.
pub fn preload(paths: &[PathBuf]) -> Vec<Library> {
    let mut loaded = Vec::with_capacity(paths.len());
    for path in paths {
        match open(path) {
            Ok(library) => {
                debug!("Booster: preloaded {}", path.display());
                loaded.push(library);
            }
            Err(e) => warn!("Booster: Preloading {} failed: {}", path.display(), e),
        }
    }
    loaded
}
