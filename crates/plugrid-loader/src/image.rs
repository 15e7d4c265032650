//! Native image backends.
//!
//! An [`ImageBackend`] decides whether a file can host a plugin and opens
//! it into an [`ImageHandle`]: the owner of the native storage behind a
//! plugin instance. The loader keeps the handle alive for as long as the
//! instance is loaded; dropping the handle reclaims the image.
//!
//! The default backend opens platform shared libraries with `libloading`.
//! All unsafe FFI lives in this module.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};

use plugrid_core::{Document, PluginError, PluginHandle, PluginResult};

/// File extensions the host accepts as plugin images.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["so", "dll", "dylib", "qtplugin"];

/// Whether a path carries an accepted plugin extension.
#[must_use]
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// An opened plugin image.
///
/// The handle owns the native storage; the instantiated plugin aliases
/// it. Unload order is enforced by the loader: instances are dropped
/// before the handle.
pub trait ImageHandle: Send + Sync {
    /// The raw embedded metadata document.
    fn metadata(&self) -> PluginResult<Document>;

    /// The image's embedded interface ID, if it declares one. Used as the
    /// last-resort plugin ID when metadata carries neither `id` nor a
    /// usable `name`.
    fn interface_id(&self) -> Option<String> {
        None
    }

    /// Instantiate the plugin object backed by this image.
    fn instantiate(&self) -> PluginResult<PluginHandle>;
}

/// Opens files of a particular image format.
pub trait ImageBackend: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether this backend handles the given path.
    fn can_open(&self, path: &Path) -> bool;

    /// Open the image. The file must exist and be readable.
    fn open(&self, path: &Path) -> PluginResult<Box<dyn ImageHandle>>;
}

/// Symbol exporting the plugin metadata JSON as a NUL-terminated string.
const METADATA_SYMBOL: &[u8] = b"plugrid_plugin_metadata\0";
/// Symbol exporting the plugin's interface ID, optional.
const INTERFACE_SYMBOL: &[u8] = b"plugrid_plugin_interface\0";
/// Symbol exporting the plugin factory.
const FACTORY_SYMBOL: &[u8] = b"plugrid_plugin_create\0";

type MetadataFn = unsafe extern "C" fn() -> *const c_char;
type FactoryFn = unsafe extern "C" fn() -> *mut PluginHandle;

/// Backend for platform shared libraries.
#[derive(Debug, Default)]
pub struct DylibBackend;

impl DylibBackend {
    /// Create the backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ImageBackend for DylibBackend {
    fn name(&self) -> &'static str {
        "dylib"
    }

    fn can_open(&self, path: &Path) -> bool {
        has_image_extension(path)
    }

    fn open(&self, path: &Path) -> PluginResult<Box<dyn ImageHandle>> {
        if !path.is_file() {
            return Err(PluginError::file_not_found(path.display()));
        }
        // SAFETY: opening a library runs its initializers; the host trusts
        // images only after the security validator has passed them.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| {
            PluginError::load_failed(format!("cannot open image {}: {e}", path.display()))
        })?;
        Ok(Box::new(DylibImage {
            library,
            path: path.to_path_buf(),
        }))
    }
}

/// A shared library opened via `libloading`.
struct DylibImage {
    library: libloading::Library,
    path: PathBuf,
}

impl DylibImage {
    fn read_c_string(&self, symbol: &[u8]) -> PluginResult<Option<String>> {
        // SAFETY: the symbol, when present, must be an extern "C" function
        // returning a NUL-terminated UTF-8 string with static lifetime.
        // That is the exported-plugin ABI contract.
        let func: libloading::Symbol<'_, MetadataFn> =
            match unsafe { self.library.get(symbol) } {
                Ok(f) => f,
                Err(_) => return Ok(None),
            };
        let ptr = unsafe { func() };
        if ptr.is_null() {
            return Ok(None);
        }
        let s = unsafe { CStr::from_ptr(ptr) }
            .to_str()
            .map_err(|e| PluginError::invalid_format(format!("metadata is not UTF-8: {e}")))?;
        Ok(Some(s.to_string()))
    }
}

impl ImageHandle for DylibImage {
    fn metadata(&self) -> PluginResult<Document> {
        let raw = self.read_c_string(METADATA_SYMBOL)?.ok_or_else(|| {
            PluginError::invalid_format(format!(
                "image {} exports no metadata symbol",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PluginError::invalid_format(format!(
                "image {} has malformed metadata: {e}",
                self.path.display()
            ))
        })
    }

    fn interface_id(&self) -> Option<String> {
        self.read_c_string(INTERFACE_SYMBOL).ok().flatten()
    }

    fn instantiate(&self) -> PluginResult<PluginHandle> {
        // SAFETY: the factory symbol is the exported-plugin ABI entry
        // point. It returns a heap pointer to a PluginHandle which we take
        // ownership of. The Arc inside aliases storage owned by the image;
        // the loader guarantees the image outlives every clone.
        let factory: libloading::Symbol<'_, FactoryFn> = unsafe {
            self.library.get(FACTORY_SYMBOL)
        }
        .map_err(|e| {
            PluginError::load_failed(format!(
                "image {} exports no factory: {e}",
                self.path.display()
            ))
        })?;
        let raw = unsafe { factory() };
        if raw.is_null() {
            return Err(PluginError::load_failed(format!(
                "factory in {} returned null",
                self.path.display()
            )));
        }
        let handle = unsafe { *Box::from_raw(raw) };
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_allow_list() {
        assert!(has_image_extension(Path::new("a/b/codec.so")));
        assert!(has_image_extension(Path::new("codec.DLL")));
        assert!(has_image_extension(Path::new("codec.dylib")));
        assert!(has_image_extension(Path::new("codec.qtplugin")));
        assert!(!has_image_extension(Path::new("codec.plugin")));
        assert!(!has_image_extension(Path::new("codec.txt")));
        assert!(!has_image_extension(Path::new("codec")));
    }

    #[test]
    fn dylib_backend_rejects_missing_file() {
        let backend = DylibBackend::new();
        let err = backend.open(Path::new("/nonexistent/x.so")).err().unwrap();
        assert_eq!(err.kind(), plugrid_core::ErrorKind::FileNotFound);
    }

    #[test]
    fn dylib_backend_can_open_matches_extensions() {
        let backend = DylibBackend::new();
        assert!(backend.can_open(Path::new("x.so")));
        assert!(!backend.can_open(Path::new("x.json")));
    }
}
