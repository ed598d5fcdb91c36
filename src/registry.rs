//! Backend and format catalogs.
//!
//! Two catalogs drive resolution: format descriptors map extensions to an
//! ordered list of backend identifiers (first accepting backend wins), and
//! backend descriptors carry each backend's capability metadata, its
//! availability probe, and its constructor.
//!
//! Compile-time features determine which backends are *compiled in*; the
//! availability probe determines whether a compiled backend is *usable*
//! (e.g. the `ffmpeg` binary is actually installed). Probes run lazily, at
//! most once, so registry construction never fails on a missing tool.
//!
//! The process-wide registry is built once behind a lock and is read-only
//! afterwards except for explicit reordering. Requests can carry their own
//! [`Registry`] instead (see
//! [`OpenOptions::with_registry`](crate::OpenOptions::with_registry)),
//! which tests use to avoid touching shared state.

use std::sync::{OnceLock, RwLock};

use crate::NdioError;
use crate::config::Config;
use crate::legacy::{LegacyAdapter, LegacyFormat};
use crate::plugin::BackendInstance;
use crate::resource::{OpenMode, Request};

/// Read/write capability set declared by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeSet {
    read: bool,
    write: bool,
}

impl ModeSet {
    pub const READ: Self = Self {
        read: true,
        write: false,
    };
    pub const WRITE: Self = Self {
        read: false,
        write: true,
    };
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    pub fn supports(self, mode: OpenMode) -> bool {
        match mode {
            OpenMode::Read => self.read,
            OpenMode::Write => self.write,
        }
    }
}

/// Which calling convention a backend implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Implements [`BackendInstance`] directly.
    Modern,
    /// Exposes separate reader/writer objects; driven through
    /// [`LegacyAdapter`].
    Legacy,
}

/// Capability predicate: is this backend willing to handle a resource with
/// this (effective) extension and sniffed prefix in this mode?
///
/// The predicate is the sole arbiter: it may accept on the extension alone,
/// on the prefix alone, or require both.
pub type AcceptsFn = fn(Option<&str>, &[u8], OpenMode) -> bool;

/// Availability probe for the backend's underlying machinery.
pub type AvailabilityFn = fn() -> Result<(), String>;

/// Constructor of a modern backend, bound to a request.
pub type ModernFactory = fn(Request) -> Result<Box<dyn BackendInstance>, NdioError>;

/// Constructor of a legacy backend's format object.
pub type LegacyFactory = fn() -> Box<dyn LegacyFormat>;

#[derive(Clone, Copy)]
enum Factory {
    Modern(ModernFactory),
    Legacy(LegacyFactory),
}

/// Everything the resolution engine needs to know about one backend.
#[derive(Clone)]
pub struct BackendDescriptor {
    id: &'static str,
    description: &'static str,
    extensions: &'static [&'static str],
    modes: ModeSet,
    availability: AvailabilityFn,
    accepts: AcceptsFn,
    factory: Factory,
}

impl BackendDescriptor {
    pub fn modern(
        id: &'static str,
        description: &'static str,
        extensions: &'static [&'static str],
        modes: ModeSet,
        availability: AvailabilityFn,
        accepts: AcceptsFn,
        factory: ModernFactory,
    ) -> Self {
        Self {
            id,
            description,
            extensions,
            modes,
            availability,
            accepts,
            factory: Factory::Modern(factory),
        }
    }

    pub fn legacy(
        id: &'static str,
        description: &'static str,
        extensions: &'static [&'static str],
        modes: ModeSet,
        availability: AvailabilityFn,
        accepts: AcceptsFn,
        factory: LegacyFactory,
    ) -> Self {
        Self {
            id,
            description,
            extensions,
            modes,
            availability,
            accepts,
            factory: Factory::Legacy(factory),
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        self.extensions
    }

    pub fn modes(&self) -> ModeSet {
        self.modes
    }

    pub fn interface(&self) -> InterfaceKind {
        match self.factory {
            Factory::Modern(_) => InterfaceKind::Modern,
            Factory::Legacy(_) => InterfaceKind::Legacy,
        }
    }

    /// Probe whether the backend's underlying machinery is usable.
    pub fn availability(&self) -> Result<(), String> {
        (self.availability)()
    }

    /// Run the backend's capability predicate.
    pub fn accepts(&self, extension: Option<&str>, prefix: &[u8], mode: OpenMode) -> bool {
        self.modes.supports(mode) && (self.accepts)(extension, prefix, mode)
    }

    /// Construct the backend against a request, wrapping legacy backends in
    /// the adapter.
    pub(crate) fn instantiate(
        &self,
        request: Request,
    ) -> Result<Box<dyn BackendInstance>, NdioError> {
        self.availability()
            .map_err(|reason| NdioError::BackendUnavailable {
                id: self.id.to_owned(),
                reason,
            })?;
        match self.factory {
            Factory::Modern(f) => f(request),
            Factory::Legacy(f) => Ok(Box::new(LegacyAdapter::new(self.id, f(), request)?)),
        }
    }
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("id", &self.id)
            .field("extensions", &self.extensions)
            .field("modes", &self.modes)
            .field("interface", &self.interface())
            .finish()
    }
}

/// One known format: a name, its extensions, and the backends willing to
/// claim it, in priority order.
///
/// Extensions map many-to-many to backends; the same extension may appear
/// under several formats with different priority lists.
#[derive(Clone, Debug)]
pub struct FormatDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub extensions: &'static [&'static str],
    backends: Vec<&'static str>,
}

impl FormatDescriptor {
    pub fn new(
        name: &'static str,
        description: &'static str,
        extensions: &'static [&'static str],
        backends: &[&'static str],
    ) -> Self {
        Self {
            name,
            description,
            extensions,
            backends: backends.to_vec(),
        }
    }

    /// Backend identifiers in priority order.
    pub fn backends(&self) -> &[&'static str] {
        &self.backends
    }
}

/// Catalog of formats and backends.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    backends: Vec<BackendDescriptor>,
    formats: Vec<FormatDescriptor>,
}

impl Registry {
    /// Registry with nothing registered. Callers add their own descriptors.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with all compiled-in backends and known formats.
    pub fn builtin() -> Self {
        Self::builtin_with(Config::get())
    }

    pub(crate) fn builtin_with(config: &Config) -> Self {
        let mut registry = Self::empty();

        #[cfg(feature = "png")]
        registry.register(crate::backends::png::descriptor());
        #[cfg(feature = "image")]
        registry.register(crate::backends::image_rs::descriptor());
        #[cfg(feature = "tiff")]
        registry.register(crate::backends::tiff::descriptor());
        #[cfg(feature = "ffmpeg")]
        registry.register(crate::backends::ffmpeg::descriptor());
        #[cfg(feature = "clipboard")]
        registry.register(crate::backends::clipboard::descriptor());

        for format in builtin_formats() {
            registry.register_format(format);
        }

        registry.promote(&config.format_order);
        registry
    }

    /// Register a backend. Re-registering an id replaces the descriptor in
    /// place, keeping its position in the global priority order.
    pub fn register(&mut self, backend: BackendDescriptor) {
        match self.backends.iter_mut().find(|b| b.id == backend.id) {
            Some(slot) => *slot = backend,
            None => self.backends.push(backend),
        }
    }

    /// Register a format descriptor.
    pub fn register_format(&mut self, format: FormatDescriptor) {
        match self.formats.iter_mut().find(|f| f.name == format.name) {
            Some(slot) => *slot = format,
            None => self.formats.push(format),
        }
    }

    /// All registered backends in global priority order.
    pub fn backends(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backends.iter()
    }

    /// All registered formats.
    pub fn formats(&self) -> impl Iterator<Item = &FormatDescriptor> {
        self.formats.iter()
    }

    /// Backend descriptor by identifier.
    ///
    /// Fails with [`NdioError::UnknownBackend`] for identifiers that were
    /// never registered. Availability is a separate question — see
    /// [`BackendDescriptor::availability`].
    pub fn lookup(&self, id: &str) -> Result<&BackendDescriptor, NdioError> {
        self.backends
            .iter()
            .find(|b| b.id == id)
            .ok_or_else(|| NdioError::UnknownBackend(id.to_owned()))
    }

    /// Ordered backends registered for an extension, filtered to those
    /// declaring support for `mode`.
    ///
    /// Unknown extensions yield an empty list, never an error; callers fall
    /// back to content sniffing across all backends.
    pub fn extension_candidates(&self, extension: &str, mode: OpenMode) -> Vec<&BackendDescriptor> {
        let ext = extension.to_ascii_lowercase();
        let mut out: Vec<&BackendDescriptor> = Vec::new();
        for format in &self.formats {
            if !format.extensions.contains(&ext.as_str()) {
                continue;
            }
            for id in &format.backends {
                let Ok(descriptor) = self.lookup(id) else {
                    continue; // declared but not compiled in
                };
                if descriptor.modes.supports(mode) && !out.iter().any(|d| d.id == descriptor.id) {
                    out.push(descriptor);
                }
            }
        }
        out
    }

    /// Every backend supporting `mode`, in stable global priority order.
    /// The fallback candidate list when extension lookup is inconclusive.
    pub fn all_backends(&self, mode: OpenMode) -> Vec<&BackendDescriptor> {
        self.backends
            .iter()
            .filter(|b| b.modes.supports(mode))
            .collect()
    }

    /// Override backend priority for a format, addressed by format name or
    /// by one of its extensions.
    ///
    /// Every identifier in `order` must already be a known backend of that
    /// format; the listed backends move to the front (in the given order),
    /// unlisted ones keep their relative order behind them.
    pub fn reorder(&mut self, format_or_extension: &str, order: &[&str]) -> Result<(), NdioError> {
        let key = format_or_extension.to_ascii_lowercase();
        let format = self
            .formats
            .iter_mut()
            .find(|f| f.name == key || f.extensions.contains(&key.as_str()))
            .ok_or_else(|| NdioError::UnknownBackend(format!("no format named `{key}`")))?;

        let mut reordered: Vec<&'static str> = Vec::with_capacity(format.backends.len());
        for id in order {
            let known = format
                .backends
                .iter()
                .copied()
                .find(|b| b == id)
                .ok_or_else(|| NdioError::UnknownBackend((*id).to_owned()))?;
            if !reordered.contains(&known) {
                reordered.push(known);
            }
        }
        for id in format.backends.iter().copied() {
            if !reordered.contains(&id) {
                reordered.push(id);
            }
        }
        format.backends = reordered;
        Ok(())
    }

    /// Move the listed backend ids to the front of the global priority
    /// order, preserving their given order. Unknown ids are ignored.
    pub fn promote(&mut self, ids: &[String]) {
        for id in ids.iter().rev() {
            if let Some(pos) = self.backends.iter().position(|b| b.id == id.as_str()) {
                let descriptor = self.backends.remove(pos);
                self.backends.insert(0, descriptor);
            }
        }
    }
}

/// Built-in format catalog. Extensions are lowercase, no leading dot.
fn builtin_formats() -> Vec<FormatDescriptor> {
    vec![
        FormatDescriptor::new(
            "png",
            "Portable Network Graphics",
            &["png", "apng"],
            &["png", "image"],
        ),
        FormatDescriptor::new(
            "jpeg",
            "Joint Photographic Experts Group",
            &["jpg", "jpeg", "jfif"],
            &["image"],
        ),
        FormatDescriptor::new("gif", "Graphics Interchange Format", &["gif"], &["image"]),
        FormatDescriptor::new("bmp", "Windows bitmap", &["bmp"], &["image"]),
        FormatDescriptor::new("webp", "WebP", &["webp"], &["image"]),
        FormatDescriptor::new(
            "tiff",
            "Tagged Image File Format",
            &["tif", "tiff"],
            &["tiff", "image"],
        ),
        FormatDescriptor::new(
            "video",
            "Container video formats via ffmpeg",
            &["mp4", "mkv", "mov", "avi", "webm"],
            &["ffmpeg"],
        ),
    ]
}

/// The process-wide registry, built on first access.
pub fn global() -> &'static RwLock<Registry> {
    static GLOBAL: OnceLock<RwLock<Registry>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(Registry::builtin()))
}

/// Override backend priority for a format in the process-wide registry.
pub fn set_priority(format_or_extension: &str, order: &[&str]) -> Result<(), NdioError> {
    global()
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .reorder(format_or_extension, order)
}
