//! Resolution engine: (resource, mode, hints) → one open plugin instance.
//!
//! Candidate order is deterministic: extension-matched backends first, in
//! registry priority order, then the global all-backends fallback list,
//! deduplicated while preserving first-seen order. Each candidate's own
//! predicate is the sole arbiter of acceptance — it receives both the
//! effective extension and the sniffed prefix and may accept on either.
//!
//! Unavailable backends (underlying tool or library missing) are skipped
//! during automatic resolution but fail loudly when named explicitly:
//! explicit choice is honored or clearly rejected, never silently replaced.

use std::time::Duration;

use log::{debug, warn};

use crate::NdioError;
use crate::ndimage::MetaMap;
use crate::plugin::Plugin;
use crate::registry::{BackendDescriptor, Registry, global};
use crate::resource::{OpenMode, Request, Resource};

/// Leading bytes offered to capability predicates for content sniffing.
pub(crate) const SNIFF_LEN: usize = 256;

/// Optional knobs for [`open_with`].
#[derive(Clone, Copy, Default)]
pub struct OpenOptions<'a> {
    plugin: Option<&'a str>,
    format_hint: Option<&'a str>,
    timeout: Option<Duration>,
    registry: Option<&'a Registry>,
    backend_options: Option<&'a MetaMap>,
}

impl<'a> OpenOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name a backend explicitly, bypassing candidate probing entirely.
    pub fn with_plugin(mut self, id: &'a str) -> Self {
        self.plugin = Some(id);
        self
    }

    /// Authoritative substitute for a missing or misleading extension.
    /// Accepts `"png"` or `".png"`.
    pub fn with_format_hint(mut self, hint: &'a str) -> Self {
        self.format_hint = Some(hint);
        self
    }

    /// Override the network timeout for this request only.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve against a private registry instead of the process-wide one.
    pub fn with_registry(mut self, registry: &'a Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Backend-specific options, handed to the selected backend verbatim
    /// (e.g. `fps` for video encodes). Unknown keys are ignored.
    pub fn with_backend_options(mut self, options: &'a MetaMap) -> Self {
        self.backend_options = Some(options);
        self
    }
}

/// Open a resource with default options.
///
/// The sole resolution boundary: convenience wrappers and tools all funnel
/// through here.
pub fn open(resource: impl Into<Resource>, mode: OpenMode) -> Result<Plugin, NdioError> {
    open_with(resource, mode, OpenOptions::new())
}

/// Open a resource with explicit backend/format hints.
pub fn open_with(
    resource: impl Into<Resource>,
    mode: OpenMode,
    opts: OpenOptions<'_>,
) -> Result<Plugin, NdioError> {
    let mut request = Request::new(resource.into(), mode)?;
    if let Some(timeout) = opts.timeout {
        request.set_timeout(timeout);
    }
    if let Some(hint) = opts.format_hint {
        request.set_extension(Some(normalize_extension(hint)));
    }
    if let Some(options) = opts.backend_options {
        request.set_options(options.clone());
    }

    let guard;
    let registry: &Registry = match opts.registry {
        Some(r) => r,
        None => {
            guard = global()
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            &guard
        }
    };

    // Explicit selection: caller-named backend, or the dedicated backend a
    // device token maps to. Honored or rejected, never substituted.
    let explicit = opts
        .plugin
        .map(str::to_owned)
        .or_else(|| request.device().map(|d| d.backend_id().to_owned()));

    if let Some(id) = explicit {
        let descriptor = registry.lookup(&id)?;
        descriptor
            .availability()
            .map_err(|reason| NdioError::BackendUnavailable {
                id: id.clone(),
                reason,
            })?;
        if !descriptor.modes().supports(mode) {
            return Err(NdioError::NoSuitableBackend {
                identifier: request.identifier().to_owned(),
                mode,
            });
        }
        debug!("resolved `{}` explicitly to backend `{id}`", request.identifier());
        let instance = descriptor.instantiate(request)?;
        return Ok(Plugin::new(instance, mode));
    }

    let identifier = request.identifier().to_owned();
    let extension = request.extension().map(str::to_owned);

    // Extension-matched candidates outrank the content-sniff fallback list.
    let mut candidates: Vec<&BackendDescriptor> = Vec::new();
    if let Some(ext) = extension.as_deref() {
        candidates.extend(registry.extension_candidates(ext, mode));
    }
    for descriptor in registry.all_backends(mode) {
        if !candidates.iter().any(|c| c.id() == descriptor.id()) {
            candidates.push(descriptor);
        }
    }
    if candidates.is_empty() {
        return Err(NdioError::NoSuitableBackend { identifier, mode });
    }

    // Sniff once; a resource we cannot reach aborts resolution here, before
    // any backend is instantiated.
    let prefix = request.peek_prefix(SNIFF_LEN)?.to_vec();

    let mut selected: Option<&BackendDescriptor> = None;
    for descriptor in candidates {
        if let Err(reason) = descriptor.availability() {
            warn!("skipping unavailable backend `{}`: {reason}", descriptor.id());
            continue;
        }
        if descriptor.accepts(extension.as_deref(), &prefix, mode) {
            debug!("backend `{}` accepted `{identifier}`", descriptor.id());
            selected = Some(descriptor);
            break;
        }
        debug!("backend `{}` declined `{identifier}`", descriptor.id());
    }

    let Some(descriptor) = selected else {
        return Err(NdioError::NoSuitableBackend { identifier, mode });
    };

    let instance = descriptor.instantiate(request)?;
    Ok(Plugin::new(instance, mode))
}

/// Normalize a format hint to a bare lowercase extension.
fn normalize_extension(hint: &str) -> String {
    hint.trim_start_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndimage::{Length, MetaMap, NdImage, Properties};
    use crate::plugin::BackendInstance;
    use crate::registry::{FormatDescriptor, ModeSet};
    use std::io::Write;

    struct Stub {
        id: &'static str,
        request: Request,
    }

    impl BackendInstance for Stub {
        fn id(&self) -> &str {
            self.id
        }
        fn request(&self) -> &Request {
            &self.request
        }
        fn request_mut(&mut self) -> &mut Request {
            &mut self.request
        }
        fn len(&mut self) -> Result<Length, NdioError> {
            Ok(Length::Exact(1))
        }
        fn read(&mut self, _index: usize) -> Result<NdImage, NdioError> {
            Ok(NdImage::from_u8(&[1, 1], vec![0]).unwrap())
        }
        fn next_element(&mut self) -> Option<Result<NdImage, NdioError>> {
            None
        }
        fn metadata(&mut self, _index: Option<usize>) -> Result<MetaMap, NdioError> {
            Ok(MetaMap::new())
        }
        fn properties(&mut self, _index: Option<usize>) -> Result<Properties, NdioError> {
            Ok(Properties {
                shape: vec![1, 1],
                element_type: crate::ndimage::ElementType::U8,
                n_images: Length::Exact(1),
                is_batch: false,
            })
        }
        fn write(&mut self, _image: &NdImage) -> Result<(), NdioError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), NdioError> {
            Ok(())
        }
    }

    macro_rules! stub_factory {
        ($name:ident, $id:literal) => {
            fn $name(
                request: Request,
            ) -> Result<Box<dyn BackendInstance>, NdioError> {
                Ok(Box::new(Stub { id: $id, request }))
            }
        };
    }

    stub_factory!(open_alpha, "alpha");
    stub_factory!(open_beta, "beta");
    stub_factory!(open_sniffer, "sniffer");
    stub_factory!(open_ghost, "ghost");
    stub_factory!(open_picky, "picky");

    fn available() -> Result<(), String> {
        Ok(())
    }

    fn missing_tool() -> Result<(), String> {
        Err("tool not installed".into())
    }

    fn by_extension(ext: Option<&str>, _prefix: &[u8], _mode: OpenMode) -> bool {
        ext == Some("fak")
    }

    fn by_magic(_ext: Option<&str>, prefix: &[u8], _mode: OpenMode) -> bool {
        prefix.starts_with(b"MAGIC")
    }

    fn refuse(_ext: Option<&str>, _prefix: &[u8], _mode: OpenMode) -> bool {
        false
    }

    fn descriptor(
        id: &'static str,
        modes: ModeSet,
        availability: fn() -> Result<(), String>,
        accepts: fn(Option<&str>, &[u8], OpenMode) -> bool,
        factory: fn(Request) -> Result<Box<dyn BackendInstance>, NdioError>,
    ) -> crate::registry::BackendDescriptor {
        crate::registry::BackendDescriptor::modern(
            id,
            "test backend",
            &["fak"],
            modes,
            availability,
            accepts,
            factory,
        )
    }

    fn test_registry() -> Registry {
        let mut registry = Registry::empty();
        registry.register(descriptor(
            "alpha",
            ModeSet::READ_WRITE,
            available,
            by_extension,
            open_alpha,
        ));
        registry.register(descriptor(
            "beta",
            ModeSet::READ_WRITE,
            available,
            by_extension,
            open_beta,
        ));
        registry.register(descriptor(
            "sniffer",
            ModeSet::READ,
            available,
            by_magic,
            open_sniffer,
        ));
        registry.register_format(FormatDescriptor::new(
            "fake",
            "test format",
            &["fak"],
            &["alpha", "beta"],
        ));
        registry
    }

    #[test]
    fn extension_match_selects_highest_priority() {
        let registry = test_registry();
        let plugin = open_with(
            b"payload".as_slice(),
            OpenMode::Read,
            OpenOptions::new()
                .with_format_hint("fak")
                .with_registry(&registry),
        )
        .unwrap();
        assert_eq!(plugin.backend_id(), "alpha");
    }

    #[test]
    fn reorder_changes_selection() {
        let mut registry = test_registry();
        registry.reorder("fak", &["beta"]).unwrap();
        let plugin = open_with(
            b"payload".as_slice(),
            OpenMode::Read,
            OpenOptions::new()
                .with_format_hint("fak")
                .with_registry(&registry),
        )
        .unwrap();
        assert_eq!(plugin.backend_id(), "beta");
    }

    #[test]
    fn extension_from_filename() {
        let registry = test_registry();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.fak");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"payload")
            .unwrap();

        let plugin = open_with(
            path.as_path(),
            OpenMode::Read,
            OpenOptions::new().with_registry(&registry),
        )
        .unwrap();
        assert_eq!(plugin.backend_id(), "alpha");
    }

    #[test]
    fn raw_bytes_fall_back_to_content_sniffing() {
        let registry = test_registry();
        // No extension, no hint: the extension-keyed backends decline and
        // the sniffer matches on magic alone.
        let plugin = open_with(
            b"MAGIC-and-payload".as_slice(),
            OpenMode::Read,
            OpenOptions::new().with_registry(&registry),
        )
        .unwrap();
        assert_eq!(plugin.backend_id(), "sniffer");

        // Same bytes, same backend: resolution is deterministic.
        let again = open_with(
            b"MAGIC-and-payload".as_slice(),
            OpenMode::Read,
            OpenOptions::new().with_registry(&registry),
        )
        .unwrap();
        assert_eq!(again.backend_id(), plugin.backend_id());
    }

    #[test]
    fn no_candidate_accepts() {
        let registry = test_registry();
        let result = open_with(
            b"unmarked bytes".as_slice(),
            OpenMode::Read,
            OpenOptions::new().with_registry(&registry),
        );
        assert!(matches!(
            result,
            Err(NdioError::NoSuitableBackend {
                mode: OpenMode::Read,
                ..
            })
        ));
    }

    #[test]
    fn unknown_explicit_backend_fails_before_resolution() {
        let registry = test_registry();
        // The path does not exist; an unknown explicit name must fail
        // before the resource is ever touched.
        let result = open_with(
            "clip.mp4",
            OpenMode::Read,
            OpenOptions::new()
                .with_plugin("nonexistent-backend")
                .with_registry(&registry),
        );
        assert!(matches!(result, Err(NdioError::UnknownBackend(_))));
    }

    #[test]
    fn explicit_unavailable_backend_is_a_hard_failure() {
        let mut registry = test_registry();
        registry.register(descriptor(
            "ghost",
            ModeSet::READ,
            missing_tool,
            by_extension,
            open_ghost,
        ));
        let result = open_with(
            b"payload".as_slice(),
            OpenMode::Read,
            OpenOptions::new()
                .with_plugin("ghost")
                .with_registry(&registry),
        );
        assert!(matches!(result, Err(NdioError::BackendUnavailable { .. })));
    }

    #[test]
    fn automatic_resolution_skips_unavailable_backends() {
        let mut registry = Registry::empty();
        registry.register(descriptor(
            "ghost",
            ModeSet::READ,
            missing_tool,
            by_extension,
            open_ghost,
        ));
        registry.register(descriptor(
            "beta",
            ModeSet::READ,
            available,
            by_extension,
            open_beta,
        ));
        registry.register_format(FormatDescriptor::new(
            "fake",
            "",
            &["fak"],
            &["ghost", "beta"],
        ));

        let plugin = open_with(
            b"payload".as_slice(),
            OpenMode::Read,
            OpenOptions::new()
                .with_format_hint("fak")
                .with_registry(&registry),
        )
        .unwrap();
        assert_eq!(plugin.backend_id(), "beta");
    }

    #[test]
    fn explicit_selection_bypasses_predicate() {
        let mut registry = test_registry();
        registry.register(descriptor(
            "picky",
            ModeSet::READ,
            available,
            refuse,
            open_picky,
        ));
        let plugin = open_with(
            b"whatever".as_slice(),
            OpenMode::Read,
            OpenOptions::new()
                .with_plugin("picky")
                .with_registry(&registry),
        )
        .unwrap();
        assert_eq!(plugin.backend_id(), "picky");
    }

    #[test]
    fn format_hint_substitutes_extension() {
        let registry = test_registry();
        // `.fak` hint with a leading dot normalizes and reaches the
        // extension-keyed predicate.
        let plugin = open_with(
            b"payload".as_slice(),
            OpenMode::Read,
            OpenOptions::new()
                .with_format_hint(".FAK")
                .with_registry(&registry),
        )
        .unwrap();
        assert_eq!(plugin.backend_id(), "alpha");
    }

    #[test]
    fn unreachable_resource_aborts_resolution() {
        let registry = test_registry();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.fak");
        let result = open_with(
            path.as_path(),
            OpenMode::Read,
            OpenOptions::new().with_registry(&registry),
        );
        assert!(matches!(result, Err(NdioError::ResourceUnavailable { .. })));
    }

    #[test]
    fn write_mode_filters_read_only_backends() {
        let mut registry = Registry::empty();
        registry.register(descriptor(
            "sniffer",
            ModeSet::READ,
            available,
            by_extension,
            open_sniffer,
        ));
        let result = open_with(
            "<bytes>",
            OpenMode::Write,
            OpenOptions::new()
                .with_format_hint("fak")
                .with_registry(&registry),
        );
        assert!(matches!(result, Err(NdioError::NoSuitableBackend { .. })));
    }

    #[test]
    fn device_tokens_map_to_dedicated_backends() {
        // Empty registry: the mapping itself must already name the backend.
        let registry = Registry::empty();
        let result = open_with(
            "<video0>",
            OpenMode::Read,
            OpenOptions::new().with_registry(&registry),
        );
        assert!(matches!(result, Err(NdioError::UnknownBackend(id)) if id == "ffmpeg"));
    }
}
