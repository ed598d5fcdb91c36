//! Uniform plugin contract and the caller-facing handle.
//!
//! Every backend — modern or legacy-wrapped — is driven through
//! [`BackendInstance`]. Callers never touch that trait directly; resolution
//! returns a [`Plugin`], which adds the open/closed state machine, the
//! `index: Option<usize>` read convention (`None` = all elements), and
//! byte-sink retrieval.

use crate::NdioError;
use crate::ndimage::{Length, MetaMap, NdData, NdImage, Properties};
use crate::resource::{OpenMode, Request};

/// The uniform, backend-agnostic operation set.
///
/// One instance binds exactly one [`Request`] for its whole lifetime.
/// Implementations may assume calls arrive from a single thread; concurrent
/// use of one resource requires independent instances.
pub trait BackendInstance {
    /// Identifier of the backend that produced this instance.
    fn id(&self) -> &str;

    fn request(&self) -> &Request;

    fn request_mut(&mut self) -> &mut Request;

    /// Number of elements in the resource. Unknown counts are
    /// [`Length::Unbounded`], not an error.
    fn len(&mut self) -> Result<Length, NdioError>;

    /// Decode the element at `index`.
    fn read(&mut self, index: usize) -> Result<NdImage, NdioError>;

    /// Next element in file order, or `None` when exhausted.
    fn next_element(&mut self) -> Option<Result<NdImage, NdioError>>;

    /// Restart iteration from the first element. Returns `false` when the
    /// source is forward-only (live devices, drained pipes).
    fn rewind(&mut self) -> Result<bool, NdioError> {
        Ok(false)
    }

    /// Backend-specific metadata: per-element for `Some(index)`,
    /// container-level for `None`.
    fn metadata(&mut self, index: Option<usize>) -> Result<MetaMap, NdioError>;

    /// Standardized record for one element (`Some`) or the whole resource
    /// (`None`).
    fn properties(&mut self, index: Option<usize>) -> Result<Properties, NdioError>;

    /// Append one element to the output.
    fn write(&mut self, image: &NdImage) -> Result<(), NdioError> {
        let _ = image;
        Err(NdioError::UnsupportedOperation {
            id: self.id().to_owned(),
            detail: "writing",
        })
    }

    /// Attach container-level metadata. Best-effort: fields the format
    /// cannot carry are ignored, not errors.
    fn set_global_metadata(&mut self, meta: &MetaMap) -> Result<(), NdioError> {
        let _ = meta;
        Ok(())
    }

    /// Flush pending output and release backend-held resources. The handle
    /// guarantees at most one call.
    fn close(&mut self) -> Result<(), NdioError>;
}

/// An open plugin instance: one backend bound to one resource.
///
/// State machine: `Opened → Closed`, no way back. Close is idempotent and
/// also runs on drop, so file handles, child processes, and temp files are
/// released even without an explicit call.
pub struct Plugin {
    id: String,
    mode: OpenMode,
    backend: Box<dyn BackendInstance>,
    closed: bool,
    result: Option<Vec<u8>>,
}

impl Plugin {
    pub(crate) fn new(backend: Box<dyn BackendInstance>, mode: OpenMode) -> Self {
        Self {
            id: backend.id().to_owned(),
            mode,
            backend,
            closed: false,
            result: None,
        }
    }

    /// Identifier of the backend serving this instance.
    pub fn backend_id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Identifier of the underlying resource.
    pub fn identifier(&self) -> String {
        self.backend.request().identifier().to_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of elements in the resource.
    pub fn len(&mut self) -> Result<Length, NdioError> {
        self.ensure(OpenMode::Read)?;
        self.backend.len()
    }

    /// Decode one element (`Some(index)`) or all of them (`None`).
    ///
    /// With `None`, a single-element resource comes back as-is; a
    /// multi-element one is stacked along a new leading axis. Unbounded
    /// sources cannot be read whole — iterate instead.
    pub fn read(&mut self, index: Option<usize>) -> Result<NdImage, NdioError> {
        self.ensure(OpenMode::Read)?;
        match index {
            Some(i) => self.backend.read(i),
            None => match self.backend.len()? {
                Length::Exact(0) => Err(NdioError::IndexOutOfRange {
                    index: 0,
                    len: 0,
                    identifier: self.backend.request().identifier().to_owned(),
                }),
                Length::Exact(1) => self.backend.read(0),
                Length::Exact(n) => {
                    let mut frames = Vec::with_capacity(n);
                    for i in 0..n {
                        frames.push(self.backend.read(i)?.data);
                    }
                    let data = NdData::stack(&frames).map_err(|detail| {
                        NdioError::UnsupportedOperation {
                            id: self.id.clone(),
                            detail,
                        }
                    })?;
                    let meta = self.backend.metadata(None)?;
                    Ok(NdImage { data, meta })
                }
                Length::Unbounded => Err(NdioError::UnsupportedOperation {
                    id: self.id.clone(),
                    detail: "reading all elements of an unbounded stream",
                }),
            },
        }
    }

    /// Lazily iterate elements in file order.
    ///
    /// Restarts from the first element for seekable sources; forward-only
    /// sources continue from wherever they are. Live sources never end on
    /// their own — stop by ceasing to pull and closing the plugin.
    pub fn iter(&mut self) -> Result<Elements<'_>, NdioError> {
        self.ensure(OpenMode::Read)?;
        self.backend.rewind()?;
        Ok(Elements { plugin: self })
    }

    /// Backend-specific metadata: per-element for `Some(index)`,
    /// container-level for `None`.
    pub fn metadata(&mut self, index: Option<usize>) -> Result<MetaMap, NdioError> {
        self.ensure(OpenMode::Read)?;
        self.backend.metadata(index)
    }

    /// Standardized record for one element or the whole resource.
    pub fn properties(&mut self, index: Option<usize>) -> Result<Properties, NdioError> {
        self.ensure(OpenMode::Read)?;
        self.backend.properties(index)
    }

    /// Append one element to the output.
    pub fn write(&mut self, image: &NdImage) -> Result<(), NdioError> {
        self.ensure(OpenMode::Write)?;
        self.backend.write(image)
    }

    /// Append an ordered sequence of elements.
    pub fn write_sequence<'a, I>(&mut self, images: I) -> Result<(), NdioError>
    where
        I: IntoIterator<Item = &'a NdImage>,
    {
        for image in images {
            self.write(image)?;
        }
        Ok(())
    }

    /// Attach container-level metadata where the format supports it.
    pub fn set_global_metadata(&mut self, meta: &MetaMap) -> Result<(), NdioError> {
        self.ensure(OpenMode::Write)?;
        self.backend.set_global_metadata(meta)
    }

    /// Flush pending writes and release the bound resource. Idempotent.
    pub fn close(&mut self) -> Result<(), NdioError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let outcome = self.backend.close();
        // Resource teardown happens regardless of how the flush went.
        self.result = self.backend.request_mut().take_result();
        self.backend.request_mut().close();
        outcome
    }

    /// Encoded output of a `"<bytes>"` sink. Available after close; takes
    /// ownership, so a second call returns `None`.
    pub fn result_bytes(&mut self) -> Option<Vec<u8>> {
        self.result.take()
    }

    fn ensure(&self, mode: OpenMode) -> Result<(), NdioError> {
        if self.closed {
            return Err(NdioError::Closed);
        }
        if self.mode != mode {
            return Err(NdioError::UnsupportedOperation {
                id: self.id.clone(),
                detail: match mode {
                    OpenMode::Read => "reading from a write-mode instance",
                    OpenMode::Write => "writing to a read-mode instance",
                },
            });
        }
        Ok(())
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("backend", &self.id)
            .field("mode", &self.mode)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Lazy, forward-only element iterator over an open plugin.
pub struct Elements<'a> {
    plugin: &'a mut Plugin,
}

impl Iterator for Elements<'_> {
    type Item = Result<NdImage, NdioError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.plugin.closed {
            return None;
        }
        self.plugin.backend.next_element()
    }
}
