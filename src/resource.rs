//! Resource normalization.
//!
//! Every input `open()` accepts — filesystem path, in-memory bytes, reader,
//! URI, special device token — is normalized into a [`Request`]: a uniform
//! handle exposing byte access, a memoized sniff prefix, and lazy
//! materialization to a local file for backends that need one.
//!
//! A request lives for the duration of exactly one plugin instance and is
//! torn down (temp file removed, connections dropped) when that instance
//! closes. Teardown also happens on drop, so resources are released even if
//! the caller never calls close explicitly.

use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::NdioError;
use crate::config::Config;
use crate::ndimage::MetaMap;

/// I/O direction of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpenMode {
    Read,
    Write,
}

impl OpenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpenMode::Read => "read",
            OpenMode::Write => "write",
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Special device origins, each served by a dedicated backend rather than
/// generic content sniffing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// Webcam by device index (`<video0>`).
    Camera(u32),
    /// Screen capture (`<screen>`).
    Screen,
    /// Clipboard read (`<clipboard>`).
    Clipboard,
}

impl DeviceKind {
    /// Identifier of the backend dedicated to this device.
    pub fn backend_id(&self) -> &'static str {
        match self {
            DeviceKind::Camera(_) | DeviceKind::Screen => "ffmpeg",
            DeviceKind::Clipboard => "clipboard",
        }
    }
}

/// Anything `open()` accepts as an input or output target.
#[non_exhaustive]
pub enum Resource {
    /// Local filesystem path.
    Path(PathBuf),
    /// In-memory encoded bytes (read).
    Bytes(Vec<u8>),
    /// A readable stream. May be read-once; the request buffers the sniff
    /// prefix so the selected backend still sees the full stream.
    Reader(Box<dyn Read + Send>),
    /// A writable sink (write mode).
    Writer(Box<dyn Write + Send>),
    /// Remote URI (`http`, `https`, `ftp`, `ftps`, `file`).
    Uri(String),
    /// `"<bytes>"`: write into memory, retrievable after close.
    ByteSink,
    /// Recognized device token.
    Device(DeviceKind),
    /// Unrecognized `<...>` token; rejected at request construction.
    Special(String),
}

impl From<&str> for Resource {
    fn from(s: &str) -> Self {
        if s.starts_with('<') && s.ends_with('>') {
            return match s {
                "<bytes>" => Resource::ByteSink,
                "<screen>" => Resource::Device(DeviceKind::Screen),
                "<clipboard>" => Resource::Device(DeviceKind::Clipboard),
                _ => s
                    .strip_prefix("<video")
                    .and_then(|rest| rest.strip_suffix('>'))
                    .and_then(|digits| digits.parse::<u32>().ok())
                    .map(|n| Resource::Device(DeviceKind::Camera(n)))
                    .unwrap_or_else(|| Resource::Special(s.to_owned())),
            };
        }
        if s.contains("://") {
            return Resource::Uri(s.to_owned());
        }
        Resource::Path(PathBuf::from(s))
    }
}

impl From<String> for Resource {
    fn from(s: String) -> Self {
        Resource::from(s.as_str())
    }
}

impl From<&Path> for Resource {
    fn from(p: &Path) -> Self {
        Resource::Path(p.to_path_buf())
    }
}

impl From<PathBuf> for Resource {
    fn from(p: PathBuf) -> Self {
        Resource::Path(p)
    }
}

impl From<Vec<u8>> for Resource {
    fn from(b: Vec<u8>) -> Self {
        Resource::Bytes(b)
    }
}

impl From<&[u8]> for Resource {
    fn from(b: &[u8]) -> Self {
        Resource::Bytes(b.to_vec())
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Resource::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Resource::Reader(_) => f.write_str("Reader(..)"),
            Resource::Writer(_) => f.write_str("Writer(..)"),
            Resource::Uri(u) => f.debug_tuple("Uri").field(u).finish(),
            Resource::ByteSink => f.write_str("ByteSink"),
            Resource::Device(d) => f.debug_tuple("Device").field(d).finish(),
            Resource::Special(s) => f.debug_tuple("Special").field(s).finish(),
        }
    }
}

enum Source {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Reader(Box<dyn Read + Send>),
    Remote {
        url: Url,
        conn: Option<Box<dyn Read + Send>>,
    },
    Writer(Box<dyn Write + Send>),
    ByteSink,
    Device(DeviceKind),
}

/// Normalized request: one resource, one direction, one plugin lifetime.
///
/// Immutable once constructed except for the memoized caches (sniff prefix,
/// full content, materialized path), each computed at most once.
pub struct Request {
    source: Source,
    mode: OpenMode,
    identifier: String,
    extension: Option<String>,
    prefix: Vec<u8>,
    prefix_complete: bool,
    content: Option<Vec<u8>>,
    materialized: Option<tempfile::TempPath>,
    timeout: Duration,
    no_internet: bool,
    temp_dir: Option<PathBuf>,
    options: MetaMap,
    sink: Option<Vec<u8>>,
    closed: bool,
}

impl Request {
    /// Normalize a resource for the given direction.
    ///
    /// Fails with [`NdioError::UnsupportedResource`] when the origin type is
    /// unrecognized or makes no sense for the mode (e.g. writing to a byte
    /// buffer input, reading from `"<bytes>"`).
    pub fn new(resource: Resource, mode: OpenMode) -> Result<Self, NdioError> {
        Self::with_config(resource, mode, Config::get())
    }

    pub(crate) fn with_config(
        resource: Resource,
        mode: OpenMode,
        config: &Config,
    ) -> Result<Self, NdioError> {
        let (source, identifier) = match resource {
            Resource::Path(p) => {
                let identifier = p.display().to_string();
                (Source::Path(p), identifier)
            }
            Resource::Bytes(b) => {
                if mode == OpenMode::Write {
                    return Err(NdioError::UnsupportedResource(
                        "cannot write into a byte buffer input; use \"<bytes>\"".into(),
                    ));
                }
                (Source::Bytes(b), "<buffer>".to_owned())
            }
            Resource::Reader(r) => {
                if mode == OpenMode::Write {
                    return Err(NdioError::UnsupportedResource(
                        "cannot write to a reader; pass a writer instead".into(),
                    ));
                }
                (Source::Reader(r), "<reader>".to_owned())
            }
            Resource::Writer(w) => {
                if mode == OpenMode::Read {
                    return Err(NdioError::UnsupportedResource(
                        "cannot read from a writer".into(),
                    ));
                }
                (Source::Writer(w), "<writer>".to_owned())
            }
            Resource::Uri(raw) => {
                let url = Url::parse(&raw)
                    .map_err(|e| NdioError::UnsupportedResource(format!("{raw}: {e}")))?;
                match url.scheme() {
                    "file" => {
                        let path = url.to_file_path().map_err(|()| {
                            NdioError::UnsupportedResource(format!("{raw}: not a local file URL"))
                        })?;
                        let identifier = path.display().to_string();
                        (Source::Path(path), identifier)
                    }
                    "http" | "https" | "ftp" | "ftps" => {
                        if mode == OpenMode::Write {
                            return Err(NdioError::UnsupportedResource(format!(
                                "cannot write to remote resource {raw}"
                            )));
                        }
                        (Source::Remote { url, conn: None }, raw)
                    }
                    other => {
                        return Err(NdioError::UnsupportedResource(format!(
                            "unrecognized URI scheme `{other}`"
                        )));
                    }
                }
            }
            Resource::ByteSink => {
                if mode == OpenMode::Read {
                    return Err(NdioError::UnsupportedResource(
                        "\"<bytes>\" is a write target; pass the bytes themselves to read".into(),
                    ));
                }
                (Source::ByteSink, "<bytes>".to_owned())
            }
            Resource::Device(d) => {
                if mode == OpenMode::Write {
                    return Err(NdioError::UnsupportedResource(format!(
                        "device {d:?} is read-only"
                    )));
                }
                let identifier = match &d {
                    DeviceKind::Camera(n) => format!("<video{n}>"),
                    DeviceKind::Screen => "<screen>".to_owned(),
                    DeviceKind::Clipboard => "<clipboard>".to_owned(),
                };
                (Source::Device(d), identifier)
            }
            Resource::Special(s) => {
                return Err(NdioError::UnsupportedResource(format!(
                    "unrecognized special token {s}"
                )));
            }
        };

        let extension = extension_of(&identifier);
        let sink = matches!(source, Source::ByteSink).then(Vec::new);

        Ok(Self {
            source,
            mode,
            identifier,
            extension,
            prefix: Vec::new(),
            prefix_complete: false,
            content: None,
            materialized: None,
            timeout: config.request_timeout,
            no_internet: config.no_internet,
            temp_dir: config.temp_dir.clone(),
            options: MetaMap::new(),
            sink,
            closed: false,
        })
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Display identifier: path, URL, or a `<...>` marker for anonymous
    /// origins.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Lowercased extension (no dot), from the identifier or an explicit
    /// format hint. Query (`?...`) and fragment (`#...`) suffixes are
    /// stripped before extraction.
    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// Substitute the extension, e.g. from a caller's `format_hint`.
    pub(crate) fn set_extension(&mut self, ext: Option<String>) {
        self.extension = ext;
    }

    /// Device origin, if this request targets one.
    pub fn device(&self) -> Option<&DeviceKind> {
        match &self.source {
            Source::Device(d) => Some(d),
            _ => None,
        }
    }

    /// Local path this request reads from or writes to, when the origin is
    /// already a filesystem path.
    pub fn target_path(&self) -> Option<&Path> {
        match &self.source {
            Source::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Override the network timeout for this request.
    pub(crate) fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Backend-specific options passed through `open()` verbatim. Backends
    /// read what they understand and ignore the rest.
    pub fn options(&self) -> &MetaMap {
        &self.options
    }

    pub(crate) fn set_options(&mut self, options: MetaMap) {
        self.options = options;
    }

    /// Up to `n` leading bytes, without consuming stream state the backend
    /// will need. Memoized; repeated calls are idempotent. For read-once
    /// streams the peeked bytes are buffered and transparently replayed by
    /// [`Request::stream`] and [`Request::bytes`].
    ///
    /// Write-mode requests and device origins have no peekable content and
    /// yield an empty slice.
    pub fn peek_prefix(&mut self, n: usize) -> Result<&[u8], NdioError> {
        if self.mode == OpenMode::Write {
            return Ok(&[]);
        }
        if self.content.is_none() && !(self.prefix_complete || self.prefix.len() >= n) {
            self.fill_prefix(n)?;
        }
        if let Some(content) = &self.content {
            return Ok(&content[..content.len().min(n)]);
        }
        Ok(&self.prefix[..self.prefix.len().min(n)])
    }

    fn fill_prefix(&mut self, n: usize) -> Result<(), NdioError> {
        self.connect_if_remote()?;

        let identifier = self.identifier.clone();
        match &mut self.source {
            Source::Path(path) => {
                let mut file = File::open(&*path)
                    .map_err(|e| NdioError::unavailable(&identifier, e.to_string()))?;
                let mut buf = vec![0u8; n];
                let got = read_up_to(&mut file, &mut buf)?;
                buf.truncate(got);
                self.prefix_complete = got < n;
                self.prefix = buf;
            }
            Source::Bytes(bytes) => {
                let take = bytes.len().min(n);
                self.prefix = bytes[..take].to_vec();
                self.prefix_complete = take == bytes.len();
            }
            Source::Reader(reader) => {
                let missing = n - self.prefix.len();
                let mut buf = vec![0u8; missing];
                let got = read_up_to(reader, &mut buf)?;
                self.prefix.extend_from_slice(&buf[..got]);
                self.prefix_complete = got < missing;
            }
            Source::Remote { conn, .. } => {
                let conn = conn.as_mut().expect("connected above");
                let missing = n - self.prefix.len();
                let mut buf = vec![0u8; missing];
                let got = read_up_to(conn, &mut buf)
                    .map_err(|e| NdioError::unavailable(&identifier, e.to_string()))?;
                self.prefix.extend_from_slice(&buf[..got]);
                self.prefix_complete = got < missing;
            }
            Source::Device(_) | Source::Writer(_) | Source::ByteSink => {
                self.prefix_complete = true;
            }
        }

        Ok(())
    }

    /// Entire resource contents. Memoized.
    ///
    /// Prepends any buffered sniff prefix for stream-backed origins, so a
    /// prior [`Request::peek_prefix`] never costs the backend data.
    pub fn bytes(&mut self) -> Result<&[u8], NdioError> {
        if self.content.is_none() {
            self.connect_if_remote()?;
            let identifier = self.identifier.clone();
            let content = match &mut self.source {
                Source::Path(path) => std::fs::read(&*path)
                    .map_err(|e| NdioError::unavailable(&identifier, e.to_string()))?,
                Source::Bytes(bytes) => bytes.clone(),
                Source::Reader(reader) => {
                    let mut content = std::mem::take(&mut self.prefix);
                    reader.read_to_end(&mut content)?;
                    content
                }
                Source::Remote { conn, .. } => {
                    let conn = conn.as_mut().expect("connected above");
                    let mut content = std::mem::take(&mut self.prefix);
                    conn.read_to_end(&mut content)
                        .map_err(|e| NdioError::unavailable(&identifier, e.to_string()))?;
                    content
                }
                Source::Device(d) => {
                    return Err(NdioError::UnsupportedResource(format!(
                        "device {d:?} has no byte contents"
                    )));
                }
                Source::Writer(_) | Source::ByteSink => {
                    return Err(NdioError::UnsupportedResource(
                        "write target has no byte contents".into(),
                    ));
                }
            };
            // Once the full content is cached, peeks serve from it; the
            // standalone prefix buffer is done.
            self.prefix = Vec::new();
            self.prefix_complete = false;
            self.content = Some(content);
        }
        Ok(self.content.as_deref().expect("content memoized above"))
    }

    /// A readable stream over the resource, with any peeked prefix
    /// transparently prepended. For remote origins this reads incrementally
    /// from the open transfer rather than forcing a full download.
    pub fn stream(&mut self) -> Result<Box<dyn Read + Send + '_>, NdioError> {
        if self.content.is_some() {
            let content = self.content.as_deref().expect("checked above");
            return Ok(Box::new(std::io::Cursor::new(content)));
        }
        self.connect_if_remote()?;

        let replay = self.prefix.clone();
        match &mut self.source {
            Source::Path(path) => {
                let file = File::open(&*path).map_err(|e| {
                    NdioError::unavailable(path.display().to_string(), e.to_string())
                })?;
                Ok(Box::new(file))
            }
            Source::Bytes(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.as_slice()))),
            Source::Reader(reader) => {
                Ok(Box::new(std::io::Cursor::new(replay).chain(reader)))
            }
            Source::Remote { conn, .. } => {
                let conn = conn.as_mut().expect("connected above");
                Ok(Box::new(std::io::Cursor::new(replay).chain(conn)))
            }
            Source::Device(d) => Err(NdioError::UnsupportedResource(format!(
                "device {d:?} has no byte stream"
            ))),
            Source::Writer(_) | Source::ByteSink => Err(NdioError::UnsupportedResource(
                "write target has no byte stream".into(),
            )),
        }
    }

    /// Path to a local copy of the resource.
    ///
    /// Already-local paths are returned unchanged. Anything else is copied
    /// into a process-managed temporary file, registered for removal at
    /// request teardown. Used only by backends that cannot operate on
    /// streams directly.
    pub fn local_path(&mut self) -> Result<&Path, NdioError> {
        if let Source::Path(ref p) = self.source {
            return Ok(p);
        }
        if self.materialized.is_none() {
            if self.mode == OpenMode::Write {
                return Err(NdioError::UnsupportedResource(
                    "cannot materialize a write target".into(),
                ));
            }
            let content = self.bytes()?.to_vec();
            let suffix = self
                .extension
                .as_deref()
                .map(|e| format!(".{e}"))
                .unwrap_or_default();
            let mut builder = tempfile::Builder::new();
            builder.prefix("ndio-").suffix(&suffix);
            let mut file = match &self.temp_dir {
                Some(dir) => builder.tempfile_in(dir)?,
                None => builder.tempfile()?,
            };
            file.write_all(&content)?;
            file.flush()?;
            self.materialized = Some(file.into_temp_path());
        }
        Ok(self.materialized.as_deref().expect("materialized above"))
    }

    /// Deliver the final encoded output to the write target.
    ///
    /// Backends call this from their close path. For `"<bytes>"` sinks the
    /// data becomes retrievable via [`Request::take_result`].
    pub fn write_out(&mut self, data: &[u8]) -> Result<(), NdioError> {
        match &mut self.source {
            Source::Path(path) => std::fs::write(&*path, data).map_err(NdioError::Io),
            Source::Writer(w) => {
                w.write_all(data)?;
                w.flush()?;
                Ok(())
            }
            Source::ByteSink => {
                self.sink
                    .get_or_insert_with(Vec::new)
                    .extend_from_slice(data);
                Ok(())
            }
            _ => Err(NdioError::UnsupportedResource(format!(
                "`{}` is not a write target",
                self.identifier
            ))),
        }
    }

    /// Encoded bytes accumulated by a `"<bytes>"` sink.
    pub fn take_result(&mut self) -> Option<Vec<u8>> {
        self.sink.take().filter(|s| !s.is_empty())
    }

    /// Release everything this request owns: temp file, connections,
    /// stream handles. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.materialized = None; // TempPath removal
        if let Source::Remote { conn, .. } = &mut self.source {
            *conn = None;
        }
        self.content = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Open the remote transfer once, honoring timeout and the no-internet
    /// switch.
    fn connect_if_remote(&mut self) -> Result<(), NdioError> {
        let Source::Remote { url, conn } = &self.source else {
            return Ok(());
        };
        if conn.is_some() {
            return Ok(());
        }
        if self.no_internet {
            return Err(NdioError::unavailable(
                &self.identifier,
                "network access disabled (NDIO_NO_INTERNET)",
            ));
        }
        let new_conn: Box<dyn Read + Send> = match url.scheme() {
            "http" | "https" => {
                let client = reqwest::blocking::Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .map_err(|e| NdioError::unavailable(&self.identifier, e.to_string()))?;
                let response = client
                    .get(url.clone())
                    .send()
                    .and_then(reqwest::blocking::Response::error_for_status)
                    .map_err(|e| NdioError::unavailable(&self.identifier, e.to_string()))?;
                Box::new(response)
            }
            scheme => {
                return Err(NdioError::unavailable(
                    &self.identifier,
                    format!("no transport for `{scheme}` in this build"),
                ));
            }
        };
        if let Source::Remote { conn, .. } = &mut self.source {
            *conn = Some(new_conn);
        }
        Ok(())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("identifier", &self.identifier)
            .field("mode", &self.mode)
            .field("extension", &self.extension)
            .field("prefix_len", &self.prefix.len())
            .field("materialized", &self.materialized.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Read until the buffer is full or EOF; never errors on short input.
fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize, std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Extension from an identifier, with query-like (`?...`) and fragment
/// (`#...`) suffixes stripped first.
fn extension_of(identifier: &str) -> Option<String> {
    let stripped = identifier.split(['?', '#']).next().unwrap_or(identifier);
    let name = stripped.rsplit(['/', '\\']).next().unwrap_or(stripped);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_tokens() {
        assert!(matches!(Resource::from("<bytes>"), Resource::ByteSink));
        assert!(matches!(
            Resource::from("<screen>"),
            Resource::Device(DeviceKind::Screen)
        ));
        assert!(matches!(
            Resource::from("<video2>"),
            Resource::Device(DeviceKind::Camera(2))
        ));
        assert!(matches!(Resource::from("<nonsense>"), Resource::Special(_)));
        assert!(matches!(
            Resource::from("https://example.com/a.png"),
            Resource::Uri(_)
        ));
        assert!(matches!(Resource::from("photo.png"), Resource::Path(_)));
    }

    #[test]
    fn unrecognized_token_rejected() {
        let result = Request::new(Resource::from("<nonsense>"), OpenMode::Read);
        assert!(matches!(result, Err(NdioError::UnsupportedResource(_))));
    }

    #[test]
    fn mode_mismatches_rejected() {
        assert!(matches!(
            Request::new(Resource::from("<bytes>"), OpenMode::Read),
            Err(NdioError::UnsupportedResource(_))
        ));
        assert!(matches!(
            Request::new(Resource::Bytes(vec![1, 2, 3]), OpenMode::Write),
            Err(NdioError::UnsupportedResource(_))
        ));
        assert!(matches!(
            Request::new(Resource::from("<video0>"), OpenMode::Write),
            Err(NdioError::UnsupportedResource(_))
        ));
    }

    #[test]
    fn extension_stripping() {
        assert_eq!(extension_of("photo.PNG"), Some("png".into()));
        assert_eq!(
            extension_of("https://x.test/p.jpg?token=abc"),
            Some("jpg".into())
        );
        assert_eq!(extension_of("archive.gif#frag"), Some("gif".into()));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of(".hidden"), None);
        assert_eq!(extension_of("<buffer>"), None);
    }

    #[test]
    fn unknown_scheme_rejected() {
        let result = Request::new(Resource::from("gopher://example.com/x"), OpenMode::Read);
        assert!(matches!(result, Err(NdioError::UnsupportedResource(_))));
    }

    #[test]
    fn missing_file_is_unavailable_at_peek() {
        let mut request = Request::new(
            Resource::from("/definitely/not/here/photo.png"),
            OpenMode::Read,
        )
        .unwrap();
        let result = request.peek_prefix(16);
        assert!(matches!(result, Err(NdioError::ResourceUnavailable { .. })));
    }

    #[test]
    fn ftp_has_no_transport() {
        let mut request =
            Request::new(Resource::from("ftp://example.com/a.png"), OpenMode::Read).unwrap();
        let result = request.peek_prefix(16);
        assert!(matches!(result, Err(NdioError::ResourceUnavailable { .. })));
    }

    /// Reader that counts how many bytes were pulled from it.
    struct Counted {
        data: std::io::Cursor<Vec<u8>>,
        pulled: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Read for Counted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.data.read(buf)?;
            self.pulled
                .fetch_add(n, std::sync::atomic::Ordering::SeqCst);
            Ok(n)
        }
    }

    #[test]
    fn peek_is_memoized_and_stream_replays() {
        let pulled = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let reader = Counted {
            data: std::io::Cursor::new((0u8..64).collect()),
            pulled: pulled.clone(),
        };
        let mut request = Request::new(Resource::Reader(Box::new(reader)), OpenMode::Read).unwrap();

        assert_eq!(request.peek_prefix(8).unwrap(), &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(request.peek_prefix(8).unwrap().len(), 8);
        // Second peek served from cache, nothing further pulled.
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 8);

        // The backend still sees the full stream, prefix included.
        let mut all = Vec::new();
        request.stream().unwrap().read_to_end(&mut all).unwrap();
        assert_eq!(all, (0u8..64).collect::<Vec<_>>());
    }

    #[test]
    fn bytes_prepends_peeked_prefix() {
        let mut request = Request::new(
            Resource::Reader(Box::new(std::io::Cursor::new(b"GIF89a-trailer".to_vec()))),
            OpenMode::Read,
        )
        .unwrap();
        assert_eq!(request.peek_prefix(6).unwrap(), b"GIF89a");
        assert_eq!(request.bytes().unwrap(), b"GIF89a-trailer");
        // Memoized.
        assert_eq!(request.bytes().unwrap(), b"GIF89a-trailer");
    }

    #[test]
    fn materialize_copies_and_close_removes() {
        let mut request =
            Request::new(Resource::Bytes(b"payload".to_vec()), OpenMode::Read).unwrap();
        let path = request.local_path().unwrap().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");

        // Memoized: same path on second call.
        assert_eq!(request.local_path().unwrap(), path);

        request.close();
        assert!(!path.exists());
        request.close(); // idempotent
    }

    #[test]
    fn local_path_passthrough_for_paths() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut request = Request::new(Resource::from(file.path()), OpenMode::Read).unwrap();
        assert_eq!(request.local_path().unwrap(), file.path());
    }

    #[test]
    fn byte_sink_accumulates() {
        let mut request = Request::new(Resource::from("<bytes>"), OpenMode::Write).unwrap();
        request.write_out(b"abc").unwrap();
        request.write_out(b"def").unwrap();
        assert_eq!(request.take_result().unwrap(), b"abcdef");
        assert!(request.take_result().is_none());
    }

    #[test]
    fn writer_target_receives_output() {
        struct Shared(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut request = Request::new(
            Resource::Writer(Box::new(Shared(buffer.clone()))),
            OpenMode::Write,
        )
        .unwrap();
        request.write_out(b"encoded").unwrap();
        assert_eq!(&*buffer.lock().unwrap(), b"encoded");
    }

    #[test]
    fn write_mode_peek_is_empty() {
        let mut request = Request::new(Resource::from("<bytes>"), OpenMode::Write).unwrap();
        assert!(request.peek_prefix(32).unwrap().is_empty());
    }
}
