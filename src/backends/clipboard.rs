//! Clipboard backend.
//!
//! Serves the `<clipboard>` token, read-only. The system clipboard tool
//! (`wl-paste` on Wayland, `xclip` on X11) hands over the current selection
//! as PNG bytes, which decode through the PNG backend's machinery.
//! Availability is a binary probe, resolved once per process.

use std::process::{Command, Stdio};
use std::sync::OnceLock;

use crate::NdioError;
use crate::backends::png;
use crate::ndimage::{Length, MetaMap, NdImage, Properties};
use crate::plugin::BackendInstance;
use crate::registry::{BackendDescriptor, ModeSet};
use crate::resource::{OpenMode, Request};

pub(crate) const ID: &str = "clipboard";

pub(crate) fn descriptor() -> BackendDescriptor {
    BackendDescriptor::modern(
        ID,
        "clipboard image capture via wl-paste or xclip",
        &[],
        ModeSet::READ,
        availability,
        accepts,
        open,
    )
}

/// The paste tool found on this machine, probed once.
fn tool() -> Result<&'static [&'static str], String> {
    static PROBE: OnceLock<Result<&'static [&'static str], String>> = OnceLock::new();
    PROBE
        .get_or_init(|| {
            const CANDIDATES: &[(&str, &[&str])] = &[
                ("wl-paste", &["wl-paste", "-t", "image/png"]),
                ("xclip", &["xclip", "-selection", "clipboard", "-t", "image/png", "-o"]),
            ];
            for (binary, argv) in CANDIDATES {
                let found = Command::new(binary)
                    .arg("-version")
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .is_ok();
                if found {
                    return Ok(*argv);
                }
            }
            Err("no clipboard tool (wl-paste or xclip) on PATH".into())
        })
        .clone()
}

fn availability() -> Result<(), String> {
    tool().map(|_| ())
}

/// Never claims anything during content sniffing: only the `<clipboard>`
/// token routes here, as an explicit selection.
fn accepts(_ext: Option<&str>, _prefix: &[u8], _mode: OpenMode) -> bool {
    false
}

fn open(request: Request) -> Result<Box<dyn BackendInstance>, NdioError> {
    Ok(Box::new(ClipboardInstance {
        request,
        captured: None,
        cursor: 0,
    }))
}

struct ClipboardInstance {
    request: Request,
    captured: Option<Vec<NdImage>>,
    cursor: usize,
}

impl ClipboardInstance {
    /// Grab the selection once; later reads see the same snapshot.
    fn captured(&mut self) -> Result<&Vec<NdImage>, NdioError> {
        if self.captured.is_none() {
            let argv = tool().map_err(|reason| NdioError::BackendUnavailable {
                id: ID.to_owned(),
                reason,
            })?;
            let output = Command::new(argv[0])
                .args(&argv[1..])
                .stderr(Stdio::null())
                .output()
                .map_err(|e| NdioError::unavailable("<clipboard>", e.to_string()))?;
            if !output.status.success() || output.stdout.is_empty() {
                return Err(NdioError::unavailable(
                    "<clipboard>",
                    "clipboard holds no image data",
                ));
            }
            let (frames, _) = png::decode_all(&output.stdout, "<clipboard>")?;
            self.captured = Some(frames);
        }
        Ok(self.captured.as_ref().expect("captured above"))
    }
}

impl BackendInstance for ClipboardInstance {
    fn id(&self) -> &str {
        ID
    }

    fn request(&self) -> &Request {
        &self.request
    }

    fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    fn len(&mut self) -> Result<Length, NdioError> {
        Ok(Length::Exact(self.captured()?.len()))
    }

    fn read(&mut self, index: usize) -> Result<NdImage, NdioError> {
        let frames = self.captured()?;
        frames
            .get(index)
            .cloned()
            .ok_or_else(|| NdioError::IndexOutOfRange {
                index,
                len: frames.len(),
                identifier: "<clipboard>".to_owned(),
            })
    }

    fn next_element(&mut self) -> Option<Result<NdImage, NdioError>> {
        let cursor = self.cursor;
        let frames = match self.captured() {
            Ok(f) => f,
            Err(e) => return Some(Err(e)),
        };
        let frame = frames.get(cursor).cloned()?;
        self.cursor += 1;
        Some(Ok(frame))
    }

    fn rewind(&mut self) -> Result<bool, NdioError> {
        // The snapshot is held in memory; iteration restarts freely.
        self.cursor = 0;
        Ok(true)
    }

    fn metadata(&mut self, _index: Option<usize>) -> Result<MetaMap, NdioError> {
        let mut meta = MetaMap::new();
        meta.insert("source".into(), serde_json::Value::from("clipboard"));
        Ok(meta)
    }

    fn properties(&mut self, index: Option<usize>) -> Result<Properties, NdioError> {
        let frames = self.captured()?;
        let first = frames.first().ok_or(NdioError::IndexOutOfRange {
            index: index.unwrap_or(0),
            len: 0,
            identifier: "<clipboard>".to_owned(),
        })?;
        Ok(Properties {
            shape: first.shape().to_vec(),
            element_type: first.data.element_type(),
            n_images: Length::Exact(frames.len()),
            is_batch: false,
        })
    }

    fn close(&mut self) -> Result<(), NdioError> {
        self.captured = None;
        Ok(())
    }
}
