//! Subprocess video backend.
//!
//! Drives an external `ffmpeg` binary over pipes: container video files
//! (`mp4`, `mkv`, `mov`, `avi`, `webm`) decode as unbounded streams of
//! RGB24 frames, and the `<screen>` / `<videoN>` device tokens map here for
//! live capture. Availability is a one-time binary probe, the subprocess
//! rendition of "underlying library not installed".
//!
//! The child process is killed on close and on drop, whichever comes first;
//! a caller that stops pulling frames and closes the plugin cancels a live
//! capture with nothing left running.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock, mpsc};
use std::time::Duration;

use log::debug;

use crate::NdioError;
use crate::ndimage::{ElementType, Length, MetaMap, NdData, NdImage, Properties};
use crate::plugin::BackendInstance;
use crate::registry::{BackendDescriptor, ModeSet};
use crate::resource::{DeviceKind, OpenMode, Request};

pub(crate) const ID: &str = "ffmpeg";

const EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "webm"];

/// How long to wait for ffmpeg to report the stream geometry.
const GEOMETRY_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) fn descriptor() -> BackendDescriptor {
    BackendDescriptor::modern(
        ID,
        "container video and live devices via the ffmpeg binary",
        EXTENSIONS,
        ModeSet::READ_WRITE,
        availability,
        accepts,
        open,
    )
}

fn availability() -> Result<(), String> {
    static PROBE: OnceLock<Result<(), String>> = OnceLock::new();
    PROBE
        .get_or_init(|| {
            match Command::new("ffmpeg")
                .arg("-version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
            {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(format!("ffmpeg probe exited with {status}")),
                Err(e) => Err(format!("ffmpeg not found on PATH: {e}")),
            }
        })
        .clone()
}

fn accepts(ext: Option<&str>, prefix: &[u8], mode: OpenMode) -> bool {
    let ext_match = ext.is_some_and(|e| EXTENSIONS.contains(&e));
    match mode {
        // ISOBMFF containers carry an `ftyp` box right after the size word.
        OpenMode::Read => ext_match || (prefix.len() >= 12 && &prefix[4..8] == b"ftyp"),
        OpenMode::Write => ext_match,
    }
}

fn open(request: Request) -> Result<Box<dyn BackendInstance>, NdioError> {
    Ok(Box::new(FfmpegInstance {
        request,
        stream: None,
        cursor: 0,
        encoder: None,
        closed: false,
    }))
}

struct FfmpegInstance {
    request: Request,
    stream: Option<Stream>,
    cursor: usize,
    encoder: Option<Encoder>,
    closed: bool,
}

impl FfmpegInstance {
    fn stream(&mut self) -> Result<&mut Stream, NdioError> {
        if self.stream.is_none() {
            let identifier = self.request.identifier().to_owned();
            let input = input_args(&mut self.request)?;
            self.stream = Some(Stream::spawn(&input, &identifier)?);
        }
        Ok(self.stream.as_mut().expect("spawned above"))
    }

    fn is_live(&self) -> bool {
        self.request.device().is_some()
    }
}

impl BackendInstance for FfmpegInstance {
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
        // Frame counts are unknown without a full demux; live sources have
        // none at all.
        Ok(Length::Unbounded)
    }

    fn read(&mut self, index: usize) -> Result<NdImage, NdioError> {
        if index < self.cursor && !self.rewind()? {
            return Err(NdioError::UnsupportedOperation {
                id: ID.to_owned(),
                detail: "seeking backwards on a live stream",
            });
        }
        loop {
            match self.next_element() {
                Some(Ok(frame)) => {
                    if self.cursor - 1 == index {
                        return Ok(frame);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(NdioError::IndexOutOfRange {
                        index,
                        len: self.cursor,
                        identifier: self.request.identifier().to_owned(),
                    });
                }
            }
        }
    }

    fn next_element(&mut self) -> Option<Result<NdImage, NdioError>> {
        let stream = match self.stream() {
            Ok(s) => s,
            Err(e) => return Some(Err(e)),
        };
        let frame = stream.next_frame()?;
        if frame.is_ok() {
            self.cursor += 1;
        }
        Some(frame)
    }

    fn rewind(&mut self) -> Result<bool, NdioError> {
        if self.is_live() {
            return Ok(false);
        }
        self.stream = None; // kills the child via Drop
        self.cursor = 0;
        Ok(true)
    }

    fn metadata(&mut self, index: Option<usize>) -> Result<MetaMap, NdioError> {
        let mut meta = MetaMap::new();
        if index.is_none() {
            let stream = self.stream()?;
            meta.insert("width".into(), serde_json::Value::from(stream.width));
            meta.insert("height".into(), serde_json::Value::from(stream.height));
            meta.insert("pix_fmt".into(), serde_json::Value::from("rgb24"));
        }
        Ok(meta)
    }

    fn properties(&mut self, index: Option<usize>) -> Result<Properties, NdioError> {
        let is_batch = index.is_none();
        let stream = self.stream()?;
        Ok(Properties {
            shape: vec![stream.height, stream.width, 3],
            element_type: ElementType::U8,
            n_images: Length::Unbounded,
            is_batch,
        })
    }

    fn write(&mut self, image: &NdImage) -> Result<(), NdioError> {
        let (height, width) = match (image.shape(), &image.data) {
            ([h, w, 3], NdData::U8(_)) => (*h, *w),
            _ => {
                return Err(NdioError::UnsupportedOperation {
                    id: ID.to_owned(),
                    detail: "video frames must be 8-bit [h, w, 3]",
                });
            }
        };
        if self.encoder.is_none() {
            self.encoder = Some(Encoder::spawn(&mut self.request, width, height)?);
        }
        let encoder = self.encoder.as_mut().expect("spawned above");
        if (width, height) != (encoder.width, encoder.height) {
            return Err(NdioError::UnsupportedOperation {
                id: ID.to_owned(),
                detail: "all frames of one video must share dimensions",
            });
        }
        encoder.push(&image.data)
    }

    fn close(&mut self) -> Result<(), NdioError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream = None;
        if let Some(encoder) = self.encoder.take() {
            encoder.finish(&mut self.request)?;
        }
        Ok(())
    }
}

/// Input arguments for decode: a demuxer per device, or a materialized file.
fn input_args(request: &mut Request) -> Result<Vec<String>, NdioError> {
    if let Some(device) = request.device() {
        return match device {
            DeviceKind::Camera(n) => Ok(vec![
                "-f".into(),
                "v4l2".into(),
                "-i".into(),
                format!("/dev/video{n}"),
            ]),
            DeviceKind::Screen => {
                let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0.0".into());
                Ok(vec!["-f".into(), "x11grab".into(), "-i".into(), display])
            }
            DeviceKind::Clipboard => Err(NdioError::UnsupportedResource(
                "clipboard is not an ffmpeg source".into(),
            )),
        };
    }
    let path = request.local_path()?;
    Ok(vec!["-i".into(), path.display().to_string()])
}

/// A running decode: rawvideo RGB24 frames on stdout.
struct Stream {
    child: Child,
    stdout: ChildStdout,
    width: usize,
    height: usize,
}

impl Stream {
    fn spawn(input: &[String], identifier: &str) -> Result<Self, NdioError> {
        let mut command = Command::new("ffmpeg");
        command.args(["-hide_banner", "-nostdin"]);
        command.args(input);
        command.args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"]);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("spawning decode for `{identifier}`");

        let mut child = command.spawn().map_err(|e| NdioError::BackendUnavailable {
            id: ID.to_owned(),
            reason: e.to_string(),
        })?;
        let stderr = child.stderr.take().expect("stderr piped");
        let stdout = child.stdout.take().expect("stdout piped");

        // ffmpeg reports stream geometry on stderr before the first frame.
        // A thread scans for it and keeps draining so the child never
        // blocks on a full stderr pipe.
        let (tx, rx) = mpsc::channel();
        let tail = Arc::new(Mutex::new(Vec::<String>::new()));
        let thread_tail = tail.clone();
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                if line.contains(" Video:")
                    && let Some(dims) = parse_geometry(&line)
                {
                    let _ = tx.send(dims);
                }
                if let Ok(mut tail) = thread_tail.lock() {
                    if tail.len() >= 32 {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
        });

        match rx.recv_timeout(GEOMETRY_TIMEOUT) {
            Ok((width, height)) => Ok(Self {
                child,
                stdout,
                width: width as usize,
                height: height as usize,
            }),
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                let reason = tail
                    .lock()
                    .map(|t| t.join("\n"))
                    .unwrap_or_default();
                Err(NdioError::from_backend(
                    ID,
                    identifier,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("no video stream found:\n{reason}"),
                    ),
                ))
            }
        }
    }

    fn next_frame(&mut self) -> Option<Result<NdImage, NdioError>> {
        let mut buf = vec![0u8; self.width * self.height * 3];
        let mut filled = 0;
        while filled < buf.len() {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(NdioError::Io(e))),
            }
        }
        if filled == 0 {
            return None; // clean end of stream
        }
        if filled < buf.len() {
            return Some(Err(NdioError::from_backend(
                ID,
                "video stream",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated frame"),
            )));
        }
        Some(Ok(NdImage::from_u8(&[self.height, self.width, 3], buf)
            .expect("frame buffer matches geometry")))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A running encode: rawvideo RGB24 frames in on stdin, container out.
struct Encoder {
    child: Child,
    stdin: Option<ChildStdin>,
    out_path: PathBuf,
    staging: Option<tempfile::TempPath>,
    width: usize,
    height: usize,
}

impl Encoder {
    fn spawn(request: &mut Request, width: usize, height: usize) -> Result<Self, NdioError> {
        let ext = request.extension().unwrap_or("mp4").to_owned();
        let (out_path, staging) = match request.target_path() {
            Some(p) => (p.to_path_buf(), None),
            None => {
                let staging = tempfile::Builder::new()
                    .prefix("ndio-")
                    .suffix(&format!(".{ext}"))
                    .tempfile()?
                    .into_temp_path();
                (staging.to_path_buf(), Some(staging))
            }
        };

        let fps = request
            .options()
            .get("fps")
            .and_then(serde_json::Value::as_f64)
            .filter(|fps| *fps > 0.0)
            .unwrap_or(25.0);

        let mut command = Command::new("ffmpeg");
        command.args(["-hide_banner", "-y"]);
        command.args([
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
            &format!("{width}x{height}"),
            "-r",
            &format!("{fps}"),
            "-i",
            "pipe:0",
        ]);
        command.arg(&out_path);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|e| NdioError::BackendUnavailable {
            id: ID.to_owned(),
            reason: e.to_string(),
        })?;
        let stdin = child.stdin.take().expect("stdin piped");

        Ok(Self {
            child,
            stdin: Some(stdin),
            out_path,
            staging,
            width,
            height,
        })
    }

    fn push(&mut self, data: &NdData) -> Result<(), NdioError> {
        let NdData::U8(array) = data else {
            unreachable!("caller validated the element type");
        };
        let bytes: Vec<u8> = array.iter().copied().collect();
        let stdin = self.stdin.as_mut().expect("open until finish");
        stdin.write_all(&bytes).map_err(NdioError::Io)
    }

    fn finish(mut self, request: &mut Request) -> Result<(), NdioError> {
        drop(self.stdin.take()); // EOF lets ffmpeg finalize the container
        let status = self.child.wait().map_err(NdioError::Io)?;
        if !status.success() {
            return Err(NdioError::from_backend(
                ID,
                request.identifier(),
                std::io::Error::other(format!("ffmpeg encode exited with {status}")),
            ));
        }
        if self.staging.is_some() {
            let encoded = std::fs::read(&self.out_path)?;
            request.write_out(&encoded)?;
        }
        Ok(())
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Pull `WxH` out of an ffmpeg stream description line.
fn parse_geometry(line: &str) -> Option<(u32, u32)> {
    for token in line.split([' ', ',']) {
        if let Some((w, h)) = token.split_once('x')
            && let (Ok(w), Ok(h)) = (w.parse::<u32>(), h.parse::<u32>())
            && w > 0
            && h > 0
        {
            return Some((w, h));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;

    #[test]
    fn accepts_video_extensions_and_ftyp() {
        assert!(accepts(Some("mp4"), &[], OpenMode::Read));
        assert!(accepts(Some("mkv"), &[], OpenMode::Write));
        assert!(accepts(
            None,
            b"\x00\x00\x00\x18ftypisom\x00\x00\x02\x00",
            OpenMode::Read
        ));
        assert!(!accepts(Some("png"), &[], OpenMode::Read));
        assert!(!accepts(None, b"GIF89a", OpenMode::Read));
    }

    #[test]
    fn geometry_parsing() {
        let line = "    Stream #0:0: Video: rawvideo (RGB[24] / 0x18424752), rgb24, 64x48, 921 kb/s, 25 tbr, 25 tbn";
        assert_eq!(parse_geometry(line), Some((64, 48)));
        assert_eq!(parse_geometry("no geometry here"), None);
        // Hex junk must not parse as dimensions.
        assert_eq!(parse_geometry("flags 0x18424752"), None);
    }

    /// Full write-then-read pass through a real ffmpeg binary. Skipped on
    /// machines without one.
    #[test]
    fn file_roundtrip_when_ffmpeg_present() {
        if availability().is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");

        // Write four solid frames.
        {
            let request = Request::new(Resource::from(path.as_path()), OpenMode::Write).unwrap();
            let mut instance = FfmpegInstance {
                request,
                stream: None,
                cursor: 0,
                encoder: None,
                closed: false,
            };
            for shade in [0u8, 80, 160, 240] {
                let frame = NdImage::from_u8(&[32, 32, 3], vec![shade; 32 * 32 * 3]).unwrap();
                instance.write(&frame).unwrap();
            }
            instance.close().unwrap();
        }
        assert!(path.exists());

        // Read them back: geometry and frame count survive the container.
        let request = Request::new(Resource::from(path.as_path()), OpenMode::Read).unwrap();
        let mut instance = FfmpegInstance {
            request,
            stream: None,
            cursor: 0,
            encoder: None,
            closed: false,
        };
        assert_eq!(instance.len().unwrap(), Length::Unbounded);

        let mut frames = 0;
        while let Some(frame) = instance.next_element() {
            let frame = frame.unwrap();
            assert_eq!(frame.shape(), &[32, 32, 3]);
            frames += 1;
        }
        assert_eq!(frames, 4);
        instance.close().unwrap();
        instance.close().unwrap(); // idempotent, child already gone
    }

    #[test]
    fn frame_shape_is_validated() {
        let request = Request::new(Resource::from("<bytes>"), OpenMode::Write).unwrap();
        let mut instance = FfmpegInstance {
            request,
            stream: None,
            cursor: 0,
            encoder: None,
            closed: false,
        };
        let gray = NdImage::from_u8(&[4, 4], vec![0; 16]).unwrap();
        assert!(matches!(
            instance.write(&gray),
            Err(NdioError::UnsupportedOperation { .. })
        ));
    }
}
