//! PNG backend using the png crate.
//!
//! Reads stills and APNG animations, writes 8/16-bit gray/RGB(A) output.
//! Container-level metadata maps to tEXt chunks: string values are written,
//! anything else is ignored (metadata is best-effort, not contractual).

use std::io::Cursor;

use crate::NdioError;
use crate::ndimage::{ElementType, Length, MetaMap, NdData, NdImage, Properties};
use crate::plugin::BackendInstance;
use crate::registry::{BackendDescriptor, ModeSet};
use crate::resource::{OpenMode, Request};

pub(crate) const ID: &str = "png";

const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

pub(crate) fn descriptor() -> BackendDescriptor {
    BackendDescriptor::modern(
        ID,
        "PNG stills and APNG animations via the png crate",
        &["png", "apng"],
        ModeSet::READ_WRITE,
        availability,
        accepts,
        open,
    )
}

fn availability() -> Result<(), String> {
    Ok(()) // pure Rust, always usable when compiled in
}

fn accepts(ext: Option<&str>, prefix: &[u8], mode: OpenMode) -> bool {
    let ext_match = matches!(ext, Some("png" | "apng"));
    match mode {
        OpenMode::Read => ext_match || prefix.starts_with(&SIGNATURE),
        OpenMode::Write => ext_match,
    }
}

fn open(request: Request) -> Result<Box<dyn BackendInstance>, NdioError> {
    Ok(Box::new(PngInstance {
        request,
        decoded: None,
        cursor: 0,
        pending: Vec::new(),
        global_meta: MetaMap::new(),
    }))
}

struct Decoded {
    frames: Vec<NdImage>,
    container_meta: MetaMap,
}

struct PngInstance {
    request: Request,
    decoded: Option<Decoded>,
    cursor: usize,
    pending: Vec<NdImage>,
    global_meta: MetaMap,
}

impl PngInstance {
    fn decoded(&mut self) -> Result<&mut Decoded, NdioError> {
        if self.decoded.is_none() {
            let identifier = self.request.identifier().to_owned();
            let data = self.request.bytes()?;
            let (frames, container_meta) = decode_all(data, &identifier)?;
            self.decoded = Some(Decoded {
                frames,
                container_meta,
            });
        }
        Ok(self.decoded.as_mut().expect("decoded above"))
    }
}

impl BackendInstance for PngInstance {
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
        Ok(Length::Exact(self.decoded()?.frames.len()))
    }

    fn read(&mut self, index: usize) -> Result<NdImage, NdioError> {
        let identifier = self.request.identifier().to_owned();
        let decoded = self.decoded()?;
        decoded
            .frames
            .get(index)
            .cloned()
            .ok_or_else(|| NdioError::IndexOutOfRange {
                index,
                len: decoded.frames.len(),
                identifier,
            })
    }

    fn next_element(&mut self) -> Option<Result<NdImage, NdioError>> {
        let cursor = self.cursor;
        let decoded = match self.decoded() {
            Ok(d) => d,
            Err(e) => return Some(Err(e)),
        };
        let frame = decoded.frames.get(cursor).cloned()?;
        self.cursor += 1;
        Some(Ok(frame))
    }

    fn rewind(&mut self) -> Result<bool, NdioError> {
        self.cursor = 0;
        Ok(true)
    }

    fn metadata(&mut self, index: Option<usize>) -> Result<MetaMap, NdioError> {
        let identifier = self.request.identifier().to_owned();
        let decoded = self.decoded()?;
        match index {
            None => Ok(decoded.container_meta.clone()),
            Some(i) => decoded
                .frames
                .get(i)
                .map(|f| f.meta.clone())
                .ok_or_else(|| NdioError::IndexOutOfRange {
                    index: i,
                    len: decoded.frames.len(),
                    identifier,
                }),
        }
    }

    fn properties(&mut self, index: Option<usize>) -> Result<Properties, NdioError> {
        let identifier = self.request.identifier().to_owned();
        let decoded = self.decoded()?;
        let n = decoded.frames.len();
        match index {
            Some(i) => {
                let frame = decoded
                    .frames
                    .get(i)
                    .ok_or_else(|| NdioError::IndexOutOfRange {
                        index: i,
                        len: n,
                        identifier,
                    })?;
                Ok(Properties {
                    shape: frame.shape().to_vec(),
                    element_type: frame.data.element_type(),
                    n_images: Length::Exact(n),
                    is_batch: false,
                })
            }
            None => {
                let first = decoded.frames.first().ok_or(NdioError::IndexOutOfRange {
                    index: 0,
                    len: 0,
                    identifier,
                })?;
                let mut shape = first.shape().to_vec();
                if n > 1 {
                    shape.insert(0, n);
                }
                Ok(Properties {
                    shape,
                    element_type: first.data.element_type(),
                    n_images: Length::Exact(n),
                    is_batch: n > 1,
                })
            }
        }
    }

    fn write(&mut self, image: &NdImage) -> Result<(), NdioError> {
        self.pending.push(image.clone());
        Ok(())
    }

    fn set_global_metadata(&mut self, meta: &MetaMap) -> Result<(), NdioError> {
        self.global_meta = meta.clone();
        Ok(())
    }

    fn close(&mut self) -> Result<(), NdioError> {
        if self.request.mode() == OpenMode::Write && !self.pending.is_empty() {
            let identifier = self.request.identifier().to_owned();
            let encoded = encode_all(&self.pending, &self.global_meta, &identifier)?;
            self.request.write_out(&encoded)?;
            self.pending.clear();
        }
        Ok(())
    }
}

/// Decode every frame plus container metadata (text chunks).
///
/// Shared with the clipboard backend, whose captures arrive as PNG bytes.
pub(crate) fn decode_all(
    data: &[u8],
    identifier: &str,
) -> Result<(Vec<NdImage>, MetaMap), NdioError> {
    let decoder = png::Decoder::new(Cursor::new(data));
    let mut reader = decoder
        .read_info()
        .map_err(|e| NdioError::from_backend(ID, identifier, e))?;

    let info = reader.info();
    let num_frames = info
        .animation_control
        .as_ref()
        .map_or(1, |actl| actl.num_frames.max(1)) as usize;

    let mut container_meta = MetaMap::new();
    for chunk in &info.uncompressed_latin1_text {
        container_meta.insert(
            chunk.keyword.clone(),
            serde_json::Value::from(chunk.text.clone()),
        );
    }
    for chunk in &info.utf8_text {
        if let Ok(text) = chunk.get_text() {
            container_meta.insert(chunk.keyword.clone(), serde_json::Value::from(text));
        }
    }

    let buffer_size = reader.output_buffer_size().ok_or_else(|| {
        NdioError::from_backend(
            ID,
            identifier,
            std::io::Error::new(std::io::ErrorKind::InvalidData, "output buffer overflow"),
        )
    })?;

    let mut frames = Vec::with_capacity(num_frames);
    for frame_no in 0..num_frames {
        let mut raw = vec![0u8; buffer_size];
        let out = match reader.next_frame(&mut raw) {
            Ok(out) => out,
            // Animation shorter than advertised: stop at what exists.
            Err(png::DecodingError::Parameter(_)) if frame_no > 0 => break,
            Err(e) => return Err(NdioError::from_backend(ID, identifier, e)),
        };
        raw.truncate(out.buffer_size());

        let width = out.width as usize;
        let height = out.height as usize;
        let channels = match out.color_type {
            png::ColorType::Grayscale => 1,
            png::ColorType::GrayscaleAlpha => 2,
            // Indexed data is expanded by the decoder's default transforms.
            png::ColorType::Rgb | png::ColorType::Indexed => 3,
            png::ColorType::Rgba => 4,
        };
        let shape: Vec<usize> = if channels == 1 {
            vec![height, width]
        } else {
            vec![height, width, channels]
        };

        let image = match out.bit_depth {
            png::BitDepth::Sixteen => {
                let words: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .collect();
                NdImage::from_u16(&shape, words)
            }
            _ => NdImage::from_u8(&shape, raw),
        };
        let image = image.ok_or_else(|| {
            NdioError::from_backend(
                ID,
                identifier,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "frame size mismatch"),
            )
        })?;
        frames.push(image.with_meta(container_meta.clone()));
    }

    Ok((frames, container_meta))
}

/// Encode frames into one PNG (animated when more than one frame).
fn encode_all(
    frames: &[NdImage],
    global_meta: &MetaMap,
    identifier: &str,
) -> Result<Vec<u8>, NdioError> {
    let first = frames.first().expect("caller checks for pending frames");
    let shape = first.shape();
    let (height, width, channels) = match *shape {
        [h, w] => (h, w, 1),
        [h, w, c @ 1..=4] => (h, w, c),
        _ => {
            return Err(NdioError::UnsupportedOperation {
                id: ID.to_owned(),
                detail: "PNG output needs [h, w] or [h, w, channels<=4] elements",
            });
        }
    };
    let color = match channels {
        1 => png::ColorType::Grayscale,
        2 => png::ColorType::GrayscaleAlpha,
        3 => png::ColorType::Rgb,
        _ => png::ColorType::Rgba,
    };
    let depth = match first.data.element_type() {
        ElementType::U8 => png::BitDepth::Eight,
        ElementType::U16 => png::BitDepth::Sixteen,
    };

    for frame in frames {
        if frame.shape() != shape || frame.data.element_type() != first.data.element_type() {
            return Err(NdioError::UnsupportedOperation {
                id: ID.to_owned(),
                detail: "all elements of one PNG output must share shape and type",
            });
        }
    }

    let mut out = Vec::new();
    let mut encoder = png::Encoder::new(&mut out, width as u32, height as u32);
    encoder.set_color(color);
    encoder.set_depth(depth);
    for (keyword, value) in global_meta {
        // Best-effort: only string values have a tEXt representation.
        if let Some(text) = value.as_str() {
            let _ = encoder.add_text_chunk(keyword.clone(), text.to_owned());
        }
    }
    if frames.len() > 1 {
        encoder
            .set_animated(frames.len() as u32, 0)
            .map_err(|e| NdioError::from_backend(ID, identifier, e))?;
    }

    let mut writer = encoder
        .write_header()
        .map_err(|e| NdioError::from_backend(ID, identifier, e))?;
    for frame in frames {
        let bytes = frame_bytes(&frame.data);
        writer
            .write_image_data(&bytes)
            .map_err(|e| NdioError::from_backend(ID, identifier, e))?;
    }
    writer
        .finish()
        .map_err(|e| NdioError::from_backend(ID, identifier, e))?;

    Ok(out)
}

/// Flatten an element into PNG wire bytes (16-bit is big-endian).
fn frame_bytes(data: &NdData) -> Vec<u8> {
    match data {
        NdData::U8(a) => a.iter().copied().collect(),
        NdData::U16(a) => a.iter().flat_map(|v| v.to_be_bytes()).collect(),
    }
}
