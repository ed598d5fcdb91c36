//! Multi-format fallback backend using the image crate.
//!
//! Covers the long tail of still formats (JPEG, GIF, BMP, WebP, TIFF) with
//! one adapter. Content sniffing delegates to `image::guess_format`, so this
//! backend also serves resources with no usable filename at all.

use std::io::Cursor;

use image::AnimationDecoder;

use crate::NdioError;
use crate::ndimage::{Length, MetaMap, NdData, NdImage, Properties};
use crate::plugin::BackendInstance;
use crate::registry::{BackendDescriptor, ModeSet};
use crate::resource::{OpenMode, Request};

pub(crate) const ID: &str = "image";

const READ_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "jfif", "gif", "bmp", "webp", "tif", "tiff",
];
// The image crate has no WebP encoder; JPEG/GIF/BMP/PNG/TIFF write fine.
const WRITE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff"];

pub(crate) fn descriptor() -> BackendDescriptor {
    BackendDescriptor::modern(
        ID,
        "multi-format stills via the image crate",
        READ_EXTENSIONS,
        ModeSet::READ_WRITE,
        availability,
        accepts,
        open,
    )
}

fn availability() -> Result<(), String> {
    Ok(())
}

fn accepts(ext: Option<&str>, prefix: &[u8], mode: OpenMode) -> bool {
    match mode {
        OpenMode::Read => {
            ext.is_some_and(|e| READ_EXTENSIONS.contains(&e))
                || image::guess_format(prefix).is_ok()
        }
        OpenMode::Write => ext.is_some_and(|e| WRITE_EXTENSIONS.contains(&e)),
    }
}

fn open(request: Request) -> Result<Box<dyn BackendInstance>, NdioError> {
    Ok(Box::new(ImageInstance {
        request,
        decoded: None,
        cursor: 0,
        pending: Vec::new(),
    }))
}

struct Decoded {
    frames: Vec<NdImage>,
    container_meta: MetaMap,
}

struct ImageInstance {
    request: Request,
    decoded: Option<Decoded>,
    cursor: usize,
    pending: Vec<NdImage>,
}

impl ImageInstance {
    fn decoded(&mut self) -> Result<&mut Decoded, NdioError> {
        if self.decoded.is_none() {
            let identifier = self.request.identifier().to_owned();
            let data = self.request.bytes()?;

            let format = image::guess_format(data)
                .map_err(|e| NdioError::from_backend(ID, &identifier, e))?;
            let mut container_meta = MetaMap::new();
            container_meta.insert(
                "format".into(),
                serde_json::Value::from(format.extensions_str().first().copied().unwrap_or("?")),
            );

            let frames = if format == image::ImageFormat::Gif {
                decode_gif_frames(data, &identifier)?
            } else {
                let dynamic = image::load_from_memory_with_format(data, format)
                    .map_err(|e| NdioError::from_backend(ID, &identifier, e))?;
                vec![dynamic_to_ndimage(dynamic)]
            };

            self.decoded = Some(Decoded {
                frames,
                container_meta,
            });
        }
        Ok(self.decoded.as_mut().expect("decoded above"))
    }

    fn output_format(&self) -> Result<image::ImageFormat, NdioError> {
        self.request
            .extension()
            .and_then(image::ImageFormat::from_extension)
            .ok_or(NdioError::UnsupportedOperation {
                id: ID.to_owned(),
                detail: "output format unknown; name the file or pass a format hint",
            })
    }
}

impl BackendInstance for ImageInstance {
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
        let frame = match index {
            Some(i) => decoded
                .frames
                .get(i)
                .ok_or_else(|| NdioError::IndexOutOfRange {
                    index: i,
                    len: n,
                    identifier,
                })?,
            None => decoded.frames.first().ok_or(NdioError::IndexOutOfRange {
                index: 0,
                len: 0,
                identifier,
            })?,
        };
        let mut shape = frame.shape().to_vec();
        let is_batch = index.is_none() && n > 1;
        if is_batch {
            shape.insert(0, n);
        }
        Ok(Properties {
            shape,
            element_type: frame.data.element_type(),
            n_images: Length::Exact(n),
            is_batch,
        })
    }

    fn write(&mut self, image: &NdImage) -> Result<(), NdioError> {
        self.pending.push(image.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<(), NdioError> {
        if self.request.mode() != OpenMode::Write || self.pending.is_empty() {
            return Ok(());
        }
        let identifier = self.request.identifier().to_owned();
        let format = self.output_format()?;

        let mut out = Cursor::new(Vec::new());
        if self.pending.len() > 1 {
            if format != image::ImageFormat::Gif {
                return Err(NdioError::UnsupportedOperation {
                    id: ID.to_owned(),
                    detail: "multi-element output is only supported for GIF",
                });
            }
            encode_gif_frames(&self.pending, &mut out, &identifier)?;
        } else {
            let mut dynamic = ndimage_to_dynamic(&self.pending[0])?;
            if format == image::ImageFormat::Jpeg {
                // JPEG has no alpha channel.
                dynamic = image::DynamicImage::ImageRgb8(dynamic.to_rgb8());
            }
            dynamic
                .write_to(&mut out, format)
                .map_err(|e| NdioError::from_backend(ID, &identifier, e))?;
        }

        self.request.write_out(&out.into_inner())?;
        self.pending.clear();
        Ok(())
    }
}

fn decode_gif_frames(data: &[u8], identifier: &str) -> Result<Vec<NdImage>, NdioError> {
    let decoder = image::codecs::gif::GifDecoder::new(Cursor::new(data))
        .map_err(|e| NdioError::from_backend(ID, identifier, e))?;
    let frames = decoder
        .into_frames()
        .collect_frames()
        .map_err(|e| NdioError::from_backend(ID, identifier, e))?;

    Ok(frames
        .into_iter()
        .map(|frame| {
            let (numer, denom) = frame.delay().numer_denom_ms();
            let buffer = frame.into_buffer();
            let (width, height) = buffer.dimensions();
            let mut image = NdImage::from_u8(
                &[height as usize, width as usize, 4],
                buffer.into_raw(),
            )
            .expect("RGBA buffer matches its own dimensions");
            image.meta.insert(
                "duration_ms".into(),
                serde_json::Value::from(f64::from(numer) / f64::from(denom.max(1))),
            );
            image
        })
        .collect())
}

fn encode_gif_frames(
    frames: &[NdImage],
    out: &mut Cursor<Vec<u8>>,
    identifier: &str,
) -> Result<(), NdioError> {
    let mut encoder = image::codecs::gif::GifEncoder::new(out);
    encoder
        .set_repeat(image::codecs::gif::Repeat::Infinite)
        .map_err(|e| NdioError::from_backend(ID, identifier, e))?;
    for frame in frames {
        let rgba = ndimage_to_dynamic(frame)?.to_rgba8();
        encoder
            .encode_frame(image::Frame::new(rgba))
            .map_err(|e| NdioError::from_backend(ID, identifier, e))?;
    }
    Ok(())
}

fn dynamic_to_ndimage(dynamic: image::DynamicImage) -> NdImage {
    use image::DynamicImage as D;
    let (width, height) = (dynamic.width() as usize, dynamic.height() as usize);
    match dynamic {
        D::ImageLuma8(b) => NdImage::from_u8(&[height, width], b.into_raw()),
        D::ImageLumaA8(b) => NdImage::from_u8(&[height, width, 2], b.into_raw()),
        D::ImageRgb8(b) => NdImage::from_u8(&[height, width, 3], b.into_raw()),
        D::ImageRgba8(b) => NdImage::from_u8(&[height, width, 4], b.into_raw()),
        D::ImageLuma16(b) => NdImage::from_u16(&[height, width], b.into_raw()),
        D::ImageLumaA16(b) => NdImage::from_u16(&[height, width, 2], b.into_raw()),
        D::ImageRgb16(b) => NdImage::from_u16(&[height, width, 3], b.into_raw()),
        D::ImageRgba16(b) => NdImage::from_u16(&[height, width, 4], b.into_raw()),
        other => {
            // Float formats collapse to 8-bit RGB.
            let rgb = other.to_rgb8();
            NdImage::from_u8(&[height, width, 3], rgb.into_raw())
        }
    }
    .expect("decoded buffer matches its own dimensions")
}

fn ndimage_to_dynamic(image: &NdImage) -> Result<image::DynamicImage, NdioError> {
    let shape = image.shape();
    let (height, width, channels) = match *shape {
        [h, w] => (h, w, 1),
        [h, w, c @ 1..=4] => (h, w, c),
        _ => {
            return Err(NdioError::UnsupportedOperation {
                id: ID.to_owned(),
                detail: "output elements must be [h, w] or [h, w, channels<=4]",
            });
        }
    };
    let (w, h) = (width as u32, height as u32);

    let dynamic = match &image.data {
        NdData::U8(a) => {
            let raw: Vec<u8> = a.iter().copied().collect();
            match channels {
                1 => image::GrayImage::from_raw(w, h, raw).map(image::DynamicImage::ImageLuma8),
                2 => image::ImageBuffer::from_raw(w, h, raw)
                    .map(image::DynamicImage::ImageLumaA8),
                3 => image::RgbImage::from_raw(w, h, raw).map(image::DynamicImage::ImageRgb8),
                _ => image::RgbaImage::from_raw(w, h, raw).map(image::DynamicImage::ImageRgba8),
            }
        }
        NdData::U16(a) => {
            let raw: Vec<u16> = a.iter().copied().collect();
            match channels {
                1 => image::ImageBuffer::from_raw(w, h, raw)
                    .map(image::DynamicImage::ImageLuma16),
                2 => image::ImageBuffer::from_raw(w, h, raw)
                    .map(image::DynamicImage::ImageLumaA16),
                3 => image::ImageBuffer::from_raw(w, h, raw)
                    .map(image::DynamicImage::ImageRgb16),
                _ => image::ImageBuffer::from_raw(w, h, raw)
                    .map(image::DynamicImage::ImageRgba16),
            }
        }
    };

    dynamic.ok_or(NdioError::UnsupportedOperation {
        id: ID.to_owned(),
        detail: "element buffer does not match its declared shape",
    })
}
