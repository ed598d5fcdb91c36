//! Multi-page TIFF backend using the tiff crate.
//!
//! This is a legacy-style backend: it exposes a format object with separate
//! reader/writer construction and `can_read`/`can_write` predicates, and is
//! driven through [`LegacyAdapter`](crate::legacy::LegacyAdapter). Multi-page
//! files read as element sequences; `read(None)` stacks them into a volume.

use std::io::Cursor;

use crate::NdioError;
use crate::legacy::{LegacyFormat, LegacyReader, LegacyWriter};
use crate::ndimage::{Length, MetaMap, NdData, NdImage};
use crate::registry::{BackendDescriptor, ModeSet};
use crate::resource::{OpenMode, Request};
use crate::resolve::SNIFF_LEN;

pub(crate) const ID: &str = "tiff";

pub(crate) fn descriptor() -> BackendDescriptor {
    BackendDescriptor::legacy(
        ID,
        "multi-page TIFF stacks via the tiff crate",
        &["tif", "tiff"],
        ModeSet::READ_WRITE,
        availability,
        accepts,
        || Box::new(TiffFormat),
    )
}

fn availability() -> Result<(), String> {
    Ok(())
}

fn is_tiff_magic(prefix: &[u8]) -> bool {
    prefix.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || prefix.starts_with(&[0x4D, 0x4D, 0x00, 0x2A])
}

fn accepts(ext: Option<&str>, prefix: &[u8], mode: OpenMode) -> bool {
    let ext_match = matches!(ext, Some("tif" | "tiff"));
    match mode {
        OpenMode::Read => ext_match || is_tiff_magic(prefix),
        OpenMode::Write => ext_match,
    }
}

/// Legacy format object.
pub struct TiffFormat;

impl LegacyFormat for TiffFormat {
    fn id(&self) -> &'static str {
        ID
    }

    fn can_read(&self, request: &mut Request) -> bool {
        let prefix = request.peek_prefix(SNIFF_LEN).unwrap_or(&[]);
        is_tiff_magic(prefix) || matches!(request.extension(), Some("tif" | "tiff"))
    }

    fn can_write(&self, request: &mut Request) -> bool {
        matches!(request.extension(), Some("tif" | "tiff"))
    }

    fn reader(&self, request: &mut Request) -> Result<Box<dyn LegacyReader>, NdioError> {
        let identifier = request.identifier().to_owned();
        let data = request.bytes()?;
        let pages = decode_pages(data, &identifier)?;
        Ok(Box::new(TiffReader { pages, identifier }))
    }

    fn writer(&self, _request: &mut Request) -> Result<Box<dyn LegacyWriter>, NdioError> {
        Ok(Box::new(TiffWriter {
            pending: Vec::new(),
        }))
    }
}

struct TiffReader {
    pages: Vec<NdImage>,
    identifier: String,
}

impl LegacyReader for TiffReader {
    fn len(&mut self) -> Result<Length, NdioError> {
        Ok(Length::Exact(self.pages.len()))
    }

    fn get_data(&mut self, index: usize) -> Result<NdImage, NdioError> {
        self.pages
            .get(index)
            .cloned()
            .ok_or_else(|| NdioError::IndexOutOfRange {
                index,
                len: self.pages.len(),
                identifier: self.identifier.clone(),
            })
    }

    fn get_meta(&mut self, index: Option<usize>) -> Result<MetaMap, NdioError> {
        match index {
            None => {
                let mut meta = MetaMap::new();
                meta.insert("pages".into(), serde_json::Value::from(self.pages.len()));
                Ok(meta)
            }
            Some(i) => self
                .pages
                .get(i)
                .map(|p| p.meta.clone())
                .ok_or_else(|| NdioError::IndexOutOfRange {
                    index: i,
                    len: self.pages.len(),
                    identifier: self.identifier.clone(),
                }),
        }
    }

    fn close(&mut self) {
        self.pages.clear();
    }
}

struct TiffWriter {
    pending: Vec<NdImage>,
}

impl LegacyWriter for TiffWriter {
    fn append(&mut self, image: &NdImage) -> Result<(), NdioError> {
        self.pending.push(image.clone());
        Ok(())
    }

    fn close(&mut self, request: &mut Request) -> Result<(), NdioError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let identifier = request.identifier().to_owned();
        let encoded = encode_pages(&self.pending, &identifier)?;
        self.pending.clear();
        request.write_out(&encoded)
    }
}

/// Decode every directory into an element, front to back.
fn decode_pages(data: &[u8], identifier: &str) -> Result<Vec<NdImage>, NdioError> {
    let mut decoder = tiff::decoder::Decoder::new(Cursor::new(data))
        .map_err(|e| NdioError::from_backend(ID, identifier, e))?;

    let mut pages = Vec::new();
    loop {
        let (width, height) = decoder
            .dimensions()
            .map_err(|e| NdioError::from_backend(ID, identifier, e))?;
        let color = decoder
            .colortype()
            .map_err(|e| NdioError::from_backend(ID, identifier, e))?;
        let channels = match color {
            tiff::ColorType::Gray(_) => 1,
            tiff::ColorType::GrayA(_) => 2,
            tiff::ColorType::RGB(_) => 3,
            tiff::ColorType::RGBA(_) => 4,
            other => {
                return Err(NdioError::from_backend(
                    ID,
                    identifier,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unsupported TIFF color type {other:?}"),
                    ),
                ));
            }
        };
        let shape: Vec<usize> = if channels == 1 {
            vec![height as usize, width as usize]
        } else {
            vec![height as usize, width as usize, channels]
        };

        let result = decoder
            .read_image()
            .map_err(|e| NdioError::from_backend(ID, identifier, e))?;
        let image = match result {
            tiff::decoder::DecodingResult::U8(raw) => NdImage::from_u8(&shape, raw),
            tiff::decoder::DecodingResult::U16(raw) => NdImage::from_u16(&shape, raw),
            _ => {
                return Err(NdioError::from_backend(
                    ID,
                    identifier,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "unsupported TIFF sample format (only 8/16-bit unsigned)",
                    ),
                ));
            }
        };
        let mut image = image.ok_or_else(|| {
            NdioError::from_backend(
                ID,
                identifier,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "page size mismatch"),
            )
        })?;
        image
            .meta
            .insert("page".into(), serde_json::Value::from(pages.len()));
        pages.push(image);

        if !decoder.more_images() {
            break;
        }
        decoder
            .next_image()
            .map_err(|e| NdioError::from_backend(ID, identifier, e))?;
    }

    Ok(pages)
}

/// Encode elements as one directory per page.
fn encode_pages(pages: &[NdImage], identifier: &str) -> Result<Vec<u8>, NdioError> {
    use tiff::encoder::colortype;

    let mut buf = Cursor::new(Vec::new());
    {
        let mut encoder = tiff::encoder::TiffEncoder::new(&mut buf)
            .map_err(|e| NdioError::from_backend(ID, identifier, e))?;

        for page in pages {
            let shape = page.shape();
            let (height, width, channels) = match *shape {
                [h, w] => (h, w, 1),
                [h, w, c @ 1..=4] => (h, w, c),
                _ => {
                    return Err(NdioError::UnsupportedOperation {
                        id: ID.to_owned(),
                        detail: "TIFF pages must be [h, w] or [h, w, channels<=4]",
                    });
                }
            };
            let (w, h) = (width as u32, height as u32);

            let write_err = |e: tiff::TiffError| NdioError::from_backend(ID, identifier, e);
            match (&page.data, channels) {
                (NdData::U8(a), 1) => {
                    let raw: Vec<u8> = a.iter().copied().collect();
                    encoder
                        .write_image::<colortype::Gray8>(w, h, &raw)
                        .map_err(write_err)?;
                }
                (NdData::U8(a), 3) => {
                    let raw: Vec<u8> = a.iter().copied().collect();
                    encoder
                        .write_image::<colortype::RGB8>(w, h, &raw)
                        .map_err(write_err)?;
                }
                (NdData::U8(a), 4) => {
                    let raw: Vec<u8> = a.iter().copied().collect();
                    encoder
                        .write_image::<colortype::RGBA8>(w, h, &raw)
                        .map_err(write_err)?;
                }
                (NdData::U16(a), 1) => {
                    let raw: Vec<u16> = a.iter().copied().collect();
                    encoder
                        .write_image::<colortype::Gray16>(w, h, &raw)
                        .map_err(write_err)?;
                }
                (NdData::U16(a), 3) => {
                    let raw: Vec<u16> = a.iter().copied().collect();
                    encoder
                        .write_image::<colortype::RGB16>(w, h, &raw)
                        .map_err(write_err)?;
                }
                (NdData::U16(a), 4) => {
                    let raw: Vec<u16> = a.iter().copied().collect();
                    encoder
                        .write_image::<colortype::RGBA16>(w, h, &raw)
                        .map_err(write_err)?;
                }
                _ => {
                    return Err(NdioError::UnsupportedOperation {
                        id: ID.to_owned(),
                        detail: "TIFF output supports 1, 3, or 4 channel elements",
                    });
                }
            }
        }
    }
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(value: u8) -> NdImage {
        NdImage::from_u8(&[4, 6, 3], vec![value; 4 * 6 * 3]).unwrap()
    }

    #[test]
    fn accepts_magic_and_extension() {
        assert!(accepts(Some("tif"), &[], OpenMode::Read));
        assert!(accepts(None, &[0x49, 0x49, 0x2A, 0x00], OpenMode::Read));
        assert!(accepts(None, &[0x4D, 0x4D, 0x00, 0x2A], OpenMode::Read));
        assert!(!accepts(None, b"GIF89a", OpenMode::Read));
        assert!(accepts(Some("tiff"), &[], OpenMode::Write));
        assert!(!accepts(None, &[0x49, 0x49, 0x2A, 0x00], OpenMode::Write));
    }

    #[test]
    fn multipage_roundtrip() {
        let pages = vec![page(10), page(20), page(30)];
        let encoded = encode_pages(&pages, "test").unwrap();
        assert!(is_tiff_magic(&encoded));

        let decoded = decode_pages(&encoded, "test").unwrap();
        assert_eq!(decoded.len(), 3);
        for (i, p) in decoded.iter().enumerate() {
            assert_eq!(p.shape(), &[4, 6, 3]);
            assert_eq!(p.data, pages[i].data);
            assert_eq!(p.meta.get("page"), Some(&serde_json::Value::from(i)));
        }
    }

    #[test]
    fn gray16_roundtrip() {
        let source = NdImage::from_u16(&[3, 3], (0u16..9).map(|v| v * 700).collect()).unwrap();
        let encoded = encode_pages(std::slice::from_ref(&source), "test").unwrap();
        let decoded = decode_pages(&encoded, "test").unwrap();
        assert_eq!(decoded[0].data, source.data);
    }

    #[test]
    fn garbage_is_format_mismatch() {
        assert!(matches!(
            decode_pages(b"not a tiff at all", "test"),
            Err(NdioError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn legacy_predicates_consult_the_request() {
        let format = TiffFormat;
        let encoded = encode_pages(&[page(1)], "test").unwrap();

        let mut readable =
            Request::new(crate::Resource::Bytes(encoded), OpenMode::Read).unwrap();
        assert!(format.can_read(&mut readable));

        let mut unnamed_sink = Request::new(crate::Resource::ByteSink, OpenMode::Write).unwrap();
        assert!(!format.can_write(&mut unnamed_sink));
        unnamed_sink.set_extension(Some("tif".into()));
        assert!(format.can_write(&mut unnamed_sink));
    }

    #[test]
    fn two_channel_pages_are_rejected() {
        let odd = NdImage::from_u8(&[2, 2, 2], vec![0; 8]).unwrap();
        assert!(matches!(
            encode_pages(&[odd], "test"),
            Err(NdioError::UnsupportedOperation { .. })
        ));
    }
}
