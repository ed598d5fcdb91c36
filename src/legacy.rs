//! Adapter for legacy two-object backends.
//!
//! Older backends ship a format object that hands out separate reader and
//! writer objects instead of implementing
//! [`BackendInstance`](crate::plugin::BackendInstance) directly. The adapter
//! drives them through the uniform contract without modification:
//!
//! - the legacy object is constructed lazily, on the first actual operation,
//!   not at open time (some legacy backends are expensive to initialize);
//! - per-element metadata stays attached to returned elements, as legacy
//!   callers expect, and is also reachable through `metadata()`;
//! - every iteration restart fetches a *fresh* reader, because legacy
//!   readers are not guaranteed resettable;
//! - close is proxied to the legacy object's own cleanup exactly once, no
//!   matter how often the handle is closed.

use crate::NdioError;
use crate::ndimage::{Length, MetaMap, NdImage, Properties};
use crate::plugin::BackendInstance;
use crate::resource::Request;

/// A legacy-style backend: predicates plus reader/writer constructors.
pub trait LegacyFormat: Send + Sync {
    fn id(&self) -> &'static str;

    /// Legacy read predicate (`_can_read` in the old convention).
    fn can_read(&self, request: &mut Request) -> bool;

    /// Legacy write predicate (`_can_save` in the old convention).
    fn can_write(&self, request: &mut Request) -> bool;

    /// Construct a reader over the request's content. The reader must be
    /// self-contained: it pulls what it needs from the request up front.
    fn reader(&self, request: &mut Request) -> Result<Box<dyn LegacyReader>, NdioError>;

    /// Construct a writer. Output is delivered to the request at close.
    fn writer(&self, request: &mut Request) -> Result<Box<dyn LegacyWriter>, NdioError>;
}

/// Legacy reader object: indexed access plus a reported length.
pub trait LegacyReader {
    fn len(&mut self) -> Result<Length, NdioError>;

    /// Element at `index`, with the legacy per-element metadata dict
    /// attached to the returned image.
    fn get_data(&mut self, index: usize) -> Result<NdImage, NdioError>;

    /// Metadata: per-element for `Some(index)`, container-level for `None`.
    fn get_meta(&mut self, index: Option<usize>) -> Result<MetaMap, NdioError>;

    /// Standardized record. The default derives it from a decoded element.
    fn properties(&mut self, index: Option<usize>) -> Result<Properties, NdioError> {
        let n = self.len()?;
        match index {
            Some(i) => {
                let image = self.get_data(i)?;
                Ok(Properties {
                    shape: image.shape().to_vec(),
                    element_type: image.data.element_type(),
                    n_images: n,
                    is_batch: false,
                })
            }
            None => {
                let image = self.get_data(0)?;
                let mut shape = image.shape().to_vec();
                let is_batch = n.exact().is_none_or(|count| count > 1);
                if let Some(count) = n.exact().filter(|count| *count > 1) {
                    shape.insert(0, count);
                }
                Ok(Properties {
                    shape,
                    element_type: image.data.element_type(),
                    n_images: n,
                    is_batch,
                })
            }
        }
    }

    /// Legacy cleanup hook.
    fn close(&mut self);
}

/// Legacy writer object: append elements, flush on close.
pub trait LegacyWriter {
    fn append(&mut self, image: &NdImage) -> Result<(), NdioError>;

    /// Container-level metadata; unsupported fields are ignored.
    fn set_meta(&mut self, meta: &MetaMap) -> Result<(), NdioError> {
        let _ = meta;
        Ok(())
    }

    /// Encode pending elements and deliver them via
    /// [`Request::write_out`].
    fn close(&mut self, request: &mut Request) -> Result<(), NdioError>;
}

/// Drives a [`LegacyFormat`] through the uniform contract.
pub struct LegacyAdapter {
    id: &'static str,
    format: Box<dyn LegacyFormat>,
    request: Request,
    reader: Option<Box<dyn LegacyReader>>,
    writer: Option<Box<dyn LegacyWriter>>,
    cursor: usize,
    closed: bool,
}

impl LegacyAdapter {
    pub(crate) fn new(
        id: &'static str,
        format: Box<dyn LegacyFormat>,
        request: Request,
    ) -> Result<Self, NdioError> {
        Ok(Self {
            id,
            format,
            request,
            reader: None,
            writer: None,
            cursor: 0,
            closed: false,
        })
    }

    fn reader(&mut self) -> Result<&mut (dyn LegacyReader + '_), NdioError> {
        if self.reader.is_none() {
            self.reader = Some(self.format.reader(&mut self.request)?);
        }
        Ok(self
            .reader
            .as_deref_mut()
            .expect("reader constructed above"))
    }

    fn writer(&mut self) -> Result<&mut (dyn LegacyWriter + '_), NdioError> {
        if self.writer.is_none() {
            self.writer = Some(self.format.writer(&mut self.request)?);
        }
        Ok(self
            .writer
            .as_deref_mut()
            .expect("writer constructed above"))
    }
}

impl BackendInstance for LegacyAdapter {
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
        self.reader()?.len()
    }

    fn read(&mut self, index: usize) -> Result<NdImage, NdioError> {
        self.reader()?.get_data(index)
    }

    fn next_element(&mut self) -> Option<Result<NdImage, NdioError>> {
        let len = match self.len() {
            Ok(Length::Exact(n)) => n,
            Ok(Length::Unbounded) => usize::MAX,
            Err(e) => return Some(Err(e)),
        };
        if self.cursor >= len {
            return None;
        }
        let index = self.cursor;
        self.cursor += 1;
        Some(self.read(index))
    }

    fn rewind(&mut self) -> Result<bool, NdioError> {
        // Legacy readers are not guaranteed resettable; fetch a fresh one
        // on the next pull.
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
        self.cursor = 0;
        Ok(true)
    }

    fn metadata(&mut self, index: Option<usize>) -> Result<MetaMap, NdioError> {
        self.reader()?.get_meta(index)
    }

    fn properties(&mut self, index: Option<usize>) -> Result<Properties, NdioError> {
        self.reader()?.properties(index)
    }

    fn write(&mut self, image: &NdImage) -> Result<(), NdioError> {
        self.writer()?.append(image)
    }

    fn set_global_metadata(&mut self, meta: &MetaMap) -> Result<(), NdioError> {
        self.writer()?.set_meta(meta)
    }

    fn close(&mut self) -> Result<(), NdioError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
        if let Some(mut writer) = self.writer.take() {
            writer.close(&mut self.request)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{OpenMode, Resource};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFormat {
        readers_built: Arc<AtomicUsize>,
        reader_closes: Arc<AtomicUsize>,
    }

    struct CountingReader {
        closes: Arc<AtomicUsize>,
    }

    impl LegacyFormat for CountingFormat {
        fn id(&self) -> &'static str {
            "counting"
        }
        fn can_read(&self, _request: &mut Request) -> bool {
            true
        }
        fn can_write(&self, _request: &mut Request) -> bool {
            true
        }
        fn reader(&self, _request: &mut Request) -> Result<Box<dyn LegacyReader>, NdioError> {
            self.readers_built.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingReader {
                closes: self.reader_closes.clone(),
            }))
        }
        fn writer(&self, _request: &mut Request) -> Result<Box<dyn LegacyWriter>, NdioError> {
            Ok(Box::new(CollectingWriter {
                pending: Vec::new(),
                closes: 0,
            }))
        }
    }

    impl LegacyReader for CountingReader {
        fn len(&mut self) -> Result<Length, NdioError> {
            Ok(Length::Exact(2))
        }
        fn get_data(&mut self, index: usize) -> Result<NdImage, NdioError> {
            if index >= 2 {
                return Err(NdioError::IndexOutOfRange {
                    index,
                    len: 2,
                    identifier: "<buffer>".into(),
                });
            }
            let mut image = NdImage::from_u8(&[2, 2], vec![index as u8; 4]).unwrap();
            image
                .meta
                .insert("page".into(), serde_json::Value::from(index));
            Ok(image)
        }
        fn get_meta(&mut self, index: Option<usize>) -> Result<MetaMap, NdioError> {
            let mut meta = MetaMap::new();
            meta.insert("scope".into(), serde_json::Value::from(match index {
                Some(_) => "element",
                None => "container",
            }));
            Ok(meta)
        }
        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CollectingWriter {
        pending: Vec<NdImage>,
        closes: usize,
    }

    impl LegacyWriter for CollectingWriter {
        fn append(&mut self, image: &NdImage) -> Result<(), NdioError> {
            self.pending.push(image.clone());
            Ok(())
        }
        fn close(&mut self, request: &mut Request) -> Result<(), NdioError> {
            self.closes += 1;
            assert_eq!(self.closes, 1, "legacy writer closed more than once");
            request.write_out(&vec![0u8; self.pending.len()])
        }
    }

    fn read_adapter(counts: (&Arc<AtomicUsize>, &Arc<AtomicUsize>)) -> LegacyAdapter {
        let request = Request::new(Resource::Bytes(vec![0]), OpenMode::Read).unwrap();
        LegacyAdapter::new(
            "counting",
            Box::new(CountingFormat {
                readers_built: counts.0.clone(),
                reader_closes: counts.1.clone(),
            }),
            request,
        )
        .unwrap()
    }

    #[test]
    fn reader_is_constructed_lazily() {
        let built = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let mut adapter = read_adapter((&built, &closed));

        assert_eq!(built.load(Ordering::SeqCst), 0, "no reader at open time");
        adapter.read(0).unwrap();
        adapter.read(1).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1, "one reader for both reads");
    }

    #[test]
    fn restart_fetches_fresh_reader() {
        let built = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let mut adapter = read_adapter((&built, &closed));

        while let Some(frame) = adapter.next_element() {
            frame.unwrap();
        }
        adapter.rewind().unwrap();
        while let Some(frame) = adapter.next_element() {
            frame.unwrap();
        }

        assert_eq!(built.load(Ordering::SeqCst), 2, "fresh reader per restart");
        assert_eq!(closed.load(Ordering::SeqCst), 1, "first reader was closed");
    }

    #[test]
    fn element_meta_rides_along() {
        let built = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let mut adapter = read_adapter((&built, &closed));

        let image = adapter.read(1).unwrap();
        assert_eq!(image.meta.get("page"), Some(&serde_json::Value::from(1)));

        let container = adapter.metadata(None).unwrap();
        assert_eq!(
            container.get("scope"),
            Some(&serde_json::Value::from("container"))
        );
    }

    #[test]
    fn properties_none_describes_the_stack() {
        let built = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let mut adapter = read_adapter((&built, &closed));

        let props = adapter.properties(None).unwrap();
        assert_eq!(props.shape, vec![2, 2, 2]);
        assert!(props.is_batch);
        assert_eq!(props.n_images, Length::Exact(2));

        let single = adapter.properties(Some(0)).unwrap();
        assert_eq!(single.shape, vec![2, 2]);
        assert!(!single.is_batch);
    }

    #[test]
    fn close_proxies_exactly_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let mut adapter = read_adapter((&built, &closed));

        adapter.read(0).unwrap();
        adapter.close().unwrap();
        adapter.close().unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writer_flushes_through_request_on_close() {
        let request = Request::new(Resource::from("<bytes>"), OpenMode::Write).unwrap();
        let mut adapter = LegacyAdapter::new(
            "counting",
            Box::new(CountingFormat {
                readers_built: Arc::new(AtomicUsize::new(0)),
                reader_closes: Arc::new(AtomicUsize::new(0)),
            }),
            request,
        )
        .unwrap();

        let image = NdImage::from_u8(&[1], vec![5]).unwrap();
        adapter.write(&image).unwrap();
        adapter.write(&image).unwrap();
        adapter.close().unwrap();
        adapter.close().unwrap(); // CollectingWriter would panic on a second proxy

        assert_eq!(adapter.request_mut().take_result().unwrap().len(), 2);
    }
}
