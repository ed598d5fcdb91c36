//! Decoded element representation and standardized properties.

use std::collections::BTreeMap;

use ndarray::{ArrayD, ArrayViewD, Axis};

/// Backend-specific key/value metadata attached to elements and containers.
pub type MetaMap = BTreeMap<String, serde_json::Value>;

/// Per-channel storage type of a decoded element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    U16,
}

/// Number of elements a resource holds.
///
/// Live sources (webcam, screen grab) and pipe-fed decoders report
/// `Unbounded` rather than erroring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Length {
    Exact(usize),
    Unbounded,
}

impl Length {
    /// Exact element count, if known.
    pub fn exact(self) -> Option<usize> {
        match self {
            Length::Exact(n) => Some(n),
            Length::Unbounded => None,
        }
    }
}

/// Pixel storage for one decoded element.
///
/// Shape convention: `[height, width]` for single-channel data,
/// `[height, width, channels]` otherwise. Stacked multi-element reads gain
/// a leading element axis.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum NdData {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
}

impl NdData {
    /// Array shape, outermost axis first.
    pub fn shape(&self) -> &[usize] {
        match self {
            NdData::U8(a) => a.shape(),
            NdData::U16(a) => a.shape(),
        }
    }

    /// Per-channel storage type.
    pub fn element_type(&self) -> ElementType {
        match self {
            NdData::U8(_) => ElementType::U8,
            NdData::U16(_) => ElementType::U16,
        }
    }

    /// Stack elements along a new leading axis.
    ///
    /// All elements must share shape and element type.
    pub(crate) fn stack(frames: &[NdData]) -> Result<NdData, &'static str> {
        let first = frames.first().ok_or("cannot stack zero elements")?;
        match first {
            NdData::U8(_) => {
                let views: Vec<ArrayViewD<'_, u8>> = frames
                    .iter()
                    .map(|f| match f {
                        NdData::U8(a) => Ok(a.view()),
                        NdData::U16(_) => Err("mixed element types in stack"),
                    })
                    .collect::<Result<_, _>>()?;
                ndarray::stack(Axis(0), &views)
                    .map(NdData::U8)
                    .map_err(|_| "element shapes differ")
            }
            NdData::U16(_) => {
                let views: Vec<ArrayViewD<'_, u16>> = frames
                    .iter()
                    .map(|f| match f {
                        NdData::U16(a) => Ok(a.view()),
                        NdData::U8(_) => Err("mixed element types in stack"),
                    })
                    .collect::<Result<_, _>>()?;
                ndarray::stack(Axis(0), &views)
                    .map(NdData::U16)
                    .map_err(|_| "element shapes differ")
            }
        }
    }
}

/// One decoded image/frame/volume element plus its side-channel metadata.
#[derive(Clone, Debug)]
pub struct NdImage {
    pub data: NdData,
    pub meta: MetaMap,
}

impl NdImage {
    /// Build an 8-bit element from a flat buffer.
    ///
    /// Returns `None` if `shape` does not match the buffer length.
    pub fn from_u8(shape: &[usize], data: Vec<u8>) -> Option<Self> {
        let array = ArrayD::from_shape_vec(shape.to_vec(), data).ok()?;
        Some(Self {
            data: NdData::U8(array),
            meta: MetaMap::new(),
        })
    }

    /// Build a 16-bit element from a flat buffer.
    pub fn from_u16(shape: &[usize], data: Vec<u16>) -> Option<Self> {
        let array = ArrayD::from_shape_vec(shape.to_vec(), data).ok()?;
        Some(Self {
            data: NdData::U16(array),
            meta: MetaMap::new(),
        })
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Attach metadata, builder-style.
    pub fn with_meta(mut self, meta: MetaMap) -> Self {
        self.meta = meta;
        self
    }
}

/// Standardized element record, independent of backend.
///
/// Fields a backend cannot supply get defaults instead of errors: an
/// unknown element count is reported as [`Length::Unbounded`].
#[derive(Clone, Debug, PartialEq)]
pub struct Properties {
    /// Shape of the described element (or of the full stack when the
    /// record describes the whole resource).
    pub shape: Vec<usize>,
    /// Per-channel storage type.
    pub element_type: ElementType,
    /// Total number of elements in the resource.
    pub n_images: Length,
    /// Whether the described record covers a stack of elements rather
    /// than a single one.
    pub is_batch: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_u8_shape_mismatch() {
        assert!(NdImage::from_u8(&[2, 2, 3], vec![0u8; 11]).is_none());
        assert!(NdImage::from_u8(&[2, 2, 3], vec![0u8; 12]).is_some());
    }

    #[test]
    fn stack_adds_leading_axis() {
        let a = NdImage::from_u8(&[2, 3], vec![1u8; 6]).unwrap();
        let b = NdImage::from_u8(&[2, 3], vec![2u8; 6]).unwrap();

        let stacked = NdData::stack(&[a.data, b.data]).unwrap();
        assert_eq!(stacked.shape(), &[2, 2, 3]);
        assert_eq!(stacked.element_type(), ElementType::U8);
    }

    #[test]
    fn stack_rejects_shape_mismatch() {
        let a = NdImage::from_u8(&[2, 3], vec![0u8; 6]).unwrap();
        let b = NdImage::from_u8(&[3, 2], vec![0u8; 6]).unwrap();
        assert!(NdData::stack(&[a.data, b.data]).is_err());
    }

    #[test]
    fn stack_rejects_mixed_types() {
        let a = NdImage::from_u8(&[2], vec![0u8; 2]).unwrap();
        let b = NdImage::from_u16(&[2], vec![0u16; 2]).unwrap();
        assert!(NdData::stack(&[a.data, b.data]).is_err());
    }

    #[test]
    fn length_exact() {
        assert_eq!(Length::Exact(4).exact(), Some(4));
        assert_eq!(Length::Unbounded.exact(), None);
    }
}
