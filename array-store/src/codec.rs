//! Binary blob layout for arrays in the `.dat` file.
//!
//! Each blob is self-delimiting:
//!
//! | bytes          | content                                  |
//! |----------------|------------------------------------------|
//! | 4              | magic `NPDB`                             |
//! | 1              | element type code                        |
//! | 1              | rank                                     |
//! | 8 × rank       | axis lengths, little-endian `u64`        |
//! | width × count  | elements in row-major order, little-endian |

use ndarray::{ArrayBase, ArrayD, Data, Dimension, IxDyn};
use num_complex::Complex64;
use std::fmt;
use std::io::{ErrorKind, Read};

use crate::error::{StoreError, StoreResult};

/// Leading bytes of every blob.
pub const BLOB_MAGIC: [u8; 4] = *b"NPDB";

/// Element types the store knows how to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F64,
    Complex64,
    Bool,
}

impl ElementType {
    pub fn code(self) -> u8 {
        match self {
            ElementType::F64 => 0,
            ElementType::Complex64 => 1,
            ElementType::Bool => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ElementType::F64),
            1 => Some(ElementType::Complex64),
            2 => Some(ElementType::Bool),
            _ => None,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::F64 => "f64",
            ElementType::Complex64 => "complex64",
            ElementType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A scalar that can be written to and read from a blob payload.
pub trait StoreElement: Copy {
    const ELEMENT_TYPE: ElementType;
    /// Encoded size in bytes.
    const WIDTH: usize;

    fn write_le(self, out: &mut Vec<u8>);

    /// Decode from exactly `WIDTH` bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

fn f64_from_le(bytes: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    f64::from_le_bytes(buf)
}

impl StoreElement for f64 {
    const ELEMENT_TYPE: ElementType = ElementType::F64;
    const WIDTH: usize = 8;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        f64_from_le(bytes)
    }
}

impl StoreElement for Complex64 {
    const ELEMENT_TYPE: ElementType = ElementType::Complex64;
    const WIDTH: usize = 16;

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.re.to_le_bytes());
        out.extend_from_slice(&self.im.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        Complex64::new(f64_from_le(&bytes[..8]), f64_from_le(&bytes[8..16]))
    }
}

impl StoreElement for bool {
    const ELEMENT_TYPE: ElementType = ElementType::Bool;
    const WIDTH: usize = 1;

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Serialize an array of any rank into a blob.
pub fn encode<T, S, D>(array: &ArrayBase<S, D>) -> Vec<u8>
where
    T: StoreElement,
    S: Data<Elem = T>,
    D: Dimension,
{
    let shape = array.shape();
    let mut out = Vec::with_capacity(6 + 8 * shape.len() + T::WIDTH * array.len());

    out.extend_from_slice(&BLOB_MAGIC);
    out.push(T::ELEMENT_TYPE.code());
    out.push(shape.len() as u8);
    for &axis_len in shape {
        out.extend_from_slice(&(axis_len as u64).to_le_bytes());
    }
    // iter() walks in logical (row-major) order regardless of memory layout
    for &value in array.iter() {
        value.write_le(&mut out);
    }
    out
}

fn read_exact_or_corrupt<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> StoreResult<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            StoreError::CorruptRecord(format!("truncated {what}"))
        } else {
            StoreError::Io(e)
        }
    })
}

/// Read exactly one blob from `reader`.
///
/// The reader is left positioned directly after the blob.
pub fn decode<T: StoreElement, R: Read>(reader: &mut R) -> StoreResult<ArrayD<T>> {
    let mut header = [0u8; 6];
    read_exact_or_corrupt(reader, &mut header, "blob header")?;

    if header[..4] != BLOB_MAGIC {
        return Err(StoreError::CorruptRecord(format!(
            "bad magic {:02x?}",
            &header[..4]
        )));
    }

    let found = ElementType::from_code(header[4]).ok_or_else(|| {
        StoreError::CorruptRecord(format!("unknown element type code {}", header[4]))
    })?;
    if found != T::ELEMENT_TYPE {
        return Err(StoreError::DtypeMismatch {
            expected: T::ELEMENT_TYPE,
            found,
        });
    }

    let rank = header[5] as usize;
    let mut shape = Vec::with_capacity(rank);
    let mut count: usize = 1;
    for _ in 0..rank {
        let mut buf = [0u8; 8];
        read_exact_or_corrupt(reader, &mut buf, "blob shape")?;
        let axis_len = usize::try_from(u64::from_le_bytes(buf))
            .map_err(|_| StoreError::CorruptRecord("axis length overflows usize".to_string()))?;
        count = count
            .checked_mul(axis_len)
            .ok_or_else(|| StoreError::CorruptRecord("element count overflow".to_string()))?;
        shape.push(axis_len);
    }

    let byte_len = count
        .checked_mul(T::WIDTH)
        .ok_or_else(|| StoreError::CorruptRecord("payload length overflow".to_string()))?;
    // Grow with the bytes actually present so a damaged shape cannot force a huge allocation
    let mut payload = Vec::new();
    reader.by_ref().take(byte_len as u64).read_to_end(&mut payload)?;
    if payload.len() != byte_len {
        return Err(StoreError::CorruptRecord(format!(
            "truncated blob payload: expected {} bytes, found {}",
            byte_len,
            payload.len()
        )));
    }

    let elements: Vec<T> = payload.chunks_exact(T::WIDTH).map(T::read_le).collect();
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), elements)?)
}
