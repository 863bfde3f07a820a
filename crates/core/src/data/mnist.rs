use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::info;

use crate::error::{Result, TensorError};
use crate::tensor::{Float, Tensor};

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

pub struct MnistDataset {
    /// `[N, 1, rows, cols]`, pixels scaled to `[0, 1]`.
    pub images: Tensor,
    /// `[N]`, class indices stored as floats.
    pub labels: Tensor,
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw)?;
    Ok(u32::from_be_bytes(raw))
}

fn read_magic<R: Read>(reader: &mut R, expected: u32) -> Result<()> {
    let magic = read_u32(reader)?;
    if magic != expected {
        return Err(TensorError::Dataset(format!(
            "magic number {magic}, expected {expected}"
        )));
    }
    Ok(())
}

/// Reads exactly `len` payload bytes. The buffer grows with the bytes
/// actually present, so a lying header cannot force a huge allocation.
fn read_payload<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(TensorError::Dataset(format!(
            "header announces {len} bytes, file holds {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Parses an IDX3 image file into `[N, 1, rows, cols]`.
pub fn read_images<R: Read>(mut reader: R) -> Result<Tensor> {
    read_magic(&mut reader, IMAGES_MAGIC)?;
    let count = read_u32(&mut reader)? as usize;
    let rows = read_u32(&mut reader)? as usize;
    let cols = read_u32(&mut reader)? as usize;

    let len = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .ok_or_else(|| TensorError::Dataset(format!("image header {count}x{rows}x{cols} overflows")))?;
    let pixels = read_payload(&mut reader, len)?;
    let data = pixels.into_iter().map(|p| Float::from(p) / 255.0).collect();
    Tensor::from_data(data, &[count, 1, rows, cols])
}

/// Parses an IDX1 label file into `[N]`.
pub fn read_labels<R: Read>(mut reader: R) -> Result<Tensor> {
    read_magic(&mut reader, LABELS_MAGIC)?;
    let count = read_u32(&mut reader)? as usize;

    let labels = read_payload(&mut reader, count)?;
    Tensor::from_data(labels.into_iter().map(Float::from).collect(), &[count])
}

impl MnistDataset {
    pub fn load_train(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::load(
            dir.join("train-images-idx3-ubyte"),
            dir.join("train-labels-idx1-ubyte"),
        )
    }

    pub fn load_test(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::load(
            dir.join("t10k-images-idx3-ubyte"),
            dir.join("t10k-labels-idx1-ubyte"),
        )
    }

    pub fn load(images_path: impl AsRef<Path>, labels_path: impl AsRef<Path>) -> Result<Self> {
        let images = read_images(BufReader::new(File::open(images_path.as_ref())?))?;
        let labels = read_labels(BufReader::new(File::open(labels_path.as_ref())?))?;
        if images.dims()[0] != labels.len() {
            return Err(TensorError::Dataset(format!(
                "{} images but {} labels",
                images.dims()[0],
                labels.len()
            )));
        }
        info!(
            samples = labels.len(),
            path = %images_path.as_ref().display(),
            "mnist loaded"
        );
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(magic: u32, dims: &[u32]) -> Vec<u8> {
        let mut bytes = magic.to_be_bytes().to_vec();
        for d in dims {
            bytes.extend_from_slice(&d.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn parses_images_and_labels() {
        let mut images = header(2051, &[2, 2, 2]);
        images.extend_from_slice(&[0, 255, 51, 0, 255, 255, 0, 0]);
        let t = read_images(images.as_slice()).unwrap();
        assert_eq!(t.dims(), &[2, 1, 2, 2]);
        assert_eq!(&t.data()[..3], &[0.0, 1.0, 0.2]);

        let mut labels = header(2049, &[2]);
        labels.extend_from_slice(&[7, 3]);
        let l = read_labels(labels.as_slice()).unwrap();
        assert_eq!(l.data(), &[7.0, 3.0]);
    }

    #[test]
    fn rejects_wrong_magic_and_truncation() {
        let labels = header(2051, &[1]);
        assert!(matches!(read_labels(labels.as_slice()), Err(TensorError::Dataset(_))));
        let truncated = header(2049, &[4]);
        assert!(matches!(read_labels(truncated.as_slice()), Err(TensorError::Dataset(_))));
        // a header cut short is still an io error
        assert!(matches!(read_labels(&[0u8, 0, 8][..]), Err(TensorError::Io(_))));
    }

    #[test]
    fn rejects_oversized_headers_without_allocating() {
        let mut images = header(2051, &[u32::MAX, u32::MAX, u32::MAX]);
        images.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(read_images(images.as_slice()), Err(TensorError::Dataset(_))));

        let labels = header(2049, &[u32::MAX]);
        assert!(matches!(read_labels(labels.as_slice()), Err(TensorError::Dataset(_))));
    }
}
