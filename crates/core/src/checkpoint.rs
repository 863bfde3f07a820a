//! Flat parameter checkpoints.
//!
//! For each parameter, in registration order: `len` data values followed by
//! `len` gradient values, each an `f64` in little-endian byte order. There is
//! no header; the reader must present the same parameters in the same order.

use std::io::{Read, Write};

use crate::error::{Result, TensorError};
use crate::tensor::{Float, Tensor};

const VALUE_BYTES: usize = std::mem::size_of::<Float>();

pub fn write_parameters<W: Write>(mut writer: W, parameters: &[&Tensor]) -> Result<()> {
    for p in parameters {
        for v in p.data().iter().chain(p.grad()) {
            writer.write_all(&v.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Fills `parameters` from `reader`, which must hold exactly the values they
/// need. Nothing is modified when the size is wrong.
pub fn read_parameters<R: Read>(mut reader: R, parameters: Vec<&mut Tensor>) -> Result<()> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    let expected: usize = parameters.iter().map(|p| 2 * p.len()).sum();
    if bytes.len() != expected * VALUE_BYTES {
        return Err(TensorError::CheckpointSize {
            expected,
            got: bytes.len() / VALUE_BYTES,
        });
    }

    let mut values = bytes.chunks_exact(VALUE_BYTES).map(|chunk| {
        let mut raw = [0u8; VALUE_BYTES];
        raw.copy_from_slice(chunk);
        Float::from_le_bytes(raw)
    });
    for p in parameters {
        let (data, grad) = p.split_mut();
        for (slot, v) in data.iter_mut().chain(grad.iter_mut()).zip(&mut values) {
            *slot = v;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_data_then_grad_per_parameter() {
        let mut a = Tensor::from_data(vec![1.0, 2.0], &[2]).unwrap();
        a.grad_mut()[1] = -1.0;
        let b = Tensor::from_data(vec![3.0], &[1]).unwrap();

        let mut buf = Vec::new();
        write_parameters(&mut buf, &[&a, &b]).unwrap();
        assert_eq!(buf.len(), 6 * 8);
        let values: Vec<f64> = buf
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, [1.0, 2.0, 0.0, -1.0, 3.0, 0.0]);
    }

    #[test]
    fn size_mismatch_leaves_parameters_untouched() {
        let mut p = Tensor::from_data(vec![5.0, 6.0], &[2]).unwrap();
        let short = vec![0u8; 3 * 8];
        assert!(matches!(
            read_parameters(short.as_slice(), vec![&mut p]),
            Err(TensorError::CheckpointSize { expected: 4, got: 3 })
        ));
        assert_eq!(p.data(), &[5.0, 6.0]);
    }
}
