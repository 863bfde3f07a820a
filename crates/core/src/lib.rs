//! Dense tensors with reverse-mode gradients, trained layer by layer on a
//! fork-join thread pool.

pub mod backend;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod nn;
pub mod ops_cpu;
pub mod tensor;
pub mod thread_pool;
pub mod train;

pub use backend::CpuBackend;
pub use error::{Result, TensorError};
pub use tensor::{Dims, Float, Tensor, TensorId, MAX_RANK};
pub use thread_pool::{PoolConfig, ThreadPool};
