pub mod activation;
pub mod elementwise;
pub mod matmul;
pub mod reduce;

pub use activation::*;
pub use matmul::*;
