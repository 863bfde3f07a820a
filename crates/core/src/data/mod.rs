pub mod batching;
pub mod mnist;

pub use batching::*;
pub use mnist::MnistDataset;
