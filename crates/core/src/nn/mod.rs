pub mod conv;
pub mod init;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optim;
pub mod vae;

pub use conv::*;
pub use layers::*;
pub use loss::*;
pub use model::*;
pub use optim::*;
pub use vae::*;
