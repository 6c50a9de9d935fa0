mod error;
mod model;

pub use error::CalsyncError;
pub use model::*;
