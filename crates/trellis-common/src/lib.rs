pub mod error;

pub use error::{TrellisError, TrellisResult};
