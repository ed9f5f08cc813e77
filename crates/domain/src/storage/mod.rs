//! Persistence contracts implemented by the storage crate and by test fakes.

mod traits;

pub use traits::*;
