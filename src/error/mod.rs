//! Set of module Error
pub mod engine;
pub mod fetch;
pub mod index;
pub mod metainfo;
pub mod seed;

pub use engine::{EngineError, Result as EngineResult};
pub use fetch::{FetchError, Result as FetchResult};
pub use index::{IndexError, Result as IndexResult};
pub use metainfo::{MetainfoError, Result as MetainfoResult};
pub use seed::{Result as SeedResult, SeedError};
