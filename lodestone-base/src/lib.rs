pub mod hashing;

mod error;
mod handle;
pub mod location;

pub use error::LoadError;
pub use handle::Handle;
pub use handle::OperationId;
pub use handle::OperationStatus;
pub use location::ResourceLocation;
