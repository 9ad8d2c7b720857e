pub mod admission;
pub mod diagnostics;
pub mod manager;
mod operation;
pub mod pool;
pub mod provider;

#[cfg(test)]
mod tests;

pub use manager::DownloadStatus;
pub use manager::GroupOptions;
pub use manager::ManagerConfig;
pub use manager::OperationInfo;
pub use manager::ResourceManager;
pub use provider::ProvideHandle;
pub use provider::Provider;

pub use lodestone_base::Handle;
pub use lodestone_base::LoadError;
pub use lodestone_base::OperationId;
pub use lodestone_base::OperationStatus;
pub use lodestone_base::ResourceLocation;
