mod api;
mod driver;
mod overlay;
mod paths;
mod prerequisites;
mod process;

pub use api::{ApiClient, ApiError};
pub use driver::{DriverError, HypervisorDriver, MachineConfig};
pub use overlay::{OverlayError, create_overlay};
pub use paths::ArtifactLayout;
pub use prerequisites::check_prerequisites;
