//! NgasihTau licensing: device registry with revocation cascade, the license
//! state machine with nonce-rotating validation, and the download
//! coordinator.

pub mod devices;
pub mod download;
pub mod licenses;

pub use devices::DeviceRegistry;
pub use download::{DownloadCoordinator, DownloadGrant};
pub use licenses::LicenseEngine;
