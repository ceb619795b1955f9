pub mod hashing;

mod error;
mod manifest;
mod update_info;
mod version;

pub use error::ContentError;
pub use manifest::Manifest;
pub use manifest::ManifestAsset;
pub use manifest::ManifestBundle;
pub use update_info::PatchUpdateInfo;
pub use update_info::PlayerVersion;
pub use update_info::UpdateInfo;
pub use version::Version;
pub use version::VersionSet;
