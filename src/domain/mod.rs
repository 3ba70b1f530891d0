pub mod client;
pub mod executor;
pub mod image;
pub mod instance;
pub mod model;
pub mod port;
pub mod publish_settings;

#[cfg(test)]
pub(crate) mod fake;

pub use client::CloudClient;
pub use image::CloudImage;
pub use instance::CloudInstance;
