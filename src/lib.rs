// TF2 provisioner - builds dedicated server containers from profiles and a plugin catalog

pub mod archive;
pub mod config;
pub mod docker;
pub mod http;
pub mod plugins;
pub mod probe;
pub mod provision;
