pub mod manager;

pub use manager::{ContainerSpec, DockerError, DockerManager, ExecOutput};
