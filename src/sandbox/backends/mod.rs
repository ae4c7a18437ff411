mod docker;
mod e2b;

pub use docker::DockerBackend;
pub use e2b::E2bBackend;
