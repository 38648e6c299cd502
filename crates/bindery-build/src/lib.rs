pub mod fake;
pub mod kube;

pub use fake::{FakeBuild, FakeBuildFactory};
pub use kube::{KubeBuild, KubeBuildFactory};
