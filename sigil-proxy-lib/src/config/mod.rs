mod env;
mod loader;
mod root;

pub use env::{AppEnv, PacOptions, ProxyMode, RuntimeEnv};
pub use loader::load_from_path;
pub use root::Config;
