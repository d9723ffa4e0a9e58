pub mod framework;
pub mod host;
pub mod plugins;
