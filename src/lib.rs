// Library exports for the vigil process supervisor

pub mod config;
pub mod error;
pub mod events;
pub mod logs;
pub mod process;
