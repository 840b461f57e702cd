pub mod command;
pub mod extract;
pub mod file;
pub mod metrics;
pub mod monitor;
pub mod quality;
pub mod stage;
pub mod system;
