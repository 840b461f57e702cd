pub mod aggregate;
pub mod batch;
pub mod sample;
