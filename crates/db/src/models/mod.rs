pub mod segment;
pub mod task;
