pub mod fleet;
pub mod generate;
