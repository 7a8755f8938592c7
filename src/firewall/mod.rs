pub mod actions;
pub mod ancestors;
pub mod config_files;
pub mod engine;
pub mod inventory;
pub mod network;
mod parser;
pub mod policies;
pub mod ports;
pub mod records;
pub mod resources;
pub mod rulebook;
pub mod rules;
pub mod saver;
pub mod violations;

#[cfg(test)]
mod testing;
