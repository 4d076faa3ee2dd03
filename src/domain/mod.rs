pub mod filter;
pub mod models;
pub mod settings;
pub mod state_machine;
