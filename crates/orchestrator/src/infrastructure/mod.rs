pub mod capability;
pub mod inventory;
pub mod logging;
pub mod state_file;
