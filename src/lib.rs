pub mod backup;
pub mod cli;
pub mod config;
pub mod conflicts;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod fsops;
pub mod game;
pub mod importer;
pub mod logging;
pub mod manifest;
pub mod restore;
pub mod router;
