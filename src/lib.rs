pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod gate;
pub mod health;
pub mod hold;
pub mod idle;
pub mod log;
pub mod messages;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod restart;
pub mod router;
pub mod sys;
pub mod ticket;
pub mod wait;
