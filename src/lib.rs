pub mod agent;
pub mod api;
pub mod client;
pub mod config;
pub mod control;
pub mod db;
pub mod sensors;
pub mod shutdown;
