pub mod config;
pub mod crawler;
pub mod error;
pub mod handler;
pub mod matches;
pub mod pipeline;
pub mod players;
