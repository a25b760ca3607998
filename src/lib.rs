pub mod backend;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod coordination;
pub mod error;
pub mod queue;
pub mod rounds;
pub mod shutdown;
