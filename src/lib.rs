pub mod backend;
pub mod chain;
pub mod cli;
pub mod config;
pub mod core;
pub mod criteria;
pub mod data;
pub mod distributions;
pub mod ensemble;
pub mod init;
pub mod io;
pub mod metropolis_hastings;
pub mod model;
pub mod plot;
pub mod report;
pub mod stats;
