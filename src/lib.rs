pub mod adapter;
pub mod audit;
pub mod config;
pub mod drp;
pub mod error;
pub mod kill;
pub mod metrics;
pub mod mutation;
pub mod operator;
pub mod replay;
pub mod session;
pub mod state;
