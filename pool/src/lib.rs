pub mod auth;
pub mod banning;
pub mod blockchain;
pub mod coin;
pub mod config;
pub mod jobs;
pub mod metrics;
pub mod session;
pub mod shares;
pub mod stratum;
pub mod vardiff;
