pub mod api;
pub mod config;
pub mod control;
pub mod cookies;
pub mod jobs;
pub mod logging;
pub mod model;
pub mod pki;
pub mod proxy;
pub mod recorder;
pub mod session;
pub mod stages;
pub mod transport;
pub mod worker;
