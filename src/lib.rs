pub mod agents;
pub mod audit;
pub mod conductor_config;
pub mod config;
pub mod decision;
pub mod errors;
pub mod executor;
pub mod messenger;
pub mod outcome;
pub mod policy;
pub mod prompt;
pub mod session;
pub mod stream;
pub mod tracker;
pub mod transition;
pub mod worker;
