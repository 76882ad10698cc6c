// App-specific modules
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod fanout;
pub mod ledger;
pub mod service;
pub mod store;
pub mod tokens;
