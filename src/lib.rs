pub mod api;
pub mod code_gen;
pub mod config;
pub mod expiry;
pub mod memory_repo;
pub mod orm;
pub mod url_repo;
pub mod url_service;
