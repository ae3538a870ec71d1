pub mod assembler;
pub mod capture;
pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod image_utils;
pub mod runtime;
pub mod server;
pub mod session;
pub mod storage;
pub mod writer;
