//! parallite daemon assembly
//!
//! Binds the local endpoint, accepts one-shot submission connections, and
//! supervises the worker pool through startup, signals, and drain. The
//! `parallited` binary is a thin CLI wrapper over [`Server`].

pub mod config;
pub mod error;
pub mod listener;
pub mod supervisor;

pub use config::ServerConfig;
pub use error::ServerError;
pub use supervisor::{shutdown_signal, Server};
