//! External delivery channels for notifications leaving the process.

pub mod webhook;
