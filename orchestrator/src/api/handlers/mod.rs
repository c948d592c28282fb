//! API request handlers

pub mod health;
pub mod session;
pub mod terminal;
