//! The `courier` command: loads a RON configuration and drives an
//! [`EmailSender`](courier_delivery::EmailSender) from the command line.

pub mod cli;
pub mod config;
