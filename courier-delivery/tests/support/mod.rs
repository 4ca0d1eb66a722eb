#![allow(dead_code)]

pub mod handlers;
pub mod mock_transport;
