// src/models/mod.rs

pub mod block;
pub mod quiz;
pub mod session;
