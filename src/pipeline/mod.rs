// src/pipeline/mod.rs

pub mod activities;
pub mod classification;
pub mod parsers;
pub mod pdf;
pub mod retry;
pub mod state;
