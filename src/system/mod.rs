// src/system/mod.rs

pub mod process;
