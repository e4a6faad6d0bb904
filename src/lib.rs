#![doc = include_str!("../README.md")]
#![deny(unsafe_code, missing_docs)]

pub mod admission;
pub mod error;
pub mod filter;
pub mod manager;
pub mod packet;
pub mod queue;
pub mod timer;

mod bloom;
