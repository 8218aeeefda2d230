//! Compile-time configuration constants shared by the NIC crates.
//!
//! Each submodule groups the constants for one subsystem.

#![no_std]

pub mod network;
