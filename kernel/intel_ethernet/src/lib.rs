//! Definitions shared by Intel ethernet drivers, most importantly the
//! hardware-visible descriptor types that make up transmit and receive rings.

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate static_assertions;
extern crate bit_field;
extern crate nic_buffers;
extern crate volatile;

pub mod descriptors;
