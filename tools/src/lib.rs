#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! Shared helpers for the one-shot netmqtt utilities.
//!
//! - `echo` — matching `raw/at` exchange lines against the command that
//!   produced them (atinsert)
//! - `addrs` — interface-address collection and filtering (ifaddrtomqtt)

pub mod addrs;
pub mod echo;
