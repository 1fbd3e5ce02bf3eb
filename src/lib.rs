//! Nameserv - LLMNR (RFC 4795) and NetBIOS Name Service (RFC 1001/1002).
//!
//! This crate provides the responders, the LLMNR resolver client and the
//! NBNS name registry, exposed as a library for testing and integration
//! purposes.

pub mod config;
pub mod error;
pub mod helpers;
pub mod llmnr;
pub mod logging;
pub mod nbns;
pub mod txid;
pub mod wire;
