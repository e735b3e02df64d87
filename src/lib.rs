//! meshpix: chunked reliable image transport for LoRa mesh radios.
//!
//! Facade crate. The wire format and codecs live in `meshpix-core`;
//! the sender/receiver engines and the link driver seam live in
//! `meshpix-transport`. This crate re-exports both for applications
//! that want a single dependency.

pub use meshpix_core::{config, control, payload, wire};
pub use meshpix_transport::{adaptive, buffer, events, link, progress, receiver, sender};
