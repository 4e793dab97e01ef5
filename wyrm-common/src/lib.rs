//! Common functionality for `wyrm`.
//!
//! This crate exposes a small set of key types:
//!
//!  - [`ByteView`]: A shared, read-only image of an object file.
//!  - [`ReverseComponents`]: Canonicalising reverse iteration over byte paths.
//!
//! This module is part of the `wyrm` workspace.
//!
//! [`ByteView`]: struct.ByteView.html
//! [`ReverseComponents`]: struct.ReverseComponents.html

#![warn(missing_docs)]

mod byteview;
mod path;

pub use crate::byteview::*;
pub use crate::path::*;
