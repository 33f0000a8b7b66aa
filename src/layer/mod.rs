//! The protocol layers of the stack.
//!
//! Only the transport layer lives in this crate; the network layer below
//! it is an external collaborator reached through the traits in
//! [`tcp`].

pub mod tcp;
