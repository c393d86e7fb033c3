//! The account's contact list: [`Peer`] records kept in an in-memory
//! [`Roster`] shared between the dispatch path and presentation code.

pub mod peer;
pub mod roster;

pub use peer::{Peer, PeerError, Status};
pub use roster::Roster;
