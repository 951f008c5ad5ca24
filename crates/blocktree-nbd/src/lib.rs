//! Linux NBD adapter: device setup ioctls and the request session loop.
//!
//! The kernel half and the server half of a connection meet over a socket
//! pair: [`NbdDevice`] hands one end to the kernel and blocks in its
//! transmission loop, while [`session::serve`] answers READ requests on
//! the other end from a [`blocktree_core::ChunkReader`].

pub mod device;
pub mod session;

pub use device::NbdDevice;
pub use session::{serve, SessionError};
