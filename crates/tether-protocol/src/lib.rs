//! # tether-protocol
//!
//! Communication layer between the Tether debugger and the stub running inside
//! the target.
//!
//! The crate is layered leaves-first:
//!
//! - [`packet`]: encode/decode one message payload
//! - [`stream`]: the duplex byte-channel capability (TCP and in-memory)
//! - [`transport`]: `$...#cc` framing, checksums, `+`/`-` acknowledgement and
//!   retry, optional sequence numbers
//!
//! Nothing here knows what a register or a breakpoint is; that lives in
//! `tether-core`.

pub mod error;
pub mod packet;
pub mod stream;
pub mod transport;

pub use error::{TransportError, TransportResult};
pub use packet::Packet;
pub use stream::{SocketAddress, Stream};
pub use transport::{Transport, TransportFlags, INTERRUPT};
