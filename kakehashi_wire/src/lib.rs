//! Wire vocabulary for the Kakehashi remote bridge.
//!
//! Everything byte-exact lives here: the packet framing codec, the
//! handshake payloads, the stream operation metadata grammars, and the
//! status/error code taxonomies. The crate is deliberately free of any
//! I/O or session logic so both endpoints and their tests share one
//! definition of the wire.

pub mod bootstrap;
pub mod codec;
pub mod error;
pub mod meta;
pub mod packet;
pub mod status;

pub use self::bootstrap::{Goodbye, GoodbyeReason, Hello, HelloAck, SessionFlags};
pub use self::codec::{FrameError, WireCodec};
pub use self::error::WireError;
pub use self::meta::{
    DirEntryReply, EntryKind, ExecChannel, OpenRequest, OperationKind, SearchHit, StatReply,
};
pub use self::packet::{
    DEFAULT_WINDOW, HEADER_SIZE, MAX_PATH, MAX_WINDOW, MIN_WINDOW, NODE_MAX_PACKET, PROTOCOL_VERSION,
    Packet, PacketType, RELAY_MAX_PACKET,
};
pub use self::status::{EndStatus, ErrorCode};
