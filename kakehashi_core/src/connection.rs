pub mod error;
pub mod flow;
pub(crate) mod mux;
pub mod session;
pub mod stream;

#[cfg(test)]
mod test;

pub use self::error::{ConnectionError, Result};
pub use self::flow::{FlowControl, SessionGone};
pub use self::session::{
    EndpointRole, Farewell, PeerInfo, Session, SessionConfig, SessionControl,
};
pub use self::stream::{
    OpError, OpResult, OpenedStream, StreamEvent, StreamHandle, StreamIo, StreamState,
};
