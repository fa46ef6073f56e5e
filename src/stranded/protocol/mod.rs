mod basic;
mod byte_receiver;
mod context;
mod core;
mod line_receiver;
mod mixed_receiver;
#[cfg(test)]
pub(crate) mod test_support;

pub use basic::{BasicHandler, BasicProtocol};
pub use byte_receiver::{ByteReceiver, ByteReceiverControl, BytesHandler};
pub use context::{Context, ConnectionHandle};
pub use core::{Protocol, ProtocolCore};
pub use line_receiver::{LineReceiver, LineReceiverControl, LinesHandler, DEFAULT_DELIMITER};
pub use mixed_receiver::{MixedHandler, MixedReceiver, MixedReceiverControl, Mode};
