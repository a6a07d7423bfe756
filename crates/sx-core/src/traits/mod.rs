//! Core trait abstractions

pub mod transport;

pub use transport::{
    AcceptedChannel, ByteStream, ChannelOpen, DuplexStream, RejectReason, SESSION_CHANNEL_TYPE,
};
