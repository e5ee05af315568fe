//! Component D: wire framing and message encoding.

pub mod codec;
pub mod discovery;
pub mod messages;
pub mod pubsub_frame;

pub use codec::{HandshakeCodec, HandshakeFrame, MessageCodec, NormalFrame, msg_type, provider_msg_type};
pub use pubsub_frame::PubSubFrameCodec;
