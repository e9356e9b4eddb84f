//! Protocol module containing message types, the JSON codec and framing.

pub mod codec;
pub mod credentials;
pub mod messages;
pub mod sequence;

pub use codec::{
    decode_request, decode_response, encode_request, encode_response, FrameReader, ProtocolError,
    MAX_FRAME_LEN,
};
pub use credentials::{hash_password, verify_password_hash};
pub use messages::*;
pub use sequence::RequestIdCounter;
