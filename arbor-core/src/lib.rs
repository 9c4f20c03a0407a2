//! Arbor protocol core.
//! No I/O: message types, node locations and the 512-byte frame codec.

pub mod identity;
pub mod integrity;
pub mod location;
pub mod protocol;
pub mod sensors;
pub mod wire;

pub use identity::Identity;
pub use location::NodeLocation;
pub use protocol::{
    Acknowledgement, AvailableEndpoints, EndpointId, ErrorCode, GenericError, Message, OpCode,
    Packet, RegistrationRequest, RegistrationResponse, SensorData, SensorDataRequest,
};
pub use sensors::SensorId;
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError, FRAME_SIZE};
