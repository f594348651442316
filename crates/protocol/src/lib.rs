pub mod bits;
pub mod ice;
pub mod input;

pub use bits::{pack_bits, unpack_bits};
pub use ice::IceServerInfo;
pub use input::{
    GamepadInput, GamepadRumble, InputKind, KeyboardInput, MouseInput, ProtocolError,
};
