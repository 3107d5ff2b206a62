//! Wire protocol of the dcs control server.
//!
//! Clients talk to the daemon over a local UNIX socket carrying
//! self-delimited JSON frames. After a three-frame handshake the connection
//! is bound to one [`session::SessionMode`] and exchanges the frames of
//! that mode's processor: commands and responses, intercepted codes and
//! verdicts, or object-model pushes and acknowledgements.

pub mod code;
pub mod command;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod init;
pub mod model;
pub mod response;
pub mod session;

pub use code::{Code, CodeChannel, CodeType, InterceptOptions, InterceptionStage, Message};
pub use command::{decode_command, Command, HttpEndpointType};
pub use error::{ErrorType, IpcError};
pub use frame::{encode_frame, FrameError, JsonFrameDecoder, DEFAULT_MAX_FRAME_BYTES};
pub use init::{
    ClientInit, InitResponse, ServerInit, SubscribeOptions, SubscriptionMode, PROTOCOL_VERSION,
};
pub use response::Response;
pub use session::{full_permissions, Permission, SessionMode};
