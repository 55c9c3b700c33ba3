pub mod aps;
pub mod config;
mod error;
pub mod handshake;
pub mod ids;
pub mod imessage;
pub mod session;
pub mod store;
pub mod util;

pub use aps::{
    codec::{CommandId, ConnectionFlags, Field, Frame, FramingError},
    topics::Topic,
    ConnectionState, CourierConnection, CourierIdentity, CourierTransport, PushNotification, TlsTransport,
};
pub use config::{init_logger, CourierConfig, DeviceInfo, RegistrationData, SessionConfig};
pub use error::PushError;
pub use handshake::{HandshakeState, Handshaker, RegistrationHandshaker};
pub use ids::{IDSError, IDSStatus};
pub use imessage::{
    decrypt::{DecryptError, Decryptor},
    DecryptedMessage, Message, MessageSummary,
};
pub use session::Session;
pub use store::{FileStore, LastSeenStore, MemoryStore};
