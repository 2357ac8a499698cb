pub mod codec;
pub mod connection;
pub mod extranonce;
pub mod protocol;
pub mod registry;
pub mod server;

// Re-exports
pub use codec::{ProtocolError, StratumCodec};
pub use connection::WorkerConnection;
pub use extranonce::ExtraNonceProvider;
pub use protocol::{
    ShareSubmission, StratumError, StratumErrorCode, StratumNotification, StratumRequest,
    StratumResponse,
};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use server::StratumServer;
