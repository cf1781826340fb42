//! Network communication layer.

pub mod rpc;
pub mod transport;

pub use rpc::{
    decode_message, encode_message, AtomicUpdate, DhtTxUpdate, EntryUpdate, Envelope,
    FinishRequest, FinishResponse, GetRequest, GetResponse, LockRequest, Message, MessageKind,
    TxWrite, UnlockRequest,
};
pub use transport::{LocalTransport, MessageHandler, Transport};
