use std::net::SocketAddr;

use smol_str::SmolStr;
use tinysip_core::{Request, Response};
use tinysip_dialog::DialogId;
use tinysip_transaction::TransactionKey;

/// Events published on the user agent's inbound stream.
#[derive(Debug, Clone)]
pub enum UaEvent {
    /// A request from a peer opened a new server transaction. Answer it
    /// with [`UserAgent::respond`](crate::UserAgent::respond).
    NewRequest {
        key: TransactionKey,
        request: Request,
        peer: SocketAddr,
    },
    /// A response (provisional or final) was delivered to a client
    /// transaction.
    ResponseReceived {
        key: TransactionKey,
        response: Response,
    },
    /// A dialog was torn down (BYE in either direction, 481, or a failed
    /// INVITE that had an early dialog).
    DialogTerminated { id: DialogId, reason: SmolStr },
    /// Timer B, F, or H fired on the transaction.
    TransactionTimeout { key: TransactionKey },
}
