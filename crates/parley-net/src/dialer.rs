use std::sync::Arc;

use async_trait::async_trait;

use parley_shared::Jid;

use crate::conn::Conn;
use crate::error::Result;

/// Establishes an authenticated connection for an account.
///
/// Resolving the server, TLS and SASL are the dialer's business; the session
/// only sees the resulting [`Conn`]. Authentication failures are reported as
/// [`NetError::Auth`](crate::NetError::Auth).
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, account: &Jid, password: &str) -> Result<Arc<dyn Conn>>;
}
