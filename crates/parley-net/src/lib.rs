// Transport seam of the session core: the `Conn`/`Dialer` traits, an XML
// stream connection over any async byte pipe, and the SOCKS5 client used by
// the byte-stream file transfer method.

pub mod conn;
pub mod dialer;
pub mod error;
pub mod socks5;
pub mod stream;

pub use conn::{Conn, Cookie};
pub use dialer::Dialer;
pub use error::{NetError, Result};
pub use stream::XmlConn;
