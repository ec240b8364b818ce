pub mod ber;
pub mod config;
pub mod connection;
pub mod error;
pub mod extended;
pub mod factory;
pub mod filter;
pub mod future;
pub mod ldap_protocol;
pub mod pool;
pub mod tls;

pub use config::Config;
pub use connection::{
    AbandonPolicy, Connection, ConnectionEventListener, ConnectionOptions, Request, SearchItem, SearchResult,
    SecurityLayer,
};
pub use error::{DecodeError, LdapError, ResultCode};
pub use extended::{DecoderRegistry, ExtendedResult, ExtendedResultDecoder};
pub use factory::{ConnectionFactory, LdapConnectionFactory};
pub use filter::Filter;
pub use future::FutureResult;
pub use ldap_protocol::{Control, LdapMessage, LdapResult, ProtocolOp};
pub use pool::{ConnectionPool, PooledConnection};
