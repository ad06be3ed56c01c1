// herald-client: outbound connection to a broker.
//
// Used by producers that publish events and by the broker's own relay,
// which both forwards local events upstream and re-injects events the
// upstream fans back down.

mod connection;

pub use connection::{ClientError, ConnectOptions, Connection, Incoming, TlsMode};
