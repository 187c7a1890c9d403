/*! Connection table and segment dispatch.

The `iface` module owns every connection and listener. It takes in TCP
segments already separated from their IP header, finds the connection,
TIME-WAIT entry or listener each belongs to, runs it through the state
machine, and passes the outcome on to the application and the transmit path.
*/

mod connection_set;
mod interface;
#[cfg(test)]
pub(crate) mod mock;

pub use self::connection_set::{
    ConnectionSet, ConnectionStorage, Handle, ListenError, ListenHandle,
};
pub use self::interface::{
    Application, Config, ConnectError, ConnectionError, Context, Event, Interface, Processed,
    Stats, Transmit, TransmitError, Verdict,
};
