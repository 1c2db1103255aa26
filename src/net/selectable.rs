use std::any::Any;
use std::time::Duration;
use crate::addr::IpPort;

/// Something the [crate::net::multiplexer::Multiplexer] waits on: a socket with read / write
///  interest and a timeout.
///
/// The multiplexer registers sockets edge triggered, so `handle_io` must keep reading (or
///  writing) until the socket would block or the selectable has nothing more to do. It may
///  also be called when the socket is not actually ready, and must tolerate that.
pub trait Selectable: Send + Any {
    fn source(&mut self) -> &mut dyn mio::event::Source;

    fn wants_read(&self) -> bool;
    fn wants_write(&self) -> bool;

    /// Selectables created while handling I/O (e.g. accepted connections) are added to
    ///  `spawned`, the multiplexer takes ownership of them
    fn handle_io(&mut self, readable: bool, writable: bool, spawned: &mut Vec<Box<dyn Selectable>>);

    /// called when the timeout elapsed without I/O resetting it
    fn handle_timeout(&mut self) {}

    /// The time after which this selectable times out, counted from the last time it handled
    ///  I/O. `None` means it never times out, `Some(Duration::ZERO)` requests immediate teardown.
    fn timeout(&self) -> Option<Duration>;

    /// The destination of an outgoing connection that is kept in the connection cache
    fn cached_destination(&self) -> Option<IpPort> {
        None
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
