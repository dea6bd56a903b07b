// Extension point for collaborators riding on a session.
//
// A sync module (world state, chat, input, ...) owns its own message kinds.
// The `Communicator` binds every module to each fresh `ClientConnection` and
// unbinds it before that connection is torn down, so a module sees one
// `bind`/`unbind` pair per connection attempt.

use crate::connection::ClientConnection;

pub trait SyncModule {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Register handlers on `connection` and keep its `Outbox` if needed.
    fn bind(&mut self, connection: &mut ClientConnection);

    /// Drop anything tied to the connection from the last `bind`.
    fn unbind(&mut self);
}
