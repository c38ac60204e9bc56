
pub use stub_connection::StubConnection;
pub use stub_rendezvous::StubRendezvous;
