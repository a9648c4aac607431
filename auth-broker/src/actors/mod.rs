pub mod pairing_session;

pub use pairing_session::PairingSession;
