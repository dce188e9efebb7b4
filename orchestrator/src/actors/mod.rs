pub mod session;

pub use session::{SessionActor, SessionArguments, SessionError, SessionKey, SessionMsg};
