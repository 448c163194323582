pub mod postgres;

pub use postgres::{PgConnectionManager, PgSessionStore, redact_url};
