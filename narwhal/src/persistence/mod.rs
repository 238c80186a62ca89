/// PostgreSQL-backed run store.
pub mod postgres;

pub use postgres::PostgresRunStore;
