//! SQLite database for the Fluxgate panel.

pub use fluxgate_core::db::DatabaseError;

fluxgate_core::define_database!(PanelDatabase, "Panel database migrations complete");
