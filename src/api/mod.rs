// API module
//
// This module contains the HTTP surface over the ledger

pub mod handlers;
pub mod routes;

// Re-export main components for easier access
pub use handlers::LedgerData;
pub use routes::configure_routes;
