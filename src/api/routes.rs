use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/chain/merkle-root", web::get().to(handlers::chain_merkle_root))
            .route("/records", web::post().to(handlers::add_record))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/stakes", web::get().to(handlers::get_stakes))
            .route("/stakes", web::put().to(handlers::set_stakes))
            .route("/merkle/root", web::post().to(handlers::merkle_root))
            .route("/merkle/verify", web::post().to(handlers::merkle_verify))
    );
}
