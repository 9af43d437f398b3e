use std::sync::Mutex;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;

use config::NodeConfig;

// Open the configured store and load the chain, or create a genesis block
fn initialize_blockchain(config: &NodeConfig) -> anyhow::Result<blockchain::Blockchain> {
    let consensus = config
        .build_consensus()
        .context("Invalid consensus configuration")?;
    let store = config
        .build_store()
        .with_context(|| format!("Failed to open store at {}", config.data_path.display()))?;

    info!(
        "Opening {} ledger ({:?} store at {})",
        consensus.mode(),
        config.store,
        config.data_path.display()
    );

    let blockchain = if config.strict_load {
        blockchain::Blockchain::open_verified(consensus, store)?
    } else {
        blockchain::Blockchain::open(consensus, store)?
    };

    if !blockchain.is_valid() {
        warn!("Serving a chain that fails validation; set LEDGER_STRICT_LOAD=true to refuse it");
    }

    info!(
        "Ledger ready with {} blocks, last hash {}",
        blockchain.len(),
        blockchain.last_block().hash()
    );

    Ok(blockchain)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::add_record,
        api::handlers::validate_chain,
        api::handlers::get_stakes,
        api::handlers::set_stakes,
        api::handlers::merkle_root,
        api::handlers::merkle_verify,
        api::handlers::chain_merkle_root
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Proof,
            blockchain::ConsensusMode,
            blockchain::ChainViolation,
            blockchain::ViolationKind,
            api::handlers::ChainResponse,
            api::handlers::RecordRequest,
            api::handlers::RecordResponse,
            api::handlers::ValidationResponse,
            api::handlers::StakesBody,
            api::handlers::MerkleRootRequest,
            api::handlers::MerkleRootResponse,
            api::handlers::MerkleVerifyRequest,
            api::handlers::MerkleVerifyResponse
        )
    ),
    tags(
        (name = "ledger", description = "Ledger API endpoints")
    ),
    info(
        title = "Hash Ledger API",
        version = "0.1.0",
        description = "Append-only hash-linked ledger with proof-of-work or proof-of-stake sealing",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::from_env().context("Invalid configuration")?;
    let ledger = web::Data::new(Mutex::new(initialize_blockchain(&config)?));

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(ledger.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    Ok(())
}
