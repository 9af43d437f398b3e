use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use actix_web::{web, HttpResponse, Responder};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::blockchain::{
    Block, Blockchain, BlockchainError, ChainViolation, ConsensusError, ConsensusMode,
    MerkleTree, StakeRegistry,
};

/// Data structure for the blockchain state
pub type LedgerData = web::Data<Mutex<Blockchain>>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The consensus mode sealing new blocks
    pub mode: ConsensusMode,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Request for the record endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RecordRequest {
    /// Field name to value mapping stored as the block payload
    #[schema(value_type = Object)]
    pub payload: Value,
}

/// Response for the record endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RecordResponse {
    /// The message
    pub message: String,

    /// The newly sealed block
    pub block: Block,
}

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    /// Whether the chain is valid
    pub is_valid: bool,

    /// Every violation found
    pub violations: Vec<ChainViolation>,
}

/// Stakes of a proof-of-stake chain
#[derive(Serialize, Deserialize, ToSchema)]
pub struct StakesBody {
    /// Identity to stake weight
    pub stakes: BTreeMap<String, f64>,
}

/// Request for the Merkle root endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MerkleRootRequest {
    /// Ordered leaves
    pub leaves: Vec<String>,
}

/// Response for the Merkle root endpoints
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MerkleRootResponse {
    /// Hex-encoded root hash
    pub root_hash: String,

    /// Number of leaves
    pub leaf_count: usize,
}

/// Request for the Merkle verify endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MerkleVerifyRequest {
    /// The claimed root hash
    pub root_hash: String,

    /// Every leaf, in order
    pub leaves: Vec<String>,
}

/// Response for the Merkle verify endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MerkleVerifyResponse {
    /// Whether the leaves rebuild to the claimed root
    pub valid: bool,
}

fn error_body(message: String) -> Value {
    serde_json::json!({ "error": message })
}

fn unavailable() -> HttpResponse {
    HttpResponse::InternalServerError().json(error_body("Ledger state is unavailable".to_string()))
}

fn lock(ledger: &LedgerData) -> Result<MutexGuard<'_, Blockchain>, HttpResponse> {
    ledger.lock().map_err(|_| unavailable())
}

fn blockchain_error_response(err: BlockchainError) -> HttpResponse {
    let body = error_body(format!("Failed to add record: {}", err));
    match err {
        BlockchainError::ConsensusError(ConsensusError::Stake(_))
        | BlockchainError::ConsensusError(ConsensusError::ModeMismatch { .. }) => {
            HttpResponse::Conflict().json(body)
        }
        BlockchainError::ConsensusError(ConsensusError::MiningCutoff { .. }) => {
            HttpResponse::ServiceUnavailable().json(body)
        }
        BlockchainError::StorageError(_) | BlockchainError::IntegrityViolation(_) => {
            HttpResponse::InternalServerError().json(body)
        }
    }
}

/// Get the full blockchain
///
/// Returns the entire blockchain and its validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(ledger: LedgerData) -> impl Responder {
    let blockchain = match lock(&ledger) {
        Ok(blockchain) => blockchain,
        Err(response) => return response,
    };

    let response = ChainResponse {
        length: blockchain.len(),
        mode: blockchain.mode(),
        chain: blockchain.blocks().to_vec(),
        is_valid: blockchain.is_valid(),
    };

    HttpResponse::Ok().json(response)
}

/// Add a record
///
/// Seals a new block carrying the payload and appends it to the chain
#[utoipa::path(
    post,
    path = "/api/v1/records",
    request_body = RecordRequest,
    responses(
        (status = 201, description = "Block appended successfully", body = RecordResponse),
        (status = 400, description = "Payload is not an object"),
        (status = 409, description = "No validator could be selected"),
        (status = 503, description = "Mining attempt limit reached"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn add_record(
    ledger: LedgerData,
    record_req: web::Json<RecordRequest>,
) -> impl Responder {
    let payload = record_req.into_inner().payload;
    if !payload.is_object() {
        return HttpResponse::BadRequest()
            .json(error_body("Payload must be a JSON object".to_string()));
    }

    // Mining is CPU bound; keep it off the async workers
    let outcome = web::block(move || {
        let mut blockchain = ledger.lock().ok()?;
        Some(blockchain.append(payload))
    })
    .await;

    match outcome {
        Ok(Some(Ok(block))) => HttpResponse::Created().json(RecordResponse {
            message: "Block added successfully".to_string(),
            block,
        }),
        Ok(Some(Err(err))) => {
            warn!("Rejected record: {}", err);
            blockchain_error_response(err)
        }
        Ok(None) | Err(_) => unavailable(),
    }
}

/// Check if the blockchain is valid
///
/// Validates the entire blockchain and lists every violation
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = ValidationResponse)
    )
)]
pub async fn validate_chain(ledger: LedgerData) -> impl Responder {
    let blockchain = match lock(&ledger) {
        Ok(blockchain) => blockchain,
        Err(response) => return response,
    };

    let violations = blockchain.validate();
    HttpResponse::Ok().json(ValidationResponse {
        is_valid: violations.is_empty(),
        violations,
    })
}

/// Get the validator stakes
#[utoipa::path(
    get,
    path = "/api/v1/stakes",
    responses(
        (status = 200, description = "Stakes retrieved successfully", body = StakesBody),
        (status = 409, description = "Chain does not use proof of stake")
    )
)]
pub async fn get_stakes(ledger: LedgerData) -> impl Responder {
    let blockchain = match lock(&ledger) {
        Ok(blockchain) => blockchain,
        Err(response) => return response,
    };

    match blockchain.consensus().stake_registry() {
        Some(registry) => HttpResponse::Ok().json(StakesBody {
            stakes: registry.clone().into(),
        }),
        None => HttpResponse::Conflict()
            .json(error_body("Chain does not use proof of stake".to_string())),
    }
}

/// Replace the validator stakes
///
/// Applies to every block appended afterwards
#[utoipa::path(
    put,
    path = "/api/v1/stakes",
    request_body = StakesBody,
    responses(
        (status = 200, description = "Stakes replaced", body = StakesBody),
        (status = 400, description = "Invalid stake"),
        (status = 409, description = "Chain does not use proof of stake")
    )
)]
pub async fn set_stakes(ledger: LedgerData, stakes_req: web::Json<StakesBody>) -> impl Responder {
    let registry = match StakeRegistry::try_from(stakes_req.into_inner().stakes) {
        Ok(registry) => registry,
        Err(err) => {
            return HttpResponse::BadRequest().json(error_body(format!("Invalid stakes: {}", err)))
        }
    };

    let mut blockchain = match lock(&ledger) {
        Ok(blockchain) => blockchain,
        Err(response) => return response,
    };

    match blockchain.set_stake_registry(registry.clone()) {
        Ok(()) => HttpResponse::Ok().json(StakesBody {
            stakes: registry.into(),
        }),
        Err(err) => HttpResponse::Conflict().json(error_body(err.to_string())),
    }
}

/// Compute a Merkle root
#[utoipa::path(
    post,
    path = "/api/v1/merkle/root",
    request_body = MerkleRootRequest,
    responses(
        (status = 200, description = "Root computed", body = MerkleRootResponse),
        (status = 400, description = "No leaves supplied")
    )
)]
pub async fn merkle_root(root_req: web::Json<MerkleRootRequest>) -> impl Responder {
    match MerkleTree::build(&root_req.leaves) {
        Ok(tree) => HttpResponse::Ok().json(MerkleRootResponse {
            root_hash: tree.root_hash(),
            leaf_count: tree.leaf_count(),
        }),
        Err(err) => HttpResponse::BadRequest().json(error_body(err.to_string())),
    }
}

/// Verify a Merkle root
///
/// Rebuilds the tree from every leaf and compares roots
#[utoipa::path(
    post,
    path = "/api/v1/merkle/verify",
    request_body = MerkleVerifyRequest,
    responses(
        (status = 200, description = "Verification result", body = MerkleVerifyResponse),
        (status = 400, description = "No leaves supplied")
    )
)]
pub async fn merkle_verify(verify_req: web::Json<MerkleVerifyRequest>) -> impl Responder {
    match MerkleTree::verify(&verify_req.root_hash, &verify_req.leaves) {
        Ok(valid) => HttpResponse::Ok().json(MerkleVerifyResponse { valid }),
        Err(err) => HttpResponse::BadRequest().json(error_body(err.to_string())),
    }
}

/// Merkle root over the chain's block hashes
#[utoipa::path(
    get,
    path = "/api/v1/chain/merkle-root",
    responses(
        (status = 200, description = "Root computed", body = MerkleRootResponse)
    )
)]
pub async fn chain_merkle_root(ledger: LedgerData) -> impl Responder {
    let blockchain = match lock(&ledger) {
        Ok(blockchain) => blockchain,
        Err(response) => return response,
    };

    match blockchain.merkle_tree() {
        Ok(tree) => HttpResponse::Ok().json(MerkleRootResponse {
            root_hash: tree.root_hash(),
            leaf_count: tree.leaf_count(),
        }),
        Err(err) => HttpResponse::InternalServerError().json(error_body(err.to_string())),
    }
}
