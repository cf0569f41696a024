// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - WIRE PROTOCOL
//
// Shared envelope for the chain stream and the sandbox stream.
// - Generated tonic/prost types from forge.proto
// - ContractKey: the (chain, contract, version, index) routing tuple
// - EngineError: the error taxonomy surfaced to the chain
// - Envelope constructors used by every engine component
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::{Deserialize, Serialize};
use std::fmt;

// Include generated protobuf code
pub mod proto {
    tonic::include_proto!("forge");
}

pub use proto::{
    ContractId, CrossContext, ErrorPayload, MsgType, RespCode, StepDuration, TxMessage,
};

/// Hard ceiling on nested cross-contract call depth. A tx whose
/// `cross_context.current_depth` exceeds this is rejected synchronously,
/// before any sandbox is involved.
pub const CALL_CONTRACT_DEPTH: u32 = 5;

/// Method name the chain uses for first-time contract deployment.
pub const METHOD_INIT_CONTRACT: &str = "init_contract";
/// Method name the chain uses for contract upgrades.
pub const METHOD_UPGRADE_CONTRACT: &str = "upgrade_contract";

/// Separator for canonical contract keys and process names.
pub const KEY_SEPARATOR: char = '#';

/// The unit of routing and sandbox affinity. Two contracts with the same
/// name but different versions or indices are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractKey {
    pub chain_id: String,
    pub contract_name: String,
    pub contract_version: String,
    pub contract_index: u32,
}

impl ContractKey {
    pub fn new(chain_id: &str, name: &str, version: &str, index: u32) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            contract_name: name.to_string(),
            contract_version: version.to_string(),
            contract_index: index,
        }
    }

    /// Canonical `#`-joined form, used for map keys, file names and the
    /// leading segments of process names.
    pub fn canonical(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.chain_id,
            self.contract_name,
            self.contract_version,
            self.contract_index,
            sep = KEY_SEPARATOR,
        )
    }

    pub fn from_contract_id(id: &ContractId) -> Self {
        Self {
            chain_id: id.chain_id.clone(),
            contract_name: id.contract_name.clone(),
            contract_version: id.contract_version.clone(),
            contract_index: id.contract_index,
        }
    }

    pub fn to_contract_id(&self) -> ContractId {
        ContractId {
            chain_id: self.chain_id.clone(),
            contract_name: self.contract_name.clone(),
            contract_version: self.contract_version.clone(),
            contract_index: self.contract_index,
        }
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Error kinds surfaced to the chain in tx responses.
///
/// Every variant maps to exactly one failure path in the engine; the chain
/// distinguishes them by `ErrorPayload.code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `current_depth` exceeded [`CALL_CONTRACT_DEPTH`].
    DepthExceeded(u32),
    /// The busy timer fired while a sandbox was executing the tx.
    TxTimeout(String),
    /// The sandbox exited unexpectedly mid-tx.
    RuntimePanic(String),
    /// The chain returned FAIL for a bytecode fetch, or the fetch timed out.
    GetBytecode(String),
    /// The contract binary was missing on disk at spawn time.
    ContractNotExist(String),
    /// The sandbox binary failed to start (loader-level failure).
    ContractExec(String),
    /// The tx was drained during Request Group teardown.
    GroupExited,
}

impl EngineError {
    /// Stable numeric code carried in `ErrorPayload.code`.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::DepthExceeded(_) => 1,
            EngineError::TxTimeout(_) => 2,
            EngineError::RuntimePanic(_) => 3,
            EngineError::GetBytecode(_) => 4,
            EngineError::ContractNotExist(_) => 5,
            EngineError::ContractExec(_) => 6,
            EngineError::GroupExited => 7,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::DepthExceeded(limit) => write!(f, "current depth exceed {}", limit),
            EngineError::TxTimeout(detail) => write!(f, "tx timeout: {}", detail),
            EngineError::RuntimePanic(detail) => write!(f, "runtime panic: {}", detail),
            EngineError::GetBytecode(detail) => write!(f, "get bytecode failed: {}", detail),
            EngineError::ContractNotExist(path) => {
                write!(f, "contract not exist: {}", path)
            }
            EngineError::ContractExec(detail) => write!(f, "contract exec error: {}", detail),
            EngineError::GroupExited => write!(f, "request group exited"),
        }
    }
}

impl TxMessage {
    /// Extract the contract key, from whichever payload carries one.
    pub fn contract_key(&self) -> Option<ContractKey> {
        let id = match MsgType::try_from(self.r#type).unwrap_or(MsgType::Undefined) {
            MsgType::TxRequest => self.request.as_ref().and_then(|r| r.contract.as_ref()),
            MsgType::GetBytecodeRequest => self
                .get_bytecode_request
                .as_ref()
                .and_then(|r| r.contract.as_ref()),
            _ => None,
        }?;
        Some(ContractKey::from_contract_id(id))
    }

    pub fn msg_type(&self) -> MsgType {
        MsgType::try_from(self.r#type).unwrap_or(MsgType::Undefined)
    }

    pub fn current_depth(&self) -> u32 {
        self.cross_context
            .as_ref()
            .map(|c| c.current_depth)
            .unwrap_or(0)
    }

    pub fn process_name(&self) -> &str {
        self.cross_context
            .as_ref()
            .map(|c| c.process_name.as_str())
            .unwrap_or("")
    }

    pub fn method(&self) -> &str {
        self.request
            .as_ref()
            .map(|r| r.method.as_str())
            .unwrap_or("")
    }

    /// True for `init_contract` / `upgrade_contract` deployment txs, whose
    /// failure condemns the cached binary.
    pub fn is_deploy_tx(&self) -> bool {
        matches!(self.method(), METHOD_INIT_CONTRACT | METHOD_UPGRADE_CONTRACT)
    }
}

/// Build an ERROR envelope for the chain.
pub fn error_msg(chain_id: &str, tx_id: &str, err: &EngineError) -> TxMessage {
    TxMessage {
        r#type: MsgType::Error as i32,
        chain_id: chain_id.to_string(),
        tx_id: tx_id.to_string(),
        error: Some(ErrorPayload {
            code: err.code(),
            message: err.to_string(),
        }),
        ..Default::default()
    }
}

/// Build a GET_BYTECODE_REQUEST envelope, keyed by the tx that needs it.
pub fn bytecode_request_msg(tx_id: &str, key: &ContractKey) -> TxMessage {
    TxMessage {
        r#type: MsgType::GetBytecodeRequest as i32,
        chain_id: key.chain_id.clone(),
        tx_id: tx_id.to_string(),
        get_bytecode_request: Some(proto::GetBytecodeRequest {
            contract: Some(key.to_contract_id()),
        }),
        ..Default::default()
    }
}

/// Build a REGISTER envelope (sandbox side; used by tests and the SDK).
pub fn register_msg(process_name: &str) -> TxMessage {
    TxMessage {
        r#type: MsgType::Register as i32,
        cross_context: Some(CrossContext {
            process_name: process_name.to_string(),
            current_depth: 0,
        }),
        ..Default::default()
    }
}
