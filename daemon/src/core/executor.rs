use async_trait::async_trait;

use ghostchain_common::crypto::Address;

use super::error::BlockchainError;

/// Capability the chain holds to run contract calls. Transactions carry
/// no contract-call flag yet, so the chain never invokes it on its own;
/// the seam exists for the staking and naming collaborators that mutate
/// state through contracts.
#[async_trait]
pub trait ContractExecutor: Send + Sync {
    async fn execute(
        &self,
        sender: Address,
        target: Address,
        payload: &[u8],
        gas_limit: u64,
    ) -> Result<(), BlockchainError>;
}

/// Default executor: accepts nothing.
pub struct NoopExecutor;

#[async_trait]
impl ContractExecutor for NoopExecutor {
    async fn execute(
        &self,
        _sender: Address,
        target: Address,
        _payload: &[u8],
        _gas_limit: u64,
    ) -> Result<(), BlockchainError> {
        Err(BlockchainError::ContractExecution(format!(
            "no contract executor installed, call to {} rejected",
            target
        )))
    }
}
