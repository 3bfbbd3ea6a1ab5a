//! Transaction signing capability, scoped per wallet.

use anyhow::Result;
use bytes::Bytes;

use argus_common::{Address, TxHash};

use crate::WalletError;

/// An unsigned transaction, as assembled by a wallet caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub from: Address,
    pub nonce: u64,

    /// Opaque unsigned payload; the transport defines its encoding
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub nonce: u64,

    /// Raw signed bytes ready for submission
    pub raw: Bytes,
}

/// Key-holding signer supplied by the integration.
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;

    fn sign(&self, request: &TransactionRequest) -> Result<SignedTransaction>;
}

/// Signing handle handed to transaction builders.
///
/// Restricted to the owning wallet's address: a request for any other
/// address is rejected before it reaches the key.
pub struct WalletSigner<'a> {
    owned: Address,
    signer: &'a dyn TransactionSigner,
}

impl<'a> WalletSigner<'a> {
    pub(crate) fn new(owned: Address, signer: &'a dyn TransactionSigner) -> Self {
        Self { owned, signer }
    }

    pub fn address(&self) -> Address {
        self.owned
    }

    pub fn sign(&self, request: &TransactionRequest) -> Result<SignedTransaction, WalletError> {
        if request.from != self.owned {
            return Err(WalletError::ForeignAddress {
                requested: request.from,
                owned: self.owned,
            });
        }
        self.signer.sign(request).map_err(WalletError::Build)
    }
}
