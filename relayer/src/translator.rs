// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Translation of watched events into destination-chain calls.
//!
//! A translator produces a ready-to-broadcast call, `None` when the event
//! needs no transaction, or a typed reason why no call should be made.
//! "Nothing to do" outcomes (already processed, not enough signatures,
//! unauthorized signer) are ordinary business results, not failures; the
//! sender skips the task instead of retrying it.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature, TransactionRequest, H256};
use ethers::utils::id;
use thiserror::Error;

use crate::error::{RelayerError, RelayerResult};
use crate::eth_client::ChainApi;
use crate::types::EventTask;

// Argument names the watcher decodes out of the message event.
const ARG_MESSAGE: &str = "message";
const ARG_SIGNATURES: &str = "signatures";
const ARG_MESSAGE_ID: &str = "messageId";

const SIGNATURE_LEN: usize = 65;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("event {reference} was already relayed")]
    AlreadyProcessed { reference: String },
    #[error("collected {collected} signatures, need {required}")]
    SignaturesBelowThreshold { collected: usize, required: usize },
    #[error("signer {signer} is not authorized")]
    UnauthorizedSigner { signer: String },
    #[error(transparent)]
    Chain(#[from] RelayerError),
}

impl TranslateError {
    /// True when the event needs no broadcast. These outcomes complete the
    /// task; everything else is a failure to retry.
    pub fn is_noop(&self) -> bool {
        matches!(
            self,
            TranslateError::AlreadyProcessed { .. }
                | TranslateError::SignaturesBelowThreshold { .. }
                | TranslateError::UnauthorizedSigner { .. }
        )
    }
}

#[async_trait]
pub trait EventTranslator: Send + Sync {
    async fn translate(
        &self,
        task: &EventTask,
    ) -> Result<Option<TransactionRequest>, TranslateError>;
}

/// Relays signed cross-chain messages into the destination message contract.
///
/// The event carries the message payload, its id and the off-chain collected
/// signatures. Translation verifies the signatures against the authorized
/// signer set, checks on chain that the message was not relayed yet, and
/// composes the relay call.
pub struct MessageRelayTranslator {
    chain: Arc<dyn ChainApi>,
    contract: Address,
    relay_function: String,
    processed_function: String,
    authorized_signers: BTreeSet<Address>,
    signature_threshold: usize,
}

impl MessageRelayTranslator {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        contract: Address,
        relay_function: String,
        processed_function: String,
        authorized_signers: impl IntoIterator<Item = Address>,
        signature_threshold: usize,
    ) -> Self {
        Self {
            chain,
            contract,
            relay_function,
            processed_function,
            authorized_signers: authorized_signers.into_iter().collect(),
            signature_threshold,
        }
    }

    fn arg<'a>(&self, task: &'a EventTask, name: &str) -> Result<&'a str, TranslateError> {
        task.event.args.get(name).map(|s| s.as_str()).ok_or_else(|| {
            TranslateError::Chain(RelayerError::SerializationError(format!(
                "event {} is missing argument {}",
                task.reference(),
                name
            )))
        })
    }

    fn parse_bytes(&self, raw: &str, name: &str) -> Result<Bytes, TranslateError> {
        raw.parse::<Bytes>().map_err(|e| {
            TranslateError::Chain(RelayerError::SerializationError(format!(
                "argument {} is not hex bytes: {}",
                name, e
            )))
        })
    }

    /// Recover the distinct authorized signers behind `signatures`.
    fn verify_signatures(
        &self,
        message: &Bytes,
        signatures: &Bytes,
    ) -> Result<(), TranslateError> {
        if signatures.len() % SIGNATURE_LEN != 0 {
            return Err(TranslateError::Chain(RelayerError::SerializationError(
                format!(
                    "signature blob length {} is not a multiple of {}",
                    signatures.len(),
                    SIGNATURE_LEN
                ),
            )));
        }
        let mut signers = BTreeSet::new();
        for chunk in signatures.chunks(SIGNATURE_LEN) {
            let signature = Signature::try_from(chunk).map_err(|e| {
                TranslateError::Chain(RelayerError::SerializationError(format!(
                    "malformed signature: {}",
                    e
                )))
            })?;
            let signer = signature.recover(message.to_vec()).map_err(|e| {
                TranslateError::Chain(RelayerError::SerializationError(format!(
                    "signature does not recover: {}",
                    e
                )))
            })?;
            if !self.authorized_signers.contains(&signer) {
                return Err(TranslateError::UnauthorizedSigner {
                    signer: format!("{:?}", signer),
                });
            }
            signers.insert(signer);
        }
        if signers.len() < self.signature_threshold {
            return Err(TranslateError::SignaturesBelowThreshold {
                collected: signers.len(),
                required: self.signature_threshold,
            });
        }
        Ok(())
    }

    async fn is_processed(&self, message_id: H256) -> RelayerResult<bool> {
        let mut data = id(&self.processed_function).to_vec();
        data.extend(ethers::abi::encode(&[Token::FixedBytes(
            message_id.as_bytes().to_vec(),
        )]));
        let call: TypedTransaction = TransactionRequest::new()
            .to(self.contract)
            .data(data)
            .into();
        let output = self.chain.call(&call).await?;
        Ok(output.last().copied().unwrap_or(0) != 0)
    }

    fn relay_calldata(&self, message: &Bytes, signatures: &Bytes) -> Vec<u8> {
        let mut data = id(&self.relay_function).to_vec();
        data.extend(ethers::abi::encode(&[
            Token::Bytes(message.to_vec()),
            Token::Bytes(signatures.to_vec()),
        ]));
        data
    }
}

#[async_trait]
impl EventTranslator for MessageRelayTranslator {
    async fn translate(
        &self,
        task: &EventTask,
    ) -> Result<Option<TransactionRequest>, TranslateError> {
        let message = self.parse_bytes(self.arg(task, ARG_MESSAGE)?, ARG_MESSAGE)?;
        let signatures = self.parse_bytes(self.arg(task, ARG_SIGNATURES)?, ARG_SIGNATURES)?;
        let message_id: H256 = self.arg(task, ARG_MESSAGE_ID)?.parse().map_err(|e| {
            TranslateError::Chain(RelayerError::SerializationError(format!(
                "argument {} is not a hash: {}",
                ARG_MESSAGE_ID, e
            )))
        })?;

        self.verify_signatures(&message, &signatures)?;

        if self.is_processed(message_id).await? {
            return Err(TranslateError::AlreadyProcessed {
                reference: task.reference(),
            });
        }

        Ok(Some(
            TransactionRequest::new()
                .to(self.contract)
                .data(self.relay_calldata(&message, &signatures)),
        ))
    }
}
