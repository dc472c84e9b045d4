// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Scripted fakes shared by the component tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{HumanReadableParser, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Log, TransactionReceipt, TransactionRequest, H256, U256, U64,
};
use ethers::utils::keccak256;

use crate::error::{RelayerError, RelayerResult};
use crate::eth_client::{ChainApi, SignedTransaction};
use crate::translator::{EventTranslator, TranslateError};
use crate::types::{EventTask, RelayEvent};

pub const TEST_EVENT_ABI: &str =
    "event MessageSent(bytes32 indexed messageId, bytes message, bytes signatures)";

/// Deterministic wallets for signature fixtures.
pub fn test_wallets(count: usize) -> Vec<LocalWallet> {
    (1..=count)
        .map(|i| {
            format!("{:064x}", i)
                .parse::<LocalWallet>()
                .unwrap()
                .with_chain_id(31337u64)
        })
        .collect()
}

/// ABI-encoded `bool` return value.
pub fn encoded_bool(value: bool) -> Bytes {
    let mut out = vec![0u8; 32];
    out[31] = value as u8;
    Bytes::from(out)
}

/// An event task carrying a message signed by each of `wallets`, shaped the
/// way the watcher would decode it.
pub async fn signed_message_task(wallets: &[LocalWallet]) -> EventTask {
    let message = Bytes::from_static(b"bridge message #1");
    let message_id = H256::from(keccak256(&message));
    let mut signatures = Vec::new();
    for wallet in wallets {
        let signature = wallet.sign_message(message.to_vec()).await.unwrap();
        signatures.extend(signature.to_vec());
    }
    let log = message_event_log(
        Address::repeat_byte(0x13),
        message_id,
        &message,
        &signatures,
        4100,
        H256::repeat_byte(0x11),
        0,
    );
    let mut args = BTreeMap::new();
    args.insert("message".to_string(), message.to_string());
    args.insert(
        "signatures".to_string(),
        Bytes::from(signatures).to_string(),
    );
    args.insert("messageId".to_string(), format!("{:?}", message_id));
    EventTask::new(
        "eth-to-stc".to_string(),
        RelayEvent {
            tx_hash: H256::repeat_byte(0x11),
            block_number: 4100,
            log_index: 0,
            address: log.address,
            topics: log.topics,
            data: log.data,
            event_name: "MessageSent".to_string(),
            args,
        },
    )
}

/// A raw log for [`TEST_EVENT_ABI`], as the source chain would return it.
pub fn message_event_log(
    contract: Address,
    message_id: H256,
    message: &[u8],
    signatures: &[u8],
    block_number: u64,
    tx_hash: H256,
    log_index: u64,
) -> Log {
    let event = HumanReadableParser::parse_event(TEST_EVENT_ABI).unwrap();
    let data = ethers::abi::encode(&[
        Token::Bytes(message.to_vec()),
        Token::Bytes(signatures.to_vec()),
    ]);
    Log {
        address: contract,
        topics: vec![event.signature(), message_id],
        data: Bytes::from(data),
        block_number: Some(U64::from(block_number)),
        transaction_hash: Some(tx_hash),
        log_index: Some(U256::from(log_index)),
        ..Default::default()
    }
}

/// A mined receipt with the given status bit.
pub fn receipt_with_status(tx_hash: H256, success: bool, block_number: u64) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash,
        status: Some(U64::from(success as u64)),
        block_number: Some(U64::from(block_number)),
        ..Default::default()
    }
}

type Scripted<T> = Mutex<VecDeque<RelayerResult<T>>>;

/// A [`ChainApi`] whose answers are queued by the test. Signing is real (a
/// throwaway wallet), so broadcast hashes behave like production ones.
pub struct MockChain {
    chain_name: String,
    wallet: LocalWallet,
    chain_id: u64,
    block_number: AtomicU64,
    logs: Scripted<Vec<Log>>,
    log_ranges: Mutex<Vec<(u64, u64)>>,
    tx_counts: Scripted<u64>,
    receipts: Scripted<Option<TransactionReceipt>>,
    estimates: Scripted<U256>,
    calls: Scripted<Bytes>,
    gas_prices: Scripted<U256>,
    send_results: Mutex<VecDeque<Result<(), RelayerError>>>,
    send_delay: Mutex<Option<Duration>>,
    receipt_delay: Mutex<Option<Duration>>,
    signed_requests: Mutex<Vec<TransactionRequest>>,
    sent_raw: Mutex<Vec<Bytes>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            chain_name: "mock".to_string(),
            wallet: test_wallets(1).remove(0),
            chain_id: 31337,
            block_number: AtomicU64::new(0),
            logs: Mutex::new(VecDeque::new()),
            log_ranges: Mutex::new(Vec::new()),
            tx_counts: Mutex::new(VecDeque::new()),
            receipts: Mutex::new(VecDeque::new()),
            estimates: Mutex::new(VecDeque::new()),
            calls: Mutex::new(VecDeque::new()),
            gas_prices: Mutex::new(VecDeque::new()),
            send_results: Mutex::new(VecDeque::new()),
            send_delay: Mutex::new(None),
            receipt_delay: Mutex::new(None),
            signed_requests: Mutex::new(Vec::new()),
            sent_raw: Mutex::new(Vec::new()),
        }
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    pub fn set_block_number(&self, height: u64) {
        self.block_number.store(height, Ordering::SeqCst);
    }

    pub fn push_logs(&self, result: RelayerResult<Vec<Log>>) {
        self.logs.lock().unwrap().push_back(result);
    }

    pub fn log_ranges(&self) -> Vec<(u64, u64)> {
        self.log_ranges.lock().unwrap().clone()
    }

    pub fn push_transaction_count(&self, result: RelayerResult<u64>) {
        self.tx_counts.lock().unwrap().push_back(result);
    }

    pub fn push_receipt(&self, result: RelayerResult<Option<TransactionReceipt>>) {
        self.receipts.lock().unwrap().push_back(result);
    }

    pub fn push_estimate(&self, result: RelayerResult<U256>) {
        self.estimates.lock().unwrap().push_back(result);
    }

    pub fn push_call_result(&self, result: RelayerResult<Bytes>) {
        self.calls.lock().unwrap().push_back(result);
    }

    pub fn push_gas_price(&self, result: RelayerResult<U256>) {
        self.gas_prices.lock().unwrap().push_back(result);
    }

    /// Queue the outcome of the next broadcast. `Ok(())` answers with the
    /// payload's own hash, like a healthy node.
    pub fn push_send_result(&self, result: Result<(), RelayerError>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_receipt_delay(&self, delay: Duration) {
        *self.receipt_delay.lock().unwrap() = Some(delay);
    }

    pub fn signed_requests(&self) -> Vec<TransactionRequest> {
        self.signed_requests.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent_raw.lock().unwrap().len()
    }
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainApi for MockChain {
    fn chain_name(&self) -> &str {
        &self.chain_name
    }

    fn signer_address(&self) -> RelayerResult<Address> {
        Ok(self.wallet.address())
    }

    async fn chain_id(&self) -> RelayerResult<u64> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        Ok(self.block_number.load(Ordering::SeqCst))
    }

    async fn get_logs(
        &self,
        _address: Address,
        _topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<Log>> {
        self.log_ranges.lock().unwrap().push((from_block, to_block));
        self.logs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn transaction_count(&self, _address: Address) -> RelayerResult<u64> {
        self.tx_counts.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(RelayerError::Generic(
                "mock: no transaction_count scripted".to_string(),
            ))
        })
    }

    async fn transaction_receipt(
        &self,
        _tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        let delay = *self.receipt_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.receipts.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> RelayerResult<U256> {
        self.estimates
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(U256::from(100_000)))
    }

    async fn call(&self, _tx: &TypedTransaction) -> RelayerResult<Bytes> {
        self.calls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(encoded_bool(false)))
    }

    async fn gas_price(&self) -> RelayerResult<U256> {
        self.gas_prices
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(crate::gas_price::gwei(10)))
    }

    async fn sign_transaction(&self, tx: TransactionRequest) -> RelayerResult<SignedTransaction> {
        let nonce = tx
            .nonce
            .ok_or_else(|| {
                RelayerError::Generic("refusing to sign a transaction without a nonce".to_string())
            })?
            .as_u64();
        self.signed_requests.lock().unwrap().push(tx.clone());
        let typed = TypedTransaction::Legacy(tx);
        let signature = self
            .wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| RelayerError::Generic(e.to_string()))?;
        let raw = typed.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        Ok(SignedTransaction { hash, raw, nonce })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self
            .send_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        match result {
            Ok(()) => {
                let hash = H256::from(keccak256(&raw));
                self.sent_raw.lock().unwrap().push(raw);
                Ok(hash)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl crate::gas_price::ChainGasOracle for MockChain {
    async fn gas_price(&self) -> RelayerResult<U256> {
        ChainApi::gas_price(self).await
    }
}

/// Queued translation outcomes; defaults to a minimal relay call.
pub struct ScriptedTranslator {
    outcomes: Mutex<VecDeque<Result<Option<TransactionRequest>, TranslateError>>>,
    translated: AtomicU64,
}

impl ScriptedTranslator {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            translated: AtomicU64::new(0),
        }
    }

    pub fn push(&self, outcome: Result<Option<TransactionRequest>, TranslateError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn translate_calls(&self) -> u64 {
        self.translated.load(Ordering::SeqCst)
    }

    pub fn default_request() -> TransactionRequest {
        TransactionRequest::new()
            .to(Address::repeat_byte(0xaa))
            .data(vec![0xde, 0xad, 0xbe, 0xef])
    }
}

impl Default for ScriptedTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventTranslator for ScriptedTranslator {
    async fn translate(
        &self,
        _task: &EventTask,
    ) -> Result<Option<TransactionRequest>, TranslateError> {
        self.translated.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Some(Self::default_request())))
    }
}
