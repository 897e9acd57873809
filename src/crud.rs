//! Document CRUD operations and range scans on a bucket
//!
//! Every operation builds a binary packet, routes it through the collection
//! resolver and bucket router, and resolves a future from the request
//! callback. Deadlines cancel with the timeout flavor appropriate to the
//! command's idempotency.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::try_stream;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::binary::opcode::{Opcode, Status, datatype};
use crate::binary::packet::{DurabilityFrame, Packet};
use crate::binary::request::QueueRequest;
use crate::bucket::Bucket;
use crate::error::{Error, Result};
use crate::range_scan::{
    ItemCallback, RangeScanContinueOptions, RangeScanContinueResult, RangeScanCreateOptions,
    RangeScanCreateResult, RangeScanItem, continue_extras, parse_documents, parse_keys,
    serialize_create_options,
};
use crate::retry::RetryStrategy;
use typed_builder::TypedBuilder;

/// Addressing and policy shared by read-style operations.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct KeyOptions {
    #[builder(default)]
    pub scope_name: String,
    #[builder(default)]
    pub collection_name: String,
    #[builder(default)]
    pub timeout: Option<Duration>,
    #[builder(default)]
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
}

/// Options for mutating operations.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct StoreOptions {
    #[builder(default)]
    pub scope_name: String,
    #[builder(default)]
    pub collection_name: String,
    #[builder(default = 0)]
    pub flags: u32,
    #[builder(default = 0)]
    pub expiry: u32,
    #[builder(default = 0)]
    pub cas: u64,
    #[builder(default)]
    pub durability: Option<DurabilityFrame>,
    #[builder(default = false)]
    pub preserve_expiry: bool,
    #[builder(default)]
    pub timeout: Option<Duration>,
    #[builder(default)]
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
}

#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct CounterOptions {
    #[builder(default)]
    pub scope_name: String,
    #[builder(default)]
    pub collection_name: String,
    #[builder(default = 1)]
    pub delta: u64,
    #[builder(default = 0)]
    pub initial: u64,
    #[builder(default = 0)]
    pub expiry: u32,
    #[builder(default)]
    pub timeout: Option<Duration>,
    #[builder(default)]
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
    pub datatype: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    pub value: u64,
    pub cas: u64,
}

fn status_to_error(packet: &Packet) -> Result<()> {
    match packet.status_code() {
        Status::Success => Ok(()),
        Status::NotFound => Err(Error::DocumentNotFound),
        Status::Exists | Status::NotStored => Err(Error::DocumentExists),
        Status::Locked => Err(Error::DocumentLocked),
        Status::TemporaryFailure | Status::Busy | Status::OutOfMemory => {
            Err(Error::TemporaryFailure)
        }
        Status::UnknownCollection | Status::UnknownScope => {
            Err(Error::CollectionNotFound(String::from_utf8_lossy(&packet.key).into_owned()))
        }
        Status::AuthError | Status::Eaccess => {
            Err(Error::AuthenticationFailure("access denied".into()))
        }
        Status::DurabilityInvalidLevel | Status::DurabilityImpossible => {
            Err(Error::DurabilityImpossible)
        }
        Status::InvalidArguments => Err(Error::InvalidArgument("rejected by server".into())),
        status => Err(Error::UnexpectedStatus {
            opcode: packet.opcode as u8,
            status: status as u16,
        }),
    }
}

fn parse_get(packet: Packet) -> Result<GetResult> {
    status_to_error(&packet)?;
    let flags = if packet.extras.len() >= 4 {
        u32::from_be_bytes(packet.extras[0..4].try_into().unwrap())
    } else {
        0
    };
    Ok(GetResult { value: packet.value, flags, cas: packet.cas, datatype: packet.datatype })
}

fn parse_mutation(packet: Packet) -> Result<MutationResult> {
    status_to_error(&packet)?;
    Ok(MutationResult { cas: packet.cas })
}

fn parse_counter(packet: Packet) -> Result<CounterResult> {
    status_to_error(&packet)?;
    if packet.value.len() < 8 {
        return Err(Error::ProtocolError("counter response too short".into()));
    }
    Ok(CounterResult {
        value: u64::from_be_bytes(packet.value[0..8].try_into().unwrap()),
        cas: packet.cas,
    })
}

impl Bucket {
    fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.options().key_value_timeout)
    }

    fn effective_strategy(&self, requested: Option<Arc<dyn RetryStrategy>>) -> Arc<dyn RetryStrategy> {
        requested.unwrap_or_else(|| self.options().default_retry_strategy.clone())
    }

    /// Dispatch a one-shot request and await its response packet.
    async fn execute_kv(
        &self,
        packet: Packet,
        scope_name: &str,
        collection_name: &str,
        replica_index: u32,
        retry_strategy: Arc<dyn RetryStrategy>,
        timeout: Duration,
    ) -> Result<Packet> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let request = QueueRequest::build(
            packet,
            Box::new(move |response, error| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send((response, error));
                }
            }),
            false,
            scope_name,
            collection_name,
            replica_index,
            Some(retry_strategy),
        );

        let deadline_request = request.clone();
        let timeout_error = if request.idempotent() {
            Error::UnambiguousTimeout
        } else {
            Error::AmbiguousTimeout
        };
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline_request.cancel(timeout_error);
        });
        request.set_deadline(deadline.abort_handle());

        self.dispatch(request).await?;
        let (response, error) = rx.await.map_err(|_| Error::RequestCanceled)?;
        if let Some(error) = error {
            return Err(error);
        }
        response.ok_or_else(|| Error::ProtocolError("response packet missing".into()))
    }

    pub async fn get(&self, key: impl Into<Vec<u8>>, options: KeyOptions) -> Result<GetResult> {
        let mut packet = Packet::request(Opcode::Get);
        packet.key = key.into();
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                0,
                self.effective_strategy(options.retry_strategy),
                self.effective_timeout(options.timeout),
            )
            .await?;
        parse_get(response)
    }

    pub async fn get_and_touch(
        &self,
        key: impl Into<Vec<u8>>,
        expiry: u32,
        options: KeyOptions,
    ) -> Result<GetResult> {
        let mut packet = Packet::request(Opcode::GetAndTouch);
        packet.key = key.into();
        packet.extras = expiry.to_be_bytes().to_vec();
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                0,
                self.effective_strategy(options.retry_strategy),
                self.effective_timeout(options.timeout),
            )
            .await?;
        parse_get(response)
    }

    pub async fn get_and_lock(
        &self,
        key: impl Into<Vec<u8>>,
        lock_time: u32,
        options: KeyOptions,
    ) -> Result<GetResult> {
        let mut packet = Packet::request(Opcode::GetAndLock);
        packet.key = key.into();
        packet.extras = lock_time.to_be_bytes().to_vec();
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                0,
                self.effective_strategy(options.retry_strategy),
                self.effective_timeout(options.timeout),
            )
            .await?;
        parse_get(response)
    }

    pub async fn unlock(
        &self,
        key: impl Into<Vec<u8>>,
        cas: u64,
        options: KeyOptions,
    ) -> Result<()> {
        let mut packet = Packet::request(Opcode::Unlock);
        packet.key = key.into();
        packet.cas = cas;
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                0,
                self.effective_strategy(options.retry_strategy),
                self.effective_timeout(options.timeout),
            )
            .await?;
        status_to_error(&response)
    }

    pub async fn touch(
        &self,
        key: impl Into<Vec<u8>>,
        expiry: u32,
        options: KeyOptions,
    ) -> Result<MutationResult> {
        let mut packet = Packet::request(Opcode::Touch);
        packet.key = key.into();
        packet.extras = expiry.to_be_bytes().to_vec();
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                0,
                self.effective_strategy(options.retry_strategy),
                self.effective_timeout(options.timeout),
            )
            .await?;
        parse_mutation(response)
    }

    pub async fn upsert(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        options: StoreOptions,
    ) -> Result<MutationResult> {
        self.store(Opcode::Set, key.into(), value.into(), options).await
    }

    pub async fn insert(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        options: StoreOptions,
    ) -> Result<MutationResult> {
        self.store(Opcode::Add, key.into(), value.into(), options).await
    }

    pub async fn replace(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        options: StoreOptions,
    ) -> Result<MutationResult> {
        self.store(Opcode::Replace, key.into(), value.into(), options).await
    }

    async fn store(
        &self,
        opcode: Opcode,
        key: Vec<u8>,
        value: Vec<u8>,
        options: StoreOptions,
    ) -> Result<MutationResult> {
        let mut packet = Packet::request(opcode);
        packet.key = key;
        packet.value = value;
        packet.datatype = datatype::JSON;
        packet.cas = options.cas;
        packet.durability = options.durability;
        packet.preserve_expiry = options.preserve_expiry;
        let mut extras = Vec::with_capacity(8);
        extras.extend_from_slice(&options.flags.to_be_bytes());
        extras.extend_from_slice(&options.expiry.to_be_bytes());
        packet.extras = extras;
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                0,
                self.effective_strategy(options.retry_strategy),
                self.effective_timeout(options.timeout),
            )
            .await?;
        parse_mutation(response)
    }

    pub async fn append(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        options: KeyOptions,
    ) -> Result<MutationResult> {
        self.concat(Opcode::Append, key.into(), value.into(), options).await
    }

    pub async fn prepend(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        options: KeyOptions,
    ) -> Result<MutationResult> {
        self.concat(Opcode::Prepend, key.into(), value.into(), options).await
    }

    async fn concat(
        &self,
        opcode: Opcode,
        key: Vec<u8>,
        value: Vec<u8>,
        options: KeyOptions,
    ) -> Result<MutationResult> {
        let mut packet = Packet::request(opcode);
        packet.key = key;
        packet.value = value;
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                0,
                self.effective_strategy(options.retry_strategy),
                self.effective_timeout(options.timeout),
            )
            .await?;
        parse_mutation(response)
    }

    pub async fn remove(
        &self,
        key: impl Into<Vec<u8>>,
        cas: u64,
        options: KeyOptions,
    ) -> Result<MutationResult> {
        let mut packet = Packet::request(Opcode::Delete);
        packet.key = key.into();
        packet.cas = cas;
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                0,
                self.effective_strategy(options.retry_strategy),
                self.effective_timeout(options.timeout),
            )
            .await?;
        parse_mutation(response)
    }

    pub async fn increment(
        &self,
        key: impl Into<Vec<u8>>,
        options: CounterOptions,
    ) -> Result<CounterResult> {
        self.counter(Opcode::Increment, key.into(), options).await
    }

    pub async fn decrement(
        &self,
        key: impl Into<Vec<u8>>,
        options: CounterOptions,
    ) -> Result<CounterResult> {
        self.counter(Opcode::Decrement, key.into(), options).await
    }

    async fn counter(
        &self,
        opcode: Opcode,
        key: Vec<u8>,
        options: CounterOptions,
    ) -> Result<CounterResult> {
        let mut packet = Packet::request(opcode);
        packet.key = key;
        let mut extras = Vec::with_capacity(20);
        extras.extend_from_slice(&options.delta.to_be_bytes());
        extras.extend_from_slice(&options.initial.to_be_bytes());
        extras.extend_from_slice(&options.expiry.to_be_bytes());
        packet.extras = extras;
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                0,
                self.effective_strategy(options.retry_strategy),
                self.effective_timeout(options.timeout),
            )
            .await?;
        parse_counter(response)
    }

    /// Read a document from a specific replica (1-based index).
    pub async fn get_replica(
        &self,
        key: impl Into<Vec<u8>>,
        replica_index: u32,
        options: KeyOptions,
    ) -> Result<GetResult> {
        if replica_index == 0 {
            return Err(Error::InvalidArgument("replica index must be 1-based".into()));
        }
        let mut packet = Packet::request(Opcode::GetReplica);
        packet.key = key.into();
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                replica_index,
                self.effective_strategy(options.retry_strategy),
                self.effective_timeout(options.timeout),
            )
            .await?;
        parse_get(response)
    }

    /// Compound read: race the active copy against every replica, first
    /// success wins.
    pub async fn get_any_replica(
        &self,
        key: impl Into<Vec<u8>>,
        options: KeyOptions,
    ) -> Result<GetResult> {
        let key = key.into();
        let replicas = self.num_replicas() as u32;
        let mut attempts = futures::stream::FuturesUnordered::new();
        {
            let bucket = self.clone();
            let key = key.clone();
            let options = options.clone();
            attempts.push(Box::pin(async move { bucket.get(key, options).await })
                as futures::future::BoxFuture<'static, Result<GetResult>>);
        }
        for replica in 1..=replicas {
            let bucket = self.clone();
            let key = key.clone();
            let options = options.clone();
            attempts.push(Box::pin(async move {
                bucket.get_replica(key, replica, options).await
            }));
        }
        let mut last_error = Error::DocumentNotFound;
        use futures::StreamExt;
        while let Some(result) = attempts.next().await {
            match result {
                Ok(result) => return Ok(result),
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }

    /// Compound read: every available copy of the document.
    pub async fn get_all_replicas(
        &self,
        key: impl Into<Vec<u8>>,
        options: KeyOptions,
    ) -> Result<Vec<GetResult>> {
        let key = key.into();
        let replicas = self.num_replicas() as u32;
        let mut results = Vec::new();
        let mut last_error = Error::DocumentNotFound;
        match self.get(key.clone(), options.clone()).await {
            Ok(result) => results.push(result),
            Err(error) => last_error = error,
        }
        for replica in 1..=replicas {
            match self.get_replica(key.clone(), replica, options.clone()).await {
                Ok(result) => results.push(result),
                Err(error) => last_error = error,
            }
        }
        if results.is_empty() {
            return Err(last_error);
        }
        Ok(results)
    }

    /// Open a range scan on one vbucket. The returned uuid feeds continue
    /// and cancel.
    pub async fn range_scan_create(
        &self,
        vbucket_id: u16,
        options: RangeScanCreateOptions,
    ) -> Result<RangeScanCreateResult> {
        let mut packet = Packet::request(Opcode::RangeScanCreate);
        packet.datatype = datatype::JSON;
        packet.vbucket = vbucket_id;
        packet.value =
            serialize_create_options(&options, self.options().key_value_scan_timeout)?;

        let request_timeout = options.timeout.unwrap_or(self.options().key_value_scan_timeout);
        let response = self
            .execute_kv(
                packet,
                &options.scope_name,
                &options.collection_name,
                0,
                self.effective_strategy(None),
                request_timeout,
            )
            .await?;
        status_to_error(&response)?;
        if response.value.len() != 16 {
            return Err(Error::ProtocolError("scan uuid must be 16 bytes".into()));
        }
        Ok(RangeScanCreateResult { scan_uuid: response.value, ids_only: options.ids_only })
    }

    /// Stream one batch sequence. A single RPC yields many responses; each
    /// intermediate payload flows through `items`, and the returned result
    /// reflects the terminal status.
    pub async fn range_scan_continue(
        &self,
        scan_uuid: &[u8],
        vbucket_id: u16,
        options: RangeScanContinueOptions,
        items: ItemCallback,
    ) -> Result<RangeScanContinueResult> {
        if scan_uuid.len() != 16 {
            return Err(Error::InvalidArgument("scan uuid must be 16 bytes".into()));
        }
        let mut packet = Packet::request(Opcode::RangeScanContinue);
        packet.vbucket = vbucket_id;
        packet.extras = continue_extras(scan_uuid, &options);

        let (tx, rx) = oneshot::channel::<Result<RangeScanContinueResult>>();
        let mut tx = Some(tx);
        let request_slot: Arc<Mutex<Option<Arc<QueueRequest>>>> = Arc::new(Mutex::new(None));
        let callback_slot = request_slot.clone();
        let mut items = items;

        let request = QueueRequest::build(
            packet,
            Box::new(move |response, error| {
                let request = callback_slot.lock().unwrap().clone();
                if let Some(error) = error {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(Err(error));
                    }
                    return;
                }
                let Some(response) = response else { return };
                let finish = |tx: &mut Option<oneshot::Sender<_>>,
                              request: &Option<Arc<QueueRequest>>,
                              outcome: Result<RangeScanContinueResult>| {
                    if let Some(request) = request {
                        request.internal_cancel();
                    }
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(outcome);
                    }
                };

                match response.status_code() {
                    Status::Success | Status::RangeScanMore | Status::RangeScanComplete => {
                        if response.extras.len() != 4 {
                            finish(
                                &mut tx,
                                &request,
                                Err(Error::ProtocolError("continue extras must be 4 bytes".into())),
                            );
                            return;
                        }
                        let ids_only =
                            u32::from_be_bytes(response.extras[0..4].try_into().unwrap()) == 0;
                        let parsed = if ids_only {
                            parse_keys(&response.value, &mut items)
                        } else {
                            parse_documents(&response.value, &mut items)
                        };
                        if let Err(error) = parsed {
                            finish(&mut tx, &request, Err(error));
                            return;
                        }
                        let status = response.status_code();
                        if status != Status::Success {
                            finish(
                                &mut tx,
                                &request,
                                Ok(RangeScanContinueResult {
                                    more: status == Status::RangeScanMore,
                                    complete: status == Status::RangeScanComplete,
                                    ids_only,
                                }),
                            );
                        }
                    }
                    Status::NotFound | Status::RangeScanCancelled => {
                        finish(&mut tx, &request, Err(Error::DocumentNotFound));
                    }
                    _ => {
                        finish(&mut tx, &request, status_to_error(&response).map(|()| unreachable!()));
                    }
                }
            }),
            true,
            "",
            "",
            0,
            Some(self.effective_strategy(None)),
        );
        *request_slot.lock().unwrap() = Some(request.clone());

        let timeout = options.timeout.unwrap_or(self.options().key_value_scan_timeout);
        let deadline_request = request.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline_request.cancel(Error::UnambiguousTimeout);
        });
        request.set_deadline(deadline.abort_handle());

        self.dispatch(request).await?;
        rx.await.map_err(|_| Error::RequestCanceled)?
    }

    /// Abort a scan; the server acknowledges with the terminal callback of
    /// any in-flight continue.
    pub async fn range_scan_cancel(&self, scan_uuid: &[u8], vbucket_id: u16) -> Result<()> {
        if scan_uuid.len() != 16 {
            return Err(Error::InvalidArgument("scan uuid must be 16 bytes".into()));
        }
        let mut packet = Packet::request(Opcode::RangeScanCancel);
        packet.vbucket = vbucket_id;
        packet.extras = scan_uuid.to_vec();
        let response = self
            .execute_kv(
                packet,
                "",
                "",
                0,
                self.effective_strategy(None),
                self.options().key_value_timeout,
            )
            .await?;
        status_to_error(&response)
    }

    /// Scan every vbucket in order, yielding items as they arrive.
    pub fn scan(
        &self,
        create_options: RangeScanCreateOptions,
        continue_options: RangeScanContinueOptions,
    ) -> impl Stream<Item = Result<RangeScanItem>> + Send + use<> {
        let bucket = self.clone();
        try_stream! {
            let vbuckets = bucket
                .config_snapshot()
                .map(|config| config.vbucket_count())
                .unwrap_or(crate::topology::DEFAULT_VBUCKET_COUNT);

            for vbucket in 0..vbuckets as u16 {
                let (tx, mut rx) = mpsc::unbounded_channel::<RangeScanItem>();
                let driver_bucket = bucket.clone();
                let create = create_options.clone();
                let cont = continue_options.clone();
                let driver = tokio::spawn(async move {
                    let created = match driver_bucket.range_scan_create(vbucket, create).await {
                        Ok(created) => created,
                        // an empty vbucket has nothing in range
                        Err(Error::DocumentNotFound) => return Ok(()),
                        Err(error) => return Err(error),
                    };
                    loop {
                        let batch_tx = tx.clone();
                        let result = driver_bucket
                            .range_scan_continue(
                                &created.scan_uuid,
                                vbucket,
                                cont.clone(),
                                Box::new(move |item| {
                                    let _ = batch_tx.send(item);
                                }),
                            )
                            .await?;
                        if result.complete {
                            return Ok(());
                        }
                        if !result.more {
                            return Ok(());
                        }
                    }
                });

                while let Some(item) = rx.recv().await {
                    yield item;
                }
                match driver.await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => Err(error)?,
                    Err(_) => Err(Error::RequestCanceled)?,
                }
            }
        }
    }
}
