//! Index of where tensor shards can be read from or written to over RDMA.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Result, TransportError};

/// Shape and element type of a tensor, as seen by the registry.
pub trait TensorInfo {
    fn shape(&self) -> &[i64];
    fn dtype(&self) -> &str;
}

/// Metadata-only tensor description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    pub shape: Vec<i64>,
    pub dtype: String,
}

impl TensorInfo for TensorDesc {
    fn shape(&self) -> &[i64] {
        &self.shape
    }

    fn dtype(&self) -> &str {
        &self.dtype
    }
}

/// Identity of one shard of a logical tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardedKey {
    pub key: String,
    pub global_shape: Vec<i64>,
    pub global_offset: Vec<i64>,
}

impl fmt::Display for ShardedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}@{:?}", self.key, self.global_shape, self.global_offset)
    }
}

/// A peer transport instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub hostname_or_ip: String,
    pub rdma_port: u16,
    pub ctrl_flow_port: u16,
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.hostname_or_ip, self.rdma_port, self.ctrl_flow_port)
    }
}

/// One physical copy of a shard reachable through RDMA.
#[derive(Debug)]
pub struct TensorRdmaInfo<T> {
    pub addr: u64,
    pub size: usize,
    pub rkey: String,
    pub node_info: NodeInfo,
    pub tensor: Option<Arc<T>>,
}

impl<T> Clone for TensorRdmaInfo<T> {
    fn clone(&self) -> Self {
        TensorRdmaInfo {
            addr: self.addr,
            size: self.size,
            rkey: self.rkey.clone(),
            node_info: self.node_info.clone(),
            tensor: self.tensor.clone(),
        }
    }
}

/// Form exchanged with upstream coordination logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMemoryRdmaInfo<T> {
    pub addr: u64,
    pub size: usize,
    pub rkey: String,
    pub node_info: NodeInfo,
    pub tensor: T,
}

impl<T> TensorRdmaInfo<T> {
    pub fn new(
        addr: u64,
        size: usize,
        rkey: impl Into<String>,
        node_info: NodeInfo,
        tensor: Option<Arc<T>>,
    ) -> Self {
        TensorRdmaInfo { addr, size, rkey: rkey.into(), node_info, tensor }
    }

    pub fn from_protocol(info: TensorMemoryRdmaInfo<T>) -> Self {
        TensorRdmaInfo {
            addr: info.addr,
            size: info.size,
            rkey: info.rkey,
            node_info: info.node_info,
            tensor: Some(Arc::new(info.tensor)),
        }
    }

    pub fn to_protocol(&self) -> Result<TensorMemoryRdmaInfo<T>>
    where
        T: Clone,
    {
        let tensor = self.tensor.as_deref().ok_or(TransportError::MissingTensor)?;
        Ok(TensorMemoryRdmaInfo {
            addr: self.addr,
            size: self.size,
            rkey: self.rkey.clone(),
            node_info: self.node_info.clone(),
            tensor: tensor.clone(),
        })
    }
}

/// Shard key to replica list, in append order.
#[derive(Debug)]
pub struct TransferTensorMeta<T> {
    entries: HashMap<ShardedKey, Vec<TensorRdmaInfo<T>>>,
}

impl<T> Default for TransferTensorMeta<T> {
    fn default() -> Self {
        TransferTensorMeta { entries: HashMap::new() }
    }
}

impl<T> TransferTensorMeta<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &ShardedKey) -> Option<&[TensorRdmaInfo<T>]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &ShardedKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn append(&mut self, key: ShardedKey, record: TensorRdmaInfo<T>) {
        self.entries.entry(key).or_default().push(record);
    }

    /// Appends a record whose tensor must match the shape of the last record
    /// under `key`. On mismatch nothing is appended.
    pub fn append_with_shape_check(
        &mut self,
        key: ShardedKey,
        addr: u64,
        size: usize,
        rkey: impl Into<String>,
        node_info: NodeInfo,
        tensor: Arc<T>,
    ) -> Result<()>
    where
        T: TensorInfo,
    {
        if let Some(last) = self.entries.get(&key).and_then(|records| records.last()) {
            let expected = last.tensor.as_deref().ok_or(TransportError::MissingTensor)?;
            if expected.shape() != tensor.shape() {
                error!(
                    key = %key,
                    expected = ?expected.shape(),
                    actual = ?tensor.shape(),
                    node = %node_info,
                    "tensor shape mismatch for shard"
                );
                return Err(TransportError::ShapeMismatch {
                    key: key.to_string(),
                    expected: expected.shape().to_vec(),
                    actual: tensor.shape().to_vec(),
                    node: node_info.to_string(),
                });
            }
        }
        self.append(key, TensorRdmaInfo::new(addr, size, rkey, node_info, Some(tensor)));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Transfer session id to its shard index. Sessions never share entries.
#[derive(Debug)]
pub struct TransferCache<T> {
    sessions: HashMap<i64, TransferTensorMeta<T>>,
}

impl<T> Default for TransferCache<T> {
    fn default() -> Self {
        TransferCache { sessions: HashMap::new() }
    }
}

impl<T> TransferCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, id: i64) -> Option<&TransferTensorMeta<T>> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: i64) -> &mut TransferTensorMeta<T> {
        self.sessions.entry(id).or_default()
    }

    pub fn remove_session(&mut self, id: i64) -> Option<TransferTensorMeta<T>> {
        self.sessions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// [`TransferCache`] shared between producer and consumer threads.
pub struct SharedTransferCache<T> {
    inner: RwLock<TransferCache<T>>,
}

impl<T> Default for SharedTransferCache<T> {
    fn default() -> Self {
        SharedTransferCache { inner: RwLock::new(TransferCache::new()) }
    }
}

impl<T> SharedTransferCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, session: i64, key: &ShardedKey) -> Option<Vec<TensorRdmaInfo<T>>> {
        self.inner.read().session(session)?.lookup(key).map(<[_]>::to_vec)
    }

    pub fn contains(&self, session: i64, key: &ShardedKey) -> bool {
        self.inner.read().session(session).is_some_and(|meta| meta.contains(key))
    }

    pub fn append(&self, session: i64, key: ShardedKey, record: TensorRdmaInfo<T>) {
        self.inner.write().session_mut(session).append(key, record);
    }

    pub fn append_with_shape_check(
        &self,
        session: i64,
        key: ShardedKey,
        addr: u64,
        size: usize,
        rkey: impl Into<String>,
        node_info: NodeInfo,
        tensor: Arc<T>,
    ) -> Result<()>
    where
        T: TensorInfo,
    {
        self.inner
            .write()
            .session_mut(session)
            .append_with_shape_check(key, addr, size, rkey, node_info, tensor)
    }

    pub fn remove_session(&self, session: i64) -> Option<TransferTensorMeta<T>> {
        self.inner.write().remove_session(session)
    }
}
