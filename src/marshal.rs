//! Value marshalling and the typed cache facade.

use crate::cache::Cache;
use crate::error::Result;
use crate::tx::Transaction;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Converts values to and from bytes.
pub trait Marshaller: Send + Sync + std::fmt::Debug + 'static {
    /// Serialize a value.
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes>;

    /// Deserialize a value.
    fn unmarshal<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Marshaller using bincode.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeMarshaller;

impl Marshaller for BincodeMarshaller {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(value)?))
    }

    fn unmarshal<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Cache view with typed keys and values.
pub struct TypedCache<K, V, M = BincodeMarshaller> {
    cache: Cache,
    marshaller: M,
    _types: PhantomData<fn(K, V)>,
}

impl<K, V, M: Clone> Clone for TypedCache<K, V, M> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            marshaller: self.marshaller.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V, M: std::fmt::Debug> std::fmt::Debug for TypedCache<K, V, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCache")
            .field("cache", &self.cache.name())
            .field("marshaller", &self.marshaller)
            .finish()
    }
}

impl<K, V> TypedCache<K, V, BincodeMarshaller>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
{
    /// Wrap a cache with the bincode marshaller.
    pub fn new(cache: Cache) -> Self {
        Self::with_marshaller(cache, BincodeMarshaller)
    }
}

impl<K, V, M> TypedCache<K, V, M>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
    M: Marshaller,
{
    /// Wrap a cache with a custom marshaller.
    pub fn with_marshaller(cache: Cache, marshaller: M) -> Self {
        Self {
            cache,
            marshaller,
            _types: PhantomData,
        }
    }

    /// The untyped cache.
    pub fn raw(&self) -> &Cache {
        &self.cache
    }

    /// Read a value.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let key = self.marshaller.marshal(key)?;
        match self.cache.get(key).await? {
            Some(bytes) => Ok(Some(self.marshaller.unmarshal(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a value.
    pub async fn put(&self, key: &K, value: &V) -> Result<()> {
        let key = self.marshaller.marshal(key)?;
        let value = self.marshaller.marshal(value)?;
        self.cache.put(key, value).await
    }

    /// Remove a value.
    pub async fn remove(&self, key: &K) -> Result<()> {
        let key = self.marshaller.marshal(key)?;
        self.cache.remove(key).await
    }

    /// Read a value inside a transaction.
    pub async fn tx_get(&self, tx: &Transaction, key: &K) -> Result<Option<V>> {
        let key = self.marshal_in(tx, key)?;
        match tx.get(key).await? {
            Some(bytes) => match self.marshaller.unmarshal(&bytes) {
                Ok(v) => Ok(Some(v)),
                Err(e) => {
                    tx.set_rollback_only();
                    Err(e)
                }
            },
            None => Ok(None),
        }
    }

    /// Write a value inside a transaction. A marshalling failure marks the
    /// transaction rollback-only.
    pub async fn tx_put(&self, tx: &Transaction, key: &K, value: &V) -> Result<()> {
        let key = self.marshal_in(tx, key)?;
        let value = self.marshal_in(tx, value)?;
        tx.put(key, value).await
    }

    fn marshal_in<T: Serialize + ?Sized>(&self, tx: &Transaction, value: &T) -> Result<Bytes> {
        self.marshaller.marshal(value).map_err(|e| {
            tx.set_rollback_only();
            e
        })
    }
}
