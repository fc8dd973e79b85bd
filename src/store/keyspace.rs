//! In-process keyspace with hash and set values, per-key expiry and
//! optimistic transactions (watch + exec).
//!
//! Every write bumps the touched key's version. A [`Watch`] remembers the
//! versions it observed; [`Keyspace::exec`] refuses to commit when any of
//! them moved. A transaction is staged on copies of the touched entries and
//! written back only after every operation applied, so a failed or abandoned
//! transaction never leaves partial state.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("watched key `{0}` changed before commit")]
    WatchViolated(String),
    #[error("key `{0}` holds a value of another type")]
    WrongType(String),
    #[error("keyspace lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    version: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    clock: u64,
}

impl Inner {
    fn live(&self, key: &str, now: DateTime<Utc>) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    fn version_of(&self, key: &str, now: DateTime<Utc>) -> u64 {
        self.live(key, now).map_or(0, |e| e.version)
    }
}

/// Versions observed for a set of keys.
#[derive(Debug, Clone)]
pub struct Watch {
    versions: Vec<(String, u64)>,
}

#[derive(Debug, Clone)]
enum Op {
    HSet(String, Vec<(String, String)>),
    SAdd(String, String),
    SRem(String, String),
    ExpireAt(String, DateTime<Utc>),
    Del(String),
}

impl Op {
    fn key(&self) -> &str {
        match self {
            Op::HSet(key, _)
            | Op::SAdd(key, _)
            | Op::SRem(key, _)
            | Op::ExpireAt(key, _)
            | Op::Del(key) => key,
        }
    }
}

/// Queued writes committed together by [`Keyspace::exec`].
#[derive(Debug, Default, Clone)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset<I, K, V>(mut self, key: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.ops.push(Op::HSet(key.into(), fields));
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(Op::SAdd(key.into(), member.into()));
        self
    }

    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(Op::SRem(key.into(), member.into()));
        self
    }

    pub fn expire_at(mut self, key: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.ops.push(Op::ExpireAt(key.into(), at));
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(Op::Del(key.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Default)]
pub struct Keyspace {
    inner: RwLock<Inner>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, KvError> {
        self.inner.read().map_err(|_| KvError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, KvError> {
        self.inner.write().map_err(|_| KvError::Poisoned)
    }

    /// Record the current versions of `keys`. Absent and expired keys are version 0.
    pub fn watch(&self, keys: &[&str]) -> Result<Watch, KvError> {
        let now = Utc::now();
        let inner = self.read()?;
        Ok(Watch {
            versions: keys
                .iter()
                .map(|key| (key.to_string(), inner.version_of(key, now)))
                .collect(),
        })
    }

    /// Fails with [`KvError::WatchViolated`] if any watched key moved.
    pub fn check(&self, watch: &Watch) -> Result<(), KvError> {
        let inner = self.read()?;
        Self::verify(&inner, watch, Utc::now())
    }

    fn verify(inner: &Inner, watch: &Watch, now: DateTime<Utc>) -> Result<(), KvError> {
        for (key, seen) in &watch.versions {
            if inner.version_of(key, now) != *seen {
                return Err(KvError::WatchViolated(key.clone()));
            }
        }
        Ok(())
    }

    pub fn exists(&self, key: &str) -> Result<bool, KvError> {
        let inner = self.read()?;
        Ok(inner.live(key, Utc::now()).is_some())
    }

    pub fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>, KvError> {
        let inner = self.read()?;
        match inner.live(key, Utc::now()) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(fields), .. }) => Ok(Some(fields.clone())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    /// Read a hash and delete it in one step.
    pub fn hgetdel(&self, key: &str) -> Result<Option<HashMap<String, String>>, KvError> {
        let now = Utc::now();
        let mut inner = self.write()?;
        match inner.entries.get(key) {
            Some(entry) if !matches!(entry.value, Value::Hash(_)) && entry.is_live(now) => {
                return Err(KvError::WrongType(key.to_string()));
            }
            _ => {}
        }
        match inner.entries.remove(key) {
            Some(Entry { value: Value::Hash(fields), expires_at, .. })
                if expires_at.map_or(true, |at| now < at) =>
            {
                Ok(Some(fields))
            }
            _ => Ok(None),
        }
    }

    pub fn smembers(&self, key: &str) -> Result<BTreeSet<String>, KvError> {
        let inner = self.read()?;
        match inner.live(key, Utc::now()) {
            None => Ok(BTreeSet::new()),
            Some(Entry { value: Value::Set(members), .. }) => Ok(members.clone()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    /// Apply `tx` atomically. With a watch, commit only if no watched key moved.
    pub fn exec(&self, tx: Transaction, watch: Option<&Watch>) -> Result<(), KvError> {
        let now = Utc::now();
        let mut inner = self.write()?;
        if let Some(watch) = watch {
            Self::verify(&inner, watch, now)?;
        }

        let mut staged: HashMap<String, Option<Entry>> = HashMap::new();
        for op in &tx.ops {
            let key = op.key();
            let slot = staged
                .entry(key.to_string())
                .or_insert_with(|| inner.live(key, now).cloned());
            Self::apply(slot, op)?;
        }

        inner.clock += 1;
        let version = inner.clock;
        for (key, slot) in staged {
            match slot {
                Some(Entry { value: Value::Set(members), .. }) if members.is_empty() => {
                    inner.entries.remove(&key);
                }
                Some(mut entry) => {
                    entry.version = version;
                    inner.entries.insert(key, entry);
                }
                None => {
                    inner.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn apply(slot: &mut Option<Entry>, op: &Op) -> Result<(), KvError> {
        match op {
            Op::HSet(key, fields) => {
                let entry = slot.get_or_insert_with(|| Entry {
                    value: Value::Hash(HashMap::new()),
                    version: 0,
                    expires_at: None,
                });
                match &mut entry.value {
                    Value::Hash(hash) => hash.extend(fields.iter().cloned()),
                    Value::Set(_) => return Err(KvError::WrongType(key.clone())),
                }
            }
            Op::SAdd(key, member) => {
                let entry = slot.get_or_insert_with(|| Entry {
                    value: Value::Set(BTreeSet::new()),
                    version: 0,
                    expires_at: None,
                });
                match &mut entry.value {
                    Value::Set(set) => {
                        set.insert(member.clone());
                    }
                    Value::Hash(_) => return Err(KvError::WrongType(key.clone())),
                }
            }
            Op::SRem(key, member) => {
                if let Some(entry) = slot {
                    match &mut entry.value {
                        Value::Set(set) => {
                            set.remove(member);
                        }
                        Value::Hash(_) => return Err(KvError::WrongType(key.clone())),
                    }
                }
            }
            Op::ExpireAt(_, at) => {
                if let Some(entry) = slot {
                    entry.expires_at = Some(*at);
                }
            }
            Op::Del(_) => *slot = None,
        }
        Ok(())
    }

    /// Drop every expired entry. Reads already hide them; this reclaims memory.
    pub fn purge_expired(&self) -> Result<usize, KvError> {
        let now = Utc::now();
        let mut inner = self.write()?;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.is_live(now));
        Ok(before - inner.entries.len())
    }
}
