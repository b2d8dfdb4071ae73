//! 资源账本：按资源种类记录容量与占用
//!
//! 每个种类一把锁，互不相干的种类互不阻塞；多种类申请按 BTreeMap 顺序（即规范顺序）加锁。
//! 申请成功返回 Reservation 守卫，显式 release 或 Drop 时归还，且只归还一次。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::task::TaskId;

/// 受限资源种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ToolSlot,
    ModelSession,
    Subprocess,
    WorkspaceWrite,
    MemoryMb,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ToolSlot => "tool_slot",
            ResourceKind::ModelSession => "model_session",
            ResourceKind::Subprocess => "subprocess",
            ResourceKind::WorkspaceWrite => "workspace_write",
            ResourceKind::MemoryMb => "memory_mb",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tool_slot" => Ok(ResourceKind::ToolSlot),
            "model_session" => Ok(ResourceKind::ModelSession),
            "subprocess" => Ok(ResourceKind::Subprocess),
            "workspace_write" => Ok(ResourceKind::WorkspaceWrite),
            "memory_mb" => Ok(ResourceKind::MemoryMb),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{kind} unavailable: requested {requested}, available {available}")]
    Unavailable {
        kind: ResourceKind,
        requested: u64,
        available: u64,
    },
}

/// 一次成功申请的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceAllocation {
    pub allocation_id: Uuid,
    pub resources: BTreeMap<ResourceKind, u64>,
    pub owner_task_id: TaskId,
}

/// 某种资源的容量与当前占用（监控快照）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub capacity: u64,
    pub in_use: u64,
}

/// 累计统计：granted == released 时没有悬挂的申请
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub granted: u64,
    pub released: u64,
    pub rejected: u64,
}

struct KindState {
    capacity: u64,
    in_use: u64,
    holders: HashMap<Uuid, u64>,
}

struct LedgerInner {
    kinds: BTreeMap<ResourceKind, Mutex<KindState>>,
    granted: AtomicU64,
    released: AtomicU64,
    rejected: AtomicU64,
}

fn lock(m: &Mutex<KindState>) -> MutexGuard<'_, KindState> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LedgerInner {
    fn release(&self, allocation: &ResourceAllocation) {
        let mut missing = false;
        for (kind, _) in &allocation.resources {
            let Some(state) = self.kinds.get(kind) else {
                continue;
            };
            let mut state = lock(state);
            match state.holders.remove(&allocation.allocation_id) {
                Some(qty) => state.in_use = state.in_use.saturating_sub(qty),
                None => missing = true,
            }
        }
        if missing {
            tracing::error!(
                allocation_id = %allocation.allocation_id,
                task_id = %allocation.owner_task_id,
                "reservation released twice or never recorded"
            );
        } else {
            self.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// 资源账本；Clone 共享同一份状态
#[derive(Clone)]
pub struct ResourceLedger {
    inner: Arc<LedgerInner>,
}

impl ResourceLedger {
    /// 未出现在 capacity 中的种类视为不受限
    pub fn new(capacity: BTreeMap<ResourceKind, u64>) -> Self {
        let kinds = capacity
            .into_iter()
            .map(|(kind, capacity)| {
                (
                    kind,
                    Mutex::new(KindState {
                        capacity,
                        in_use: 0,
                        holders: HashMap::new(),
                    }),
                )
            })
            .collect();
        Self {
            inner: Arc::new(LedgerInner {
                kinds,
                granted: AtomicU64::new(0),
                released: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(BTreeMap::new())
    }

    /// 全有或全无：任一种类不足则不占用任何资源
    pub fn try_reserve(
        &self,
        owner: TaskId,
        request: &BTreeMap<ResourceKind, u64>,
    ) -> Result<Reservation, LedgerError> {
        let allocation_id = Uuid::new_v4();
        let mut recorded = BTreeMap::new();
        {
            let mut guards = Vec::new();
            for (kind, qty) in request {
                if *qty == 0 {
                    continue;
                }
                if let Some(state) = self.inner.kinds.get(kind) {
                    guards.push((*kind, *qty, lock(state)));
                }
            }
            for (kind, qty, state) in &guards {
                let available = state.capacity.saturating_sub(state.in_use);
                if *qty > available {
                    self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(LedgerError::Unavailable {
                        kind: *kind,
                        requested: *qty,
                        available,
                    });
                }
            }
            for (kind, qty, state) in guards.iter_mut() {
                state.in_use += *qty;
                state.holders.insert(allocation_id, *qty);
                recorded.insert(*kind, *qty);
            }
        }
        self.inner.granted.fetch_add(1, Ordering::Relaxed);
        Ok(Reservation {
            inner: Arc::clone(&self.inner),
            allocation: ResourceAllocation {
                allocation_id,
                resources: recorded,
                owner_task_id: owner,
            },
            released: false,
        })
    }

    pub fn usage(&self) -> BTreeMap<ResourceKind, ResourceUsage> {
        self.inner
            .kinds
            .iter()
            .map(|(kind, state)| {
                let state = lock(state);
                (
                    *kind,
                    ResourceUsage {
                        capacity: state.capacity,
                        in_use: state.in_use,
                    },
                )
            })
            .collect()
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            granted: self.inner.granted.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }
}

/// 申请守卫；dispatch future 被丢弃（超时）时也会经 Drop 归还
pub struct Reservation {
    inner: Arc<LedgerInner>,
    allocation: ResourceAllocation,
    released: bool,
}

impl Reservation {
    pub fn allocation(&self) -> &ResourceAllocation {
        &self.allocation
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.inner.release(&self.allocation);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("allocation", &self.allocation)
            .field("released", &self.released)
            .finish()
    }
}
