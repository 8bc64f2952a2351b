//! Global actor (one per process) that issues, refreshes, and revokes
//! bandwidth tokens across all concurrent transfers, and re-balances them
//! under contention. A single task owns all mutable state; callers send it
//! messages and await a reply, the same shape as the progress aggregator.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::types::{BandwidthToken, Priority, RequestorKind, TokenId, TransferId};

pub const MINIMUM_ALLOCATION_BPS: u64 = 1024;
const ROLLING_WINDOW_LEN: usize = 20;
const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// What happens when the global cap is already fully allocated and a new
/// request arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    Queue,
    Deny,
}

#[derive(Debug)]
enum Command {
    Allocate {
        transfer_id: TransferId,
        desired_bps: u64,
        priority: Priority,
        requestor: RequestorKind,
        reply: oneshot::Sender<Option<BandwidthToken>>,
    },
    Report {
        token_id: TokenId,
        observed_bps: u64,
    },
    Release {
        token_id: TokenId,
    },
    SetGlobalCap {
        cap_bps: u64,
    },
    Snapshot {
        reply: oneshot::Sender<BrokerSnapshot>,
    },
    CurrentAllocation {
        token_id: TokenId,
        reply: oneshot::Sender<Option<u64>>,
    },
}

/// A lightweight, clonable handle to the running broker actor.
#[derive(Clone)]
pub struct BandwidthBrokerHandle {
    tx: mpsc::Sender<Command>,
}

#[derive(Debug, Clone)]
pub struct BrokerSnapshot {
    pub allocated_total_bps: u64,
    pub global_cap_bps: u64,
    pub live_tokens: usize,
    pub queued: usize,
}

struct QueuedRequest {
    transfer_id: TransferId,
    desired_bps: u64,
    priority: Priority,
    requestor: RequestorKind,
    reply: oneshot::Sender<Option<BandwidthToken>>,
}

struct LiveToken {
    token: BandwidthToken,
    /// Rolling window of reported byte rates, most recent last.
    reports: VecDeque<u64>,
    /// Priority/requestor-weighted demand this token was allocated for,
    /// held onto so the token's fair share can be recomputed whenever the
    /// set of live tokens changes.
    weight: f64,
}

struct BrokerState {
    global_cap_bps: u64,
    admission_policy: AdmissionPolicy,
    tokens: HashMap<TokenId, LiveToken>,
    queue: VecDeque<QueuedRequest>,
    last_maintenance: Instant,
    maintenance_interval: Duration,
}

impl BrokerState {
    fn allocated_total(&self) -> u64 {
        self.tokens.values().map(|t| t.token.allocated_bps).sum()
    }

    /// Weight desired bandwidth by priority and requestor type.
    fn weighted_demand(desired_bps: u64, priority: Priority, requestor: RequestorKind) -> f64 {
        desired_bps as f64 * priority.weight() * requestor.multiplier()
    }

    /// Admit a brand-new token, then immediately recompute every live
    /// token's fair share so this grant divides the cap across *all*
    /// current demand instead of greedily consuming whatever is left and
    /// starving later requesters (reclaimed later only via `rebalance`).
    fn try_allocate(
        &mut self,
        transfer_id: TransferId,
        desired_bps: u64,
        priority: Priority,
        requestor: RequestorKind,
    ) -> Option<BandwidthToken> {
        let weight = Self::weighted_demand(desired_bps, priority, requestor);
        if weight <= 0.0 {
            return None;
        }
        if self.global_cap_bps != 0 && self.global_cap_bps < MINIMUM_ALLOCATION_BPS {
            return None;
        }

        let token_id = Uuid::new_v4();
        let token = BandwidthToken {
            id: token_id,
            transfer_id,
            allocated_bps: 0,
            priority,
            last_reported_bps: 0,
            allocation_time: Instant::now(),
            expiration: None,
        };
        self.tokens.insert(
            token_id,
            LiveToken {
                token,
                reports: VecDeque::with_capacity(ROLLING_WINDOW_LEN),
                weight,
            },
        );
        self.reallocate_fairly();
        Some(self.tokens[&token_id].token.clone())
    }

    /// Recompute every live token's `allocated_bps` as its weighted share
    /// of the global cap relative to all other live demand, never granting
    /// more than a token's own weighted demand. A cap of 0 means unlimited:
    /// every token simply gets its full weighted demand.
    fn reallocate_fairly(&mut self) {
        if self.global_cap_bps == 0 {
            for live in self.tokens.values_mut() {
                live.token.allocated_bps = (live.weight as u64).max(MINIMUM_ALLOCATION_BPS);
            }
            return;
        }

        let total_weight: f64 = self.tokens.values().map(|live| live.weight).sum();
        if total_weight <= 0.0 {
            return;
        }

        let cap = self.global_cap_bps as f64;
        for live in self.tokens.values_mut() {
            let proportional_share = cap * (live.weight / total_weight);
            let share = proportional_share.min(live.weight);
            live.token.allocated_bps = (share as u64).clamp(MINIMUM_ALLOCATION_BPS, self.global_cap_bps);
        }
    }

    /// Release frees budget, lets remaining live tokens reclaim their fair
    /// share of it, then wakes queued requests, highest priority first, in
    /// FIFO order within a priority.
    fn release_and_wake(&mut self, token_id: TokenId) {
        self.tokens.remove(&token_id);
        self.reallocate_fairly();
        self.wake_queue();
    }

    fn wake_queue(&mut self) {
        // Stable-sort queued requests by priority (high first), preserving
        // FIFO order within a priority tier.
        let mut ordered: Vec<QueuedRequest> = self.queue.drain(..).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut still_queued = VecDeque::new();
        for req in ordered {
            if still_queued.is_empty() {
                if let Some(token) = self.try_allocate(req.transfer_id, req.desired_bps, req.priority, req.requestor)
                {
                    let _ = req.reply.send(Some(token));
                    continue;
                }
            }
            still_queued.push_back(req);
        }
        self.queue = still_queued;
    }

    /// Shrink under-utilized tokens (ratio < 0.5 over the window) and
    /// redistribute to queued or over-utilized (>1.0) tokens.
    fn rebalance(&mut self) {
        let mut reclaimed = 0u64;
        let mut underutilized: Vec<TokenId> = Vec::new();
        let mut overutilized: Vec<TokenId> = Vec::new();

        for (id, live) in self.tokens.iter() {
            if live.reports.len() < 2 {
                continue;
            }
            let avg_reported: f64 = live.reports.iter().sum::<u64>() as f64 / live.reports.len() as f64;
            let ratio = avg_reported / live.token.allocated_bps.max(1) as f64;
            if ratio < 0.5 {
                underutilized.push(*id);
            } else if ratio > 1.0 {
                overutilized.push(*id);
            }
        }

        for id in &underutilized {
            if let Some(live) = self.tokens.get_mut(id) {
                let shrink_to = (live.token.allocated_bps / 2).max(MINIMUM_ALLOCATION_BPS);
                reclaimed += live.token.allocated_bps.saturating_sub(shrink_to);
                live.token.allocated_bps = shrink_to;
            }
        }

        if reclaimed == 0 {
            return;
        }

        // First, wake anything queued.
        self.wake_queue();

        // Then top up over-utilized tokens with whatever remains.
        if !overutilized.is_empty() && reclaimed > 0 {
            let share = reclaimed / overutilized.len() as u64;
            for id in overutilized {
                if let Some(live) = self.tokens.get_mut(&id) {
                    live.token.allocated_bps += share;
                }
            }
        }
    }

    /// On a new global cap, if allocated exceeds it, shrink tokens in
    /// ascending priority order (lowest priority shrunk first) until within
    /// cap.
    fn apply_new_cap(&mut self, cap_bps: u64) {
        self.global_cap_bps = cap_bps;
        if cap_bps == 0 {
            return;
        }
        let mut over = self.allocated_total().saturating_sub(cap_bps);
        if over == 0 {
            return;
        }
        let mut ids: Vec<TokenId> = self.tokens.keys().copied().collect();
        ids.sort_by_key(|id| self.tokens[id].token.priority);

        for id in ids {
            if over == 0 {
                break;
            }
            if let Some(live) = self.tokens.get_mut(&id) {
                let shrinkable = live.token.allocated_bps.saturating_sub(MINIMUM_ALLOCATION_BPS);
                let cut = shrinkable.min(over);
                live.token.allocated_bps -= cut;
                over -= cut;
            }
        }
    }

    fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            allocated_total_bps: self.allocated_total(),
            global_cap_bps: self.global_cap_bps,
            live_tokens: self.tokens.len(),
            queued: self.queue.len(),
        }
    }
}

impl BandwidthBrokerHandle {
    /// Request a token. Returns `None` if denied (either the admission
    /// policy is `Deny` and no budget is available, or the request was
    /// queued and never reached — callers that want to wait indefinitely
    /// for a queued grant should call `allocate_blocking`).
    pub async fn allocate(
        &self,
        transfer_id: TransferId,
        desired_bps: u64,
        priority: Priority,
        requestor: RequestorKind,
    ) -> Option<BandwidthToken> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Allocate {
                transfer_id,
                desired_bps,
                priority,
                requestor,
                reply,
            })
            .await;
        rx.await.ok().flatten()
    }

    pub async fn report(&self, token_id: TokenId, observed_bps: u64) {
        let _ = self.tx.send(Command::Report { token_id, observed_bps }).await;
    }

    pub async fn release(&self, token_id: TokenId) {
        let _ = self.tx.send(Command::Release { token_id }).await;
    }

    pub async fn set_global_cap(&self, cap_bps: u64) {
        let _ = self.tx.send(Command::SetGlobalCap { cap_bps }).await;
    }

    pub async fn snapshot(&self) -> BrokerSnapshot {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Snapshot { reply }).await;
        rx.await.unwrap_or(BrokerSnapshot {
            allocated_total_bps: 0,
            global_cap_bps: 0,
            live_tokens: 0,
            queued: 0,
        })
    }

    /// Read back a token's current `allocated_bps`, which may have shifted
    /// since it was granted as contention changed. Returns `None` if the
    /// token has been released.
    pub async fn current_allocation(&self, token_id: TokenId) -> Option<u64> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::CurrentAllocation { token_id, reply }).await;
        rx.await.ok().flatten()
    }
}

/// Owns the broker's background task. `Engine` creates one at startup and
/// drops it (ending the task) at shutdown.
pub struct BandwidthBroker {
    handle: BandwidthBrokerHandle,
    task: tokio::task::JoinHandle<()>,
}

impl BandwidthBroker {
    pub fn spawn(global_cap_bps: u64, admission_policy: AdmissionPolicy) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let handle = BandwidthBrokerHandle { tx };

        let state = BrokerState {
            global_cap_bps,
            admission_policy,
            tokens: HashMap::new(),
            queue: VecDeque::new(),
            last_maintenance: Instant::now(),
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        };

        let task = tokio::spawn(run(state, rx));

        Self { handle, task }
    }

    pub fn handle(&self) -> BandwidthBrokerHandle {
        self.handle.clone()
    }
}

impl Drop for BandwidthBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(mut state: BrokerState, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Allocate {
                transfer_id,
                desired_bps,
                priority,
                requestor,
                reply,
            } => {
                if let Some(token) = state.try_allocate(transfer_id, desired_bps, priority, requestor) {
                    log::debug!(
                        "[bandwidth_broker] granted {} bps to transfer={} priority={:?}",
                        token.allocated_bps,
                        transfer_id,
                        priority
                    );
                    let _ = reply.send(Some(token));
                } else {
                    match state.admission_policy {
                        AdmissionPolicy::Queue => {
                            log::debug!("[bandwidth_broker] queuing request for transfer={}", transfer_id);
                            state.queue.push_back(QueuedRequest {
                                transfer_id,
                                desired_bps,
                                priority,
                                requestor,
                                reply,
                            });
                        }
                        AdmissionPolicy::Deny => {
                            log::debug!("[bandwidth_broker] denying request for transfer={}", transfer_id);
                            let _ = reply.send(None);
                        }
                    }
                }
            }
            Command::Report { token_id, observed_bps } => {
                if let Some(live) = state.tokens.get_mut(&token_id) {
                    live.token.last_reported_bps = observed_bps;
                    if live.reports.len() >= ROLLING_WINDOW_LEN {
                        live.reports.pop_front();
                    }
                    live.reports.push_back(observed_bps);
                }
                if state.last_maintenance.elapsed() >= state.maintenance_interval {
                    state.rebalance();
                    state.last_maintenance = Instant::now();
                }
            }
            Command::Release { token_id } => {
                log::debug!("[bandwidth_broker] releasing token={}", token_id);
                state.release_and_wake(token_id);
                state.last_maintenance = Instant::now();
            }
            Command::SetGlobalCap { cap_bps } => {
                log::info!("[bandwidth_broker] global cap changed to {} bps", cap_bps);
                state.apply_new_cap(cap_bps);
                state.wake_queue();
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(state.snapshot());
            }
            Command::CurrentAllocation { token_id, reply } => {
                let _ = reply.send(state.tokens.get(&token_id).map(|live| live.token.allocated_bps));
            }
        }
    }
}
