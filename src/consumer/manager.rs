//! Consumer group manager.
//!
//! Partitions of every subscribed topic are range-assigned to member tasks.
//! Each member owns its partitions exclusively: it pulls a batch, runs every
//! record through the [`RecordPipeline`] in order, then commits. Commands
//! (assign, revoke, stop) are only handled between batches, so a revoke
//! always observes a finished and committed batch before it is acknowledged.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broker::{with_timeout, Broker, BrokerError, TopicPartition};
use crate::config::{BrokerConfig, ConsumerConfig};
use crate::metrics::ConsumerMetrics;
use crate::resilience::{BackoffConfig, ExponentialBackoff};

use super::{
    Assignment, BackpressureGate, ConsumerOffset, ConsumerStatsSnapshot, MemberId, OffsetTracker, PartitionCursor,
    PipelineHealth, RecordPipeline,
};

/// Ceiling for the pause between retries of a halted partition.
const MAX_HALT_BACKOFF_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct ConsumerGroupConfig {
    pub group_id: String,
    pub members: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub halt_backoff: BackoffConfig,
    /// After this long a pending revoke is logged; the manager keeps waiting
    pub revoke_timeout: Duration,
    pub broker_timeout: Duration,
}

impl ConsumerGroupConfig {
    pub fn from_settings(consumer: &ConsumerConfig, broker: &BrokerConfig) -> Self {
        Self {
            group_id: consumer.group_id.clone(),
            members: consumer.members,
            batch_size: consumer.batch_size.max(1),
            poll_interval: Duration::from_millis(consumer.poll_interval_ms),
            halt_backoff: BackoffConfig {
                initial_delay_ms: consumer.halt_backoff_ms,
                max_delay_ms: MAX_HALT_BACKOFF_MS.max(consumer.halt_backoff_ms),
                ..BackoffConfig::default()
            },
            revoke_timeout: Duration::from_millis(consumer.revoke_timeout_ms),
            broker_timeout: Duration::from_millis(broker.operation_timeout_ms),
        }
    }
}

enum MemberCommand {
    Assign(Vec<TopicPartition>),
    Revoke(Vec<TopicPartition>, oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

struct MemberHandle {
    tx: mpsc::UnboundedSender<MemberCommand>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct GroupState {
    assignment: Assignment,
    members: Vec<MemberHandle>,
}

/// Result of one rebalance.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceSummary {
    pub members: usize,
    pub revoked: usize,
    pub assigned: usize,
}

pub struct ConsumerGroupManager {
    broker: Arc<dyn Broker>,
    pipeline: Arc<RecordPipeline>,
    offsets: OffsetTracker,
    health: Arc<PipelineHealth>,
    config: ConsumerGroupConfig,
    topics: Vec<String>,
    group: Mutex<GroupState>,
}

impl ConsumerGroupManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        pipeline: Arc<RecordPipeline>,
        health: Arc<PipelineHealth>,
        topics: Vec<String>,
        config: ConsumerGroupConfig,
    ) -> Self {
        let offsets = OffsetTracker::new(broker.clone(), config.group_id.clone(), config.broker_timeout);
        Self {
            broker,
            pipeline,
            offsets,
            health,
            config,
            topics,
            group: Mutex::new(GroupState::default()),
        }
    }

    /// Spawn the configured number of members.
    pub async fn start(&self) -> RebalanceSummary {
        tracing::info!(
            group_id = %self.config.group_id,
            topics = ?self.topics,
            partitions = self.broker.partitions(),
            "Starting consumer group"
        );
        self.rebalance(self.config.members).await
    }

    /// Move to `member_count` members with cooperative hand-over.
    ///
    /// Partitions that change owner are revoked first; their current owner
    /// finishes its batch, commits and acknowledges. Only then are they
    /// assigned to the new owner.
    pub async fn rebalance(&self, member_count: usize) -> RebalanceSummary {
        let mut group = self.group.lock().await;
        let next = Assignment::range(&self.topics, self.broker.partitions(), member_count);
        let moves = group.assignment.moves_to(&next);

        let mut revokes: BTreeMap<MemberId, Vec<TopicPartition>> = BTreeMap::new();
        let mut assigns: BTreeMap<MemberId, Vec<TopicPartition>> = BTreeMap::new();
        for m in &moves {
            if let Some(from) = m.from {
                revokes.entry(from).or_default().push(m.topic_partition.clone());
            }
            if let Some(to) = m.to {
                assigns.entry(to).or_default().push(m.topic_partition.clone());
            }
        }

        let revoked = revokes.values().map(Vec::len).sum();
        let pending: Vec<_> = revokes
            .into_iter()
            .filter_map(|(member, partitions)| {
                let (ack_tx, ack_rx) = oneshot::channel();
                let handle = group.members.get(member)?;
                if handle.tx.send(MemberCommand::Revoke(partitions, ack_tx)).is_err() {
                    tracing::error!(member = member, "Consumer member gone before revoke");
                    return None;
                }
                Some(self.await_ack(member, ack_rx))
            })
            .collect();
        join_all(pending).await;

        while group.members.len() > member_count {
            if let Some(handle) = group.members.pop() {
                let member = group.members.len();
                self.stop_member(member, handle).await;
            }
        }
        while group.members.len() < member_count {
            let member = group.members.len();
            group.members.push(self.spawn_member(member));
        }

        let assigned = assigns.values().map(Vec::len).sum();
        for (member, partitions) in assigns {
            if let Some(handle) = group.members.get(member) {
                if handle.tx.send(MemberCommand::Assign(partitions)).is_err() {
                    tracing::error!(member = member, "Consumer member gone before assign");
                }
            }
        }

        group.assignment = next;
        self.pipeline.stats().rebalances.fetch_add(1, Ordering::Relaxed);
        ConsumerMetrics::record_rebalance();
        tracing::info!(
            members = member_count,
            revoked = revoked,
            assigned = assigned,
            "Consumer group rebalanced"
        );

        RebalanceSummary {
            members: member_count,
            revoked,
            assigned,
        }
    }

    /// Let every member finish its batch, commit, and exit.
    pub async fn stop(&self) {
        let mut group = self.group.lock().await;
        let members: Vec<_> = group.members.drain(..).enumerate().collect();
        join_all(
            members
                .into_iter()
                .map(|(member, handle)| self.stop_member(member, handle)),
        )
        .await;
        group.assignment = Assignment::default();
        tracing::info!(group_id = %self.config.group_id, "Consumer group stopped");
    }

    pub async fn assignment(&self) -> Assignment {
        self.group.lock().await.assignment.clone()
    }

    pub async fn member_count(&self) -> usize {
        self.group.lock().await.members.len()
    }

    /// Committed offsets of every assigned partition, read from the broker.
    pub async fn committed_offsets(&self) -> Result<Vec<ConsumerOffset>, BrokerError> {
        let assignment = self.assignment().await;
        let mut offsets = Vec::with_capacity(assignment.len());
        for member in 0..assignment.members() {
            for tp in assignment.partitions_of(member) {
                offsets.push(self.offsets.load(&tp).await?.to_offset());
            }
        }
        offsets.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        Ok(offsets)
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.pipeline.stats().snapshot()
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    pub fn backpressure(&self) -> &Arc<BackpressureGate> {
        self.pipeline.backpressure()
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    fn spawn_member(&self, id: MemberId) -> MemberHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let member = MemberTask {
            id,
            broker: self.broker.clone(),
            pipeline: self.pipeline.clone(),
            offsets: self.offsets.clone(),
            health: self.health.clone(),
            config: self.config.clone(),
            partitions: BTreeMap::new(),
        };
        MemberHandle {
            tx,
            task: tokio::spawn(member.run(rx)),
        }
    }

    async fn stop_member(&self, member: MemberId, handle: MemberHandle) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if handle.tx.send(MemberCommand::Stop(ack_tx)).is_ok() {
            self.await_ack(member, ack_rx).await;
        }
        if let Err(e) = handle.task.await {
            tracing::error!(member = member, error = %e, "Consumer member task failed");
        }
    }

    async fn await_ack(&self, member: MemberId, mut ack: oneshot::Receiver<()>) {
        if tokio::time::timeout(self.config.revoke_timeout, &mut ack).await.is_ok() {
            return;
        }
        tracing::warn!(
            member = member,
            timeout_ms = self.config.revoke_timeout.as_millis() as u64,
            "Consumer member slow to release partitions"
        );
        let _ = ack.await;
    }
}

struct PartitionState {
    /// Loaded lazily so an offset read failure is retried like any halt
    cursor: Option<PartitionCursor>,
    halted: bool,
    retry_at: Option<Instant>,
    backoff: ExponentialBackoff,
}

impl PartitionState {
    fn new(config: &ConsumerGroupConfig) -> Self {
        Self {
            cursor: None,
            halted: false,
            retry_at: None,
            backoff: ExponentialBackoff::with_config(config.halt_backoff.clone()),
        }
    }
}

struct MemberTask {
    id: MemberId,
    broker: Arc<dyn Broker>,
    pipeline: Arc<RecordPipeline>,
    offsets: OffsetTracker,
    health: Arc<PipelineHealth>,
    config: ConsumerGroupConfig,
    partitions: BTreeMap<TopicPartition, PartitionState>,
}

impl MemberTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MemberCommand>) {
        tracing::debug!(member = self.id, "Consumer member started");

        loop {
            loop {
                match rx.try_recv() {
                    Ok(command) => {
                        if !self.on_command(Some(command)).await {
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.on_command(None).await;
                        return;
                    }
                }
            }

            let gate = self.pipeline.backpressure().clone();
            if gate.is_paused() {
                tokio::select! {
                    command = rx.recv() => {
                        if !self.on_command(command).await {
                            return;
                        }
                    }
                    _ = gate.wait_for_capacity() => {}
                }
                continue;
            }

            if self.poll_round().await {
                continue;
            }

            tokio::select! {
                command = rx.recv() => {
                    if !self.on_command(command).await {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Returns false when the member should exit.
    async fn on_command(&mut self, command: Option<MemberCommand>) -> bool {
        match command {
            Some(MemberCommand::Assign(partitions)) => {
                for tp in partitions {
                    tracing::info!(member = self.id, topic_partition = %tp, "Partition assigned");
                    self.health.set_running(&tp);
                    ConsumerMetrics::partition_assigned();
                    self.partitions.insert(tp, PartitionState::new(&self.config));
                }
                true
            }
            Some(MemberCommand::Revoke(partitions, ack)) => {
                for tp in partitions {
                    if let Some(state) = self.partitions.remove(&tp) {
                        self.release(&tp, state).await;
                    }
                }
                let _ = ack.send(());
                true
            }
            Some(MemberCommand::Stop(ack)) => {
                self.release_all().await;
                let _ = ack.send(());
                tracing::debug!(member = self.id, "Consumer member stopped");
                false
            }
            None => {
                self.release_all().await;
                false
            }
        }
    }

    async fn release(&mut self, tp: &TopicPartition, state: PartitionState) {
        if let Some(mut cursor) = state.cursor {
            if let Err(e) = self.offsets.commit(&mut cursor).await {
                tracing::warn!(topic_partition = %tp, error = %e, "Final commit failed on release");
            }
        }
        self.health.remove(tp);
        ConsumerMetrics::partition_released();
        tracing::info!(member = self.id, topic_partition = %tp, "Partition released");
    }

    async fn release_all(&mut self) {
        let partitions = std::mem::take(&mut self.partitions);
        for (tp, state) in partitions {
            self.release(&tp, state).await;
        }
    }

    /// One batch from every ready partition. Returns whether any records arrived.
    async fn poll_round(&mut self) -> bool {
        let ready: Vec<TopicPartition> = {
            let now = Instant::now();
            self.partitions
                .iter()
                .filter(|(_, state)| state.retry_at.map_or(true, |at| now >= at))
                .map(|(tp, _)| tp.clone())
                .collect()
        };

        let mut fetched = false;
        for tp in ready {
            match self.poll_partition(&tp).await {
                Ok(count) => {
                    fetched |= count > 0;
                    self.mark_healthy(&tp);
                }
                Err(reason) => self.mark_halted(&tp, reason),
            }
        }
        fetched
    }

    #[tracing::instrument(level = "debug", skip(self, tp), fields(member = self.id, topic_partition = %tp))]
    async fn poll_partition(&mut self, tp: &TopicPartition) -> Result<usize, String> {
        let Some(state) = self.partitions.get_mut(tp) else {
            return Ok(0);
        };

        if state.cursor.is_none() {
            let loaded = self
                .offsets
                .load(tp)
                .await
                .map_err(|e| format!("offset load failed: {}", e))?;
            state.cursor = Some(loaded);
        }
        let Some(cursor) = state.cursor.as_mut() else {
            return Ok(0);
        };

        let records = with_timeout(
            self.config.broker_timeout,
            self.broker.fetch(tp, cursor.position(), self.config.batch_size),
        )
        .await
        .map_err(|e| format!("fetch failed: {}", e))?;
        if records.is_empty() {
            return Ok(0);
        }

        let stats = self.pipeline.stats();
        stats.batches.fetch_add(1, Ordering::Relaxed);
        stats
            .records_consumed
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        ConsumerMetrics::record_batch(self.pipeline.channel_label(&tp.topic), records.len());

        let mut failure = None;
        for record in &records {
            match self.pipeline.process(record).await {
                Ok(_) => cursor.mark_processed(record.offset),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Commit whatever prefix of the batch is done, never past a failure
        match self.offsets.commit(cursor).await {
            Ok(true) => {
                stats.commits.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Offset commit failed"),
        }

        if let Some(e) = failure {
            cursor.rewind();
            return Err(e.to_string());
        }
        Ok(records.len())
    }

    fn mark_halted(&mut self, tp: &TopicPartition, reason: String) {
        let Some(state) = self.partitions.get_mut(tp) else {
            return;
        };
        let delay = state.backoff.next_delay();
        state.halted = true;
        state.retry_at = Some(Instant::now() + delay);

        self.pipeline.stats().halts.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            member = self.id,
            topic_partition = %tp,
            retry_in_ms = delay.as_millis() as u64,
            reason = %reason,
            "Partition halted"
        );
        self.health.set_halted(tp, reason);
    }

    fn mark_healthy(&mut self, tp: &TopicPartition) {
        let Some(state) = self.partitions.get_mut(tp) else {
            return;
        };
        if state.halted {
            state.halted = false;
            state.retry_at = None;
            state.backoff.reset();
            self.health.set_running(tp);
        }
    }
}
