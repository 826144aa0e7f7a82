//! Parent to child replication of subjective history.
//!
//! A child world asks its parent for every tick after the last one it holds.
//! The parent answers each request once, with the owning agent's history and
//! what every co-observer could see at those ticks, and forgets the request.
//! The child issues the next request when it receives an answer.

use std::collections::BTreeMap;

use belief_nest_core::{HistoryEntry, Tick, Visibility};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::{manager::InFlight, ObservationError, ObservationManager};

/// Request sent by a child world.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildRequest {
    /// Every tick after `prev_tick`.
    Fetch {
        /// Last tick the child holds.
        prev_tick: Tick,
    },
    /// Forget the outstanding fetch.
    Cancel,
}

/// Answer sent by a parent world.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentReply {
    /// Ticks answering a fetch, in ascending order.
    Fetch(Vec<ReplicatedTick>),
    /// The outstanding fetch was forgotten.
    CancelAck,
}

/// One tick of an agent's subjective history as shipped to its child world.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedTick {
    /// Recorded tick.
    pub tick: Tick,
    /// The agent's history entry as JSON.
    pub history_json: String,
    /// Visibility of every other agent at the tick as JSON.
    pub vis_others_json: String,
}

impl ReplicatedTick {
    /// Packs an entry and the co-observers' visibility.
    pub fn encode(
        tick: Tick,
        entry: &HistoryEntry,
        others: &BTreeMap<String, Visibility>,
    ) -> Result<Self, ObservationError> {
        Ok(Self {
            tick,
            history_json: serde_json::to_string(entry)?,
            vis_others_json: serde_json::to_string(others)?,
        })
    }

    /// Unpacks the entry and the co-observers' visibility.
    pub fn decode(&self) -> Result<(HistoryEntry, BTreeMap<String, Visibility>), ObservationError> {
        Ok((
            serde_json::from_str(&self.history_json)?,
            serde_json::from_str(&self.vis_others_json)?,
        ))
    }
}

/// Child end of a replication channel.
#[derive(Debug)]
pub struct UpstreamPort {
    pub(crate) requests: mpsc::UnboundedSender<ChildRequest>,
    pub(crate) replies: mpsc::UnboundedReceiver<ParentReply>,
}

impl UpstreamPort {
    /// Sends a request to the parent.
    pub fn request(&self, request: ChildRequest) -> Result<(), ObservationError> {
        self.requests
            .send(request)
            .map_err(|_| ObservationError::ChannelClosed("parent"))
    }

    /// Waits for the next answer of the parent.
    pub async fn next_reply(&mut self) -> Option<ParentReply> {
        self.replies.recv().await
    }
}

/// Parent end of a replication channel.
#[derive(Debug)]
pub struct DownstreamPort {
    requests: mpsc::UnboundedReceiver<ChildRequest>,
    replies: mpsc::UnboundedSender<ParentReply>,
}

impl DownstreamPort {
    /// Waits for the next request of the child.
    pub async fn next_request(&mut self) -> Option<ChildRequest> {
        self.requests.recv().await
    }

    /// Sends an answer to the child.
    pub fn reply(&self, reply: ParentReply) -> Result<(), ObservationError> {
        self.replies
            .send(reply)
            .map_err(|_| ObservationError::ChannelClosed("child"))
    }
}

/// Creates a connected pair of replication ports.
#[must_use]
pub fn replication_channel() -> (UpstreamPort, DownstreamPort) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    (
        UpstreamPort {
            requests: request_tx,
            replies: reply_rx,
        },
        DownstreamPort {
            requests: request_rx,
            replies: reply_tx,
        },
    )
}

/// Parent-side state of one child world.
#[derive(Debug)]
pub(crate) struct ChildLink {
    port: DownstreamPort,
    pending: Option<Tick>,
}

impl ChildLink {
    pub(crate) fn new(port: DownstreamPort) -> Self {
        Self {
            port,
            pending: None,
        }
    }

    pub(crate) fn forget_request(&mut self) {
        self.pending = None;
    }

    fn drain_requests(&mut self) {
        while let Ok(request) = self.port.requests.try_recv() {
            match request {
                ChildRequest::Fetch { prev_tick } => self.pending = Some(prev_tick),
                ChildRequest::Cancel => {
                    self.pending = None;
                    if self.port.reply(ParentReply::CancelAck).is_err() {
                        warn!("child went away before the cancel was acknowledged");
                    }
                }
            }
        }
    }
}

impl ObservationManager {
    /// Answers every outstanding child request that has new ticks. Returns
    /// the number of answers sent; a flush already in progress makes this
    /// one return zero.
    pub fn flush_children(&self) -> Result<usize, ObservationError> {
        let Some(_flushing) = InFlight::acquire(&self.inner.flushing) else {
            return Ok(0);
        };
        let now = self.tick();
        let mut children = self.inner.children.lock();
        let records = self.inner.records.lock();
        let mut sent = 0;
        for (agent, link) in children.iter_mut() {
            link.drain_requests();
            let Some(prev_tick) = link.pending else {
                continue;
            };
            let Some(record) = records.subjective.get(agent) else {
                continue;
            };
            let ticks = record.ticks_in_range(prev_tick.next(), now)?;
            trace!(agent = %agent, start = %prev_tick.next(), now = %now, count = ticks.len(), "child fetch");
            if ticks.is_empty() {
                continue;
            }
            let mut data = Vec::with_capacity(ticks.len());
            for tick in ticks {
                let Some(entry) = record.history_at(tick) else {
                    continue;
                };
                let others: BTreeMap<String, Visibility> = records
                    .subjective
                    .iter()
                    .filter(|(other, _)| *other != agent)
                    .filter_map(|(other, other_record)| {
                        Some((other.clone(), other_record.visibility_at(tick)?.clone()))
                    })
                    .collect();
                data.push(ReplicatedTick::encode(tick, entry, &others)?);
            }
            link.pending = None;
            match link.port.reply(ParentReply::Fetch(data)) {
                Ok(()) => sent += 1,
                Err(_) => warn!(agent = %agent, "child world went away"),
            }
        }
        Ok(sent)
    }
}
