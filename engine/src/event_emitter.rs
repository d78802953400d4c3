use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::math::wei::Wei;
use crate::types::{Order, OwnerId, PairId, Position, PositionId, Trade};

/// Engine event stream, one tagged variant per lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    OrderPlaced(Order),
    OrderUpdated(Order),
    OrderFilled(Order),
    OrderCancelled(Order),
    TradeExecuted(Trade),
    PositionOpened(Position),
    PositionClosed { position: Position, pnl: Wei },
    PositionLiquidated {
        position_id: PositionId,
        trader: OwnerId,
        market: PairId,
        fee: Wei,
    },
    PositionLeverageUpdated(Position),
    FundingProcessed {
        market: PairId,
        rate: Wei,
        ts_ms: u64,
    },
    MarketHalted { pair: PairId },
    MarketResumed { pair: PairId },
    SubscriberDropped { name: String },
}

impl EngineEvent {
    /// Ordering domain for sequence numbering: the pair for order/trade/
    /// market events, the market for position/funding events.
    pub fn stream_key(&self) -> &str {
        match self {
            EngineEvent::OrderPlaced(o)
            | EngineEvent::OrderUpdated(o)
            | EngineEvent::OrderFilled(o)
            | EngineEvent::OrderCancelled(o) => &o.pair,
            EngineEvent::TradeExecuted(t) => &t.pair,
            EngineEvent::PositionOpened(p)
            | EngineEvent::PositionLeverageUpdated(p) => &p.market,
            EngineEvent::PositionClosed { position, .. } => &position.market,
            EngineEvent::PositionLiquidated { market, .. } => market,
            EngineEvent::FundingProcessed { market, .. } => market,
            EngineEvent::MarketHalted { pair } | EngineEvent::MarketResumed { pair } => pair,
            EngineEvent::SubscriberDropped { .. } => "_bus",
        }
    }
}

/// Event plus its per-stream-key sequence number; consumers detect gaps by
/// watching for skips within one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: EngineEvent,
}

struct Subscriber {
    name: String,
    sender: Sender<SequencedEvent>,
}

/// In-process publish/subscribe with per-subscriber ordered queues.
///
/// `emit` never reorders: each subscriber has its own bounded channel and
/// events arrive in publish order. A subscriber whose queue stays full past
/// the configured timeout is dropped, and the drop is announced on the bus.
pub struct EventEmitter {
    subscribers: RwLock<Vec<Subscriber>>,
    sequences: DashMap<String, u64>,
    timeout: Duration,
    dropped: AtomicU64,
}

impl EventEmitter {
    pub fn new(subscriber_timeout: Duration) -> Self {
        EventEmitter {
            subscribers: RwLock::new(Vec::new()),
            sequences: DashMap::new(),
            timeout: subscriber_timeout,
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber with a bounded queue of `capacity` events.
    pub fn subscribe(&self, name: &str, capacity: usize) -> Receiver<SequencedEvent> {
        let (sender, receiver) = bounded(capacity);
        self.subscribers
            .write()
            .expect("subscriber lock")
            .push(Subscriber {
                name: name.to_string(),
                sender,
            });
        receiver
    }

    /// Subscribers dropped for falling behind, over the emitter's lifetime.
    pub fn dropped_subscribers(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn emit(&self, event: EngineEvent) {
        let seq = {
            let mut entry = self.sequences.entry(event.stream_key().to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let sequenced = SequencedEvent { seq, event };

        let mut evicted = Vec::new();
        {
            let mut subscribers = self.subscribers.write().expect("subscriber lock");
            subscribers.retain(|sub| match sub.sender.try_send(sequenced.clone()) {
                Ok(()) => true,
                Err(TrySendError::Disconnected(_)) => {
                    evicted.push(sub.name.clone());
                    false
                }
                Err(TrySendError::Full(ev)) => {
                    // Back-pressure: wait out the slow consumer, then give
                    // up on it so the bus never stalls indefinitely.
                    match sub.sender.send_timeout(ev, self.timeout) {
                        Ok(()) => true,
                        Err(_) => {
                            evicted.push(sub.name.clone());
                            false
                        }
                    }
                }
            });
        }

        for name in evicted {
            warn!("event subscriber {name} dropped");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.emit(EngineEvent::SubscriberDropped { name });
        }
    }
}
