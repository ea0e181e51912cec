//! Host entity: the upper layer above a radio.
//!
//! A host sends its scheduled frames through its radio and counts what the
//! radio delivers. It never asks the radio to transmit while a transmission
//! is in progress; requests that come due meanwhile wait in a queue.

use lrsim_common::{
    DecodedFrame, Entity, EntityId, Event, EventPayload, Frame, MacAddress, NotificationKind,
    SimContext, SimError, TxParams, TxRequest,
};
use lrsim_metrics::{metric_defs, metrics, MetricLabels};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Number of decoded frames a host keeps for inspection by default.
pub const DEFAULT_RECEIVED_CAPACITY: usize = 64;

/// A frame the host sends when its timer fires.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTx {
    /// Receiver address (may be broadcast).
    pub destination: MacAddress,
    /// Payload length in bytes.
    pub payload_len: usize,
    /// Transmission parameters.
    pub params: TxParams,
}

/// Counters kept by a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    /// Frames handed to the radio.
    pub frames_sent: u64,
    /// Frames that waited for the radio to finish a transmission.
    pub frames_deferred: u64,
    /// Decoded frames addressed to this host (unicast or broadcast).
    pub frames_delivered: u64,
    /// Decoded frames addressed to another node.
    pub frames_overheard: u64,
}

/// Upper layer entity driving one radio.
pub struct Host {
    id: EntityId,
    radio: EntityId,
    address: MacAddress,
    schedule: Vec<ScheduledTx>,
    pending: VecDeque<TxRequest>,
    /// A request was handed to the radio and its `TransmissionEnded` has not arrived.
    radio_busy: bool,
    next_sequence: u32,
    /// Most recent decoded frames, oldest first.
    received: VecDeque<DecodedFrame>,
    received_capacity: usize,
    stats: HostStats,
    metric_labels: MetricLabels,
}

impl Host {
    /// Create a host. Timer `i` sends `schedule[i]`.
    pub fn new(
        id: EntityId,
        radio: EntityId,
        address: MacAddress,
        schedule: Vec<ScheduledTx>,
        metric_labels: MetricLabels,
    ) -> Self {
        Host {
            id,
            radio,
            address,
            schedule,
            pending: VecDeque::new(),
            radio_busy: false,
            next_sequence: 0,
            received: VecDeque::new(),
            received_capacity: DEFAULT_RECEIVED_CAPACITY,
            stats: HostStats::default(),
            metric_labels,
        }
    }

    /// Local MAC address.
    pub fn address(&self) -> MacAddress {
        self.address
    }

    /// Host counters.
    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    /// Keep at most `capacity` decoded frames. Zero disables the history.
    pub fn with_received_capacity(mut self, capacity: usize) -> Self {
        self.received_capacity = capacity;
        self.received.truncate(capacity);
        self
    }

    /// The most recent frames delivered by the radio, in arrival order.
    /// Counters in [`HostStats`] cover every frame.
    pub fn received(&self) -> &VecDeque<DecodedFrame> {
        &self.received
    }

    /// Build the frame for a schedule entry. The payload starts with a
    /// big-endian sequence number so frames are distinguishable.
    fn build_request(&mut self, tx: &ScheduledTx) -> TxRequest {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let mut payload: Vec<u8> = sequence.to_be_bytes().into_iter().take(tx.payload_len).collect();
        payload.resize(tx.payload_len, 0);
        TxRequest {
            frame: Frame {
                source: self.address,
                destination: tx.destination,
                payload,
            },
            params: tx.params.clone(),
        }
    }

    fn submit(&mut self, request: TxRequest, ctx: &mut SimContext) {
        if self.radio_busy {
            trace!(host = self.id.0, "radio busy, frame deferred");
            self.stats.frames_deferred += 1;
            self.pending.push_back(request);
            return;
        }
        debug!(
            host = self.id.0,
            destination = %request.frame.destination,
            len = request.frame.payload.len(),
            "sending frame"
        );
        self.radio_busy = true;
        self.stats.frames_sent += 1;
        ctx.post_immediate(vec![self.radio], EventPayload::RadioTxRequest(request));
    }

    fn handle_frame(&mut self, frame: &DecodedFrame) {
        let destination = frame.frame.destination;
        let labels = self.metric_labels.to_labels();
        if destination == self.address || destination.is_broadcast() {
            self.stats.frames_delivered += 1;
            metrics::counter!(metric_defs::HOST_FRAMES_DELIVERED.name, &labels).increment(1);
        } else {
            self.stats.frames_overheard += 1;
            metrics::counter!(metric_defs::HOST_FRAMES_OVERHEARD.name, &labels).increment(1);
        }
        debug!(
            host = self.id.0,
            source = %frame.frame.source,
            %destination,
            "frame received"
        );
        if self.received_capacity == 0 {
            return;
        }
        if self.received.len() == self.received_capacity {
            self.received.pop_front();
        }
        self.received.push_back(frame.clone());
    }
}

impl Entity for Host {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } => {
                let Some(tx) = self.schedule.get(*timer_id as usize).cloned() else {
                    return Err(SimError::HandlerError {
                        entity: self.id,
                        message: format!("no scheduled frame for timer {timer_id}"),
                    });
                };
                let request = self.build_request(&tx);
                self.submit(request, ctx);
            }
            EventPayload::RadioRxFrame(frame) => self.handle_frame(frame),
            EventPayload::Phy(notification) => {
                if notification.kind == NotificationKind::TransmissionEnded {
                    self.radio_busy = false;
                    if let Some(request) = self.pending.pop_front() {
                        self.submit(request, ctx);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lrsim_common::{EventId, PhyNotification, SignalId, SimTime};

    fn host(schedule: Vec<ScheduledTx>) -> Host {
        Host::new(
            EntityId(2),
            EntityId(1),
            MacAddress(7),
            schedule,
            MetricLabels::new("node", "relay"),
        )
    }

    fn event(payload: EventPayload) -> Event {
        Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: EntityId(2),
            targets: vec![EntityId(2)],
            payload,
        }
    }

    fn scheduled(len: usize) -> ScheduledTx {
        ScheduledTx {
            destination: MacAddress(9),
            payload_len: len,
            params: TxParams::default(),
        }
    }

    #[test]
    fn test_timer_sends_frame_to_radio() {
        let mut host = host(vec![scheduled(6)]);
        let mut ctx = SimContext::new(0);
        host.handle_event(&event(EventPayload::Timer { timer_id: 0 }), &mut ctx).unwrap();

        let events = ctx.take_pending_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].targets, vec![EntityId(1)]);
        match &events[0].payload {
            EventPayload::RadioTxRequest(request) => {
                assert_eq!(request.frame.source, MacAddress(7));
                assert_eq!(request.frame.destination, MacAddress(9));
                assert_eq!(request.frame.payload, vec![0, 0, 0, 0, 0, 0]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_requests_wait_for_transmission_end() {
        let mut host = host(vec![scheduled(2), scheduled(20)]);
        let mut ctx = SimContext::new(0);
        host.handle_event(&event(EventPayload::Timer { timer_id: 0 }), &mut ctx).unwrap();
        host.handle_event(&event(EventPayload::Timer { timer_id: 1 }), &mut ctx).unwrap();
        assert_eq!(ctx.take_pending_events().len(), 1);
        assert_eq!(host.stats().frames_deferred, 1);

        let ended = EventPayload::Phy(PhyNotification {
            radio: EntityId(1),
            signal_id: SignalId(1),
            time: SimTime::ZERO,
            kind: NotificationKind::TransmissionEnded,
        });
        host.handle_event(&event(ended), &mut ctx).unwrap();
        let events = ctx.take_pending_events();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            // Second frame carries sequence number 1
            EventPayload::RadioTxRequest(request) => assert_eq!(&request.frame.payload[..4], &[0, 0, 0, 1]),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(host.stats().frames_sent, 2);
    }

    #[test]
    fn test_unknown_timer_is_an_error() {
        let mut host = host(Vec::new());
        let mut ctx = SimContext::new(0);
        assert!(host.handle_event(&event(EventPayload::Timer { timer_id: 3 }), &mut ctx).is_err());
    }

    fn decoded(destination: MacAddress, signal: u64) -> EventPayload {
        EventPayload::RadioRxFrame(DecodedFrame {
            frame: Frame {
                source: MacAddress(1),
                destination,
                payload: vec![],
            },
            signal_id: SignalId(signal),
            transmitter: EntityId(5),
            receiver: EntityId(1),
            tags: Default::default(),
        })
    }

    #[test]
    fn test_delivered_and_overheard() {
        let mut host = host(Vec::new());
        let mut ctx = SimContext::new(0);
        for destination in [MacAddress(7), MacAddress::BROADCAST, MacAddress(8)] {
            host.handle_event(&event(decoded(destination, 1)), &mut ctx).unwrap();
        }
        assert_eq!(host.stats().frames_delivered, 2);
        assert_eq!(host.stats().frames_overheard, 1);
        assert_eq!(host.received().len(), 3);
    }

    #[test]
    fn test_received_history_is_bounded() {
        let mut host = host(Vec::new()).with_received_capacity(3);
        let mut ctx = SimContext::new(0);
        for signal in 0..10 {
            host.handle_event(&event(decoded(MacAddress(7), signal)), &mut ctx).unwrap();
        }
        assert_eq!(host.stats().frames_delivered, 10);
        let kept: Vec<_> = host.received().iter().map(|f| f.signal_id).collect();
        assert_eq!(kept, vec![SignalId(7), SignalId(8), SignalId(9)]);
    }

    #[test]
    fn test_received_history_disabled() {
        let mut host = host(Vec::new()).with_received_capacity(0);
        let mut ctx = SimContext::new(0);
        host.handle_event(&event(decoded(MacAddress(7), 1)), &mut ctx).unwrap();
        assert!(host.received().is_empty());
        assert_eq!(host.stats().frames_delivered, 1);
    }
}
