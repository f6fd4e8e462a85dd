//! FIX message dispatcher: drains the ingress queue, parses, and publishes
//! normalized order frames into the IPC ring.
//!
//! One dispatcher instance runs on its own thread. It owns the ring's
//! producer end, the per-connection reassembly buffers, and the order-id
//! counter; nothing here is shared, so the hot path takes no locks.
//!
//! Policy on failure is always drop-and-continue: malformed FIX drops the
//! message, a full ring drops the order (logged), and the session stays up.
//! The loop exits when the ingress queue reports closed-and-drained.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::fix::{self, FrameBuffer};
use crate::ipc::message::{FieldId, IpcMessage, MsgType};
use crate::ipc::ring::RingProducer;
use crate::net::RawPacket;
use crate::queue::IngressQueue;

/// Time-in-force carried on every new order: DAY.
const TIF_DAY: u64 = 0;

/// Consumes [`RawPacket`]s and publishes `NEW_ORDER` frames.
pub struct FixDispatcher {
    queue: Arc<dyn IngressQueue<RawPacket>>,
    ring: RingProducer,
    /// Reassembly buffer per client fd.
    buffers: HashMap<i32, FrameBuffer>,
    /// Monotonic per-dispatcher order id, starting at 1.
    next_order_id: u64,
    /// Reused encode buffer.
    scratch: Vec<u8>,
}

impl FixDispatcher {
    pub fn new(queue: Arc<dyn IngressQueue<RawPacket>>, ring: RingProducer) -> Self {
        Self {
            queue,
            ring,
            buffers: HashMap::new(),
            next_order_id: 1,
            scratch: Vec::new(),
        }
    }

    /// Main consumer loop; returns when the ingress queue is closed and
    /// drained.
    pub fn run(&mut self) {
        info!(queue = self.ring.name(), "dispatcher started");
        while let Some(packet) = self.queue.pop() {
            self.handle_packet(&packet);
        }
        info!("ingress queue closed and drained, dispatcher exiting");
    }

    fn handle_packet(&mut self, packet: &RawPacket) {
        let messages = self
            .buffers
            .entry(packet.client_id)
            .or_default()
            .push_bytes(&packet.bytes);

        for message in messages {
            self.dispatch(packet.client_id, &message);
        }
    }

    fn dispatch(&mut self, client_id: i32, raw: &[u8]) {
        let frame = match fix::parse(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(client = client_id, error = %err, "dropping malformed FIX message");
                return;
            }
        };

        match frame.msg_type.as_str() {
            // New Order Single
            "D" => self.handle_new_order(client_id, frame),
            // Logon: acknowledged only; session-level FIX state is not kept.
            "A" => info!(client = client_id, "logon received"),
            other => {
                warn!(client = client_id, msg_type = other, "unhandled FIX message type, dropping");
            }
        }
    }

    fn handle_new_order(&mut self, client_id: i32, frame: fix::FixFrame) {
        let (Some(symbol), Some(side), Some(price), Some(qty)) =
            (frame.symbol, frame.side, frame.price, frame.qty)
        else {
            warn!(client = client_id, "new order missing required fields, dropping");
            return;
        };

        let order_id = self.next_order_id;
        self.next_order_id += 1;

        let mut msg = IpcMessage::new(MsgType::NewOrder);
        msg.add_str(FieldId::Symbol, &symbol);
        msg.add_u64(FieldId::Side, side.wire_value());
        msg.add_i64(FieldId::Price, price);
        msg.add_u64(FieldId::Qty, qty);
        msg.add_u64(FieldId::ClientId, client_id as u64);
        msg.add_u64(FieldId::OrderId, order_id);
        msg.add_u64(FieldId::Tif, TIF_DAY);
        msg.encode(&mut self.scratch);

        if self.ring.write(&self.scratch) {
            debug!(
                client = client_id,
                order_id,
                symbol = symbol.as_str(),
                side = side.wire_value(),
                price,
                qty,
                "order published"
            );
        } else {
            // Non-blocking drop-at-producer: the sequencer is behind and the
            // order is shed here rather than stalling the parse loop.
            warn!(client = client_id, order_id, "ring full, dropping order");
        }
    }
}
