//! Stream collector
//!
//! Process-scoped idle timer for all open streams. Keeps a heap of streams
//! keyed by next-tick deadline and sweeps it once per tick unit; a stream
//! with no send activity for a full idle timeout and an empty SQ gets an
//! idle-tick object, which makes its session body return EOF and closes the
//! HTTP session cleanly. Streams register on creation and deregister on
//! termination; everything goes through the control channel, so streams
//! never lock collector state directly.

use crate::stream::{Obj, StreamInner, TICK_UNIT};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

pub(crate) enum CollectorCtrl {
    Add(Arc<StreamInner>),
    Remove(String),
}

/// Idle-timer service shared by all streams of a process
pub struct Collector {
    ctrl_tx: mpsc::UnboundedSender<CollectorCtrl>,
}

impl Collector {
    /// Start the collector task; runs until the handle (and all streams)
    /// are gone
    #[must_use]
    pub fn spawn() -> Self {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(ctrl_rx));
        Self { ctrl_tx }
    }

    pub(crate) fn add(&self, stream: Arc<StreamInner>) {
        let _ = self.ctrl_tx.send(CollectorCtrl::Add(stream));
    }

    pub(crate) fn ctrl_tx(&self) -> mpsc::UnboundedSender<CollectorCtrl> {
        self.ctrl_tx.clone()
    }
}

async fn run(mut ctrl_rx: mpsc::UnboundedReceiver<CollectorCtrl>) {
    let mut streams: HashMap<String, Arc<StreamInner>> = HashMap::new();
    let mut heap: BinaryHeap<Reverse<(Instant, String)>> = BinaryHeap::new();
    let mut ticker = tokio::time::interval(TICK_UNIT);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(CollectorCtrl::Add(stream)) => {
                    let key = stream.key();
                    debug!(stream = key, "collector: register");
                    heap.push(Reverse((Instant::now() + stream.idle_timeout(), key.clone())));
                    streams.insert(key, stream);
                }
                Some(CollectorCtrl::Remove(key)) => {
                    debug!(stream = key, "collector: deregister");
                    streams.remove(&key);
                }
                None => return,
            },
            now = ticker.tick() => {
                while let Some(Reverse((deadline, _))) = heap.peek() {
                    if *deadline > now {
                        break;
                    }
                    let Reverse((_, key)) = heap.pop().expect("peeked");
                    let Some(stream) = streams.get(&key) else {
                        continue; // terminated since last sweep
                    };
                    // any send or read since the previous sweep postpones
                    // the tick by a full idle timeout
                    let was_active = stream.in_send.swap(false, Ordering::AcqRel);
                    if !was_active
                        && stream.sess_active.load(Ordering::Acquire)
                        && stream.sq_empty()
                    {
                        let _ = stream.work_tx.try_send(Obj::idle_tick());
                    }
                    heap.push(Reverse((now + stream.idle_timeout(), key)));
                }
            }
        }
    }
}
