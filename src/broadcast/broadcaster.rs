use std::{
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use super::notification::{Batch, Dispatch, Notification};

/// Receiver of dispatches. Called from the broadcaster thread, fire and
/// forget.
pub trait BroadcastSink: Send + Sync {
    fn broadcast(&self, dispatch: &Dispatch);
}

impl<F> BroadcastSink for F
where
    F: Fn(&Dispatch) + Send + Sync,
{
    fn broadcast(&self, dispatch: &Dispatch) {
        self(dispatch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscribers = Arc<RwLock<Vec<(SubscriptionId, Arc<dyn BroadcastSink>)>>>;

enum Command {
    Publish(Notification),
    /// dispatch whatever is pending now, then ack
    Flush(Sender<()>),
    Stop,
}

/// Batches notifications over a fixed window and dispatches them, one
/// dispatch per type, to every subscriber.
///
/// Idle until the first notification arrives; that opens a window during
/// which further notifications coalesce. When it closes the batch is
/// dispatched in type order and the broadcaster goes back to idle.
pub struct Broadcaster {
    commands: Sender<Command>,
    subscribers: Subscribers,
    next_id: AtomicU64,
    batching: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn start(window: Duration) -> Self {
        let (commands, inbox) = channel::unbounded();
        let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));
        let batching = Arc::new(AtomicBool::new(false));

        let worker = {
            let subscribers = subscribers.clone();
            let batching = batching.clone();
            thread::spawn(move || run(inbox, window, subscribers, batching))
        };
        info!("broadcaster started with a {} ms window", window.as_millis());

        Self {
            commands,
            subscribers,
            next_id: AtomicU64::new(0),
            batching,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues a notification. Dropped with a debug log once stopped.
    pub fn publish(&self, notification: Notification) {
        self.batching.store(true, Ordering::SeqCst);
        if self.commands.send(Command::Publish(notification)).is_err() {
            self.batching.store(false, Ordering::SeqCst);
            debug!("broadcaster stopped, notification dropped");
        }
    }

    pub fn subscribe(&self, sink: impl BroadcastSink + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sink: Arc<dyn BroadcastSink> = Arc::new(sink);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, sink));
        id
    }

    /// subscription delivering dispatches over a channel
    pub fn subscribe_channel(&self) -> (SubscriptionId, Receiver<Dispatch>) {
        let (tx, rx) = channel::unbounded();
        let id = self.subscribe(move |dispatch: &Dispatch| {
            let _ = tx.send(dispatch.clone());
        });
        (id, rx)
    }

    /// Returns whether the subscription was still active. Pending writes and
    /// other subscribers are unaffected.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    /// Dispatches everything published so far without waiting for the
    /// window, and returns once subscribers have been called.
    pub fn flush(&self) {
        let (ack, done) = channel::bounded(1);
        if self.commands.send(Command::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    pub fn is_batching(&self) -> bool {
        self.batching.load(Ordering::SeqCst)
    }

    /// Dispatches pending notifications and joins the worker. Idempotent.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };

        let _ = self.commands.send(Command::Stop);
        if worker.join().is_err() {
            warn!("broadcaster thread panicked");
        }
        info!("broadcaster stopped");
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    inbox: Receiver<Command>,
    window: Duration,
    subscribers: Subscribers,
    batching: Arc<AtomicBool>,
) {
    let mut batch = Batch::default();
    let mut deadline: Option<Instant> = None;

    loop {
        let received = match deadline {
            Some(at) => inbox.recv_deadline(at),
            None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Command::Publish(notification)) => {
                if deadline.is_none() {
                    deadline = Some(Instant::now() + window);
                    batching.store(true, Ordering::SeqCst);
                }
                batch.push(notification);
            }
            Ok(Command::Flush(ack)) => {
                dispatch(&subscribers, &mut batch);
                deadline = None;
                batching.store(false, Ordering::SeqCst);
                let _ = ack.send(());
            }
            Err(RecvTimeoutError::Timeout) => {
                dispatch(&subscribers, &mut batch);
                deadline = None;
                batching.store(false, Ordering::SeqCst);
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => {
                dispatch(&subscribers, &mut batch);
                batching.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}

fn dispatch(subscribers: &Subscribers, batch: &mut Batch) {
    if batch.is_empty() {
        return;
    }
    let dispatches = batch.drain();

    // sinks are called outside the lock so they may unsubscribe themselves
    let sinks: Vec<Arc<dyn BroadcastSink>> = subscribers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, sink)| sink.clone())
        .collect();

    for dispatch in &dispatches {
        debug!(
            "dispatching {} x{} to {} subscribers",
            dispatch.event_type,
            dispatch.payloads.len(),
            sinks.len()
        );
        for sink in &sinks {
            sink.broadcast(dispatch);
        }
    }
}
