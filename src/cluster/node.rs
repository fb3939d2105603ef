//! Per-peer forwarder
//!
//! Every downstream peer gets one `Node`: three token-bucket limiters in
//! front of its streams, bounded ingress channels, and a private WAL that
//! absorbs batches the peer could not take. A background task replays logged
//! segments once the peer is healthy again, giving at-least-once delivery in
//! segment order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::limiter::RateLimiter;
use super::transport::Transport;
use super::ClusterSettings;
use crate::config::{INGRESS_DEPTH, MAX_SEND_ATTEMPTS};
use crate::proto;
use crate::wal::{now_micros, segment_file_names, FloatValue, Wal, WalConfig};
use crate::{KairoError, Result};

/// What a range read against a peer produced: the accumulated points plus
/// the error that stopped the drain, if any
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Points received before the stream ended
    pub points: Vec<proto::Point>,
    /// Failure that cut the drain short, if any
    pub error: Option<KairoError>,
}

/// Forwarder for one downstream peer
pub struct Node {
    address: String,
    port: u16,
    settings: ClusterSettings,
    transport: Arc<dyn Transport>,
    w_limiter: RateLimiter,
    r_limiter: RateLimiter,
    m_limiter: RateLimiter,
    pts_tx: mpsc::Sender<Vec<proto::Point>>,
    meta_tx: mpsc::Sender<Vec<proto::Meta>>,
    wal: Arc<Wal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create the forwarder for one peer: its WAL, limiters, ingress
    /// dispatchers and replay task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        address: &str,
        port: u16,
        settings: ClusterSettings,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let wal = Wal::open(WalConfig {
            dir: settings.log_path.join(address),
            ..WalConfig::default()
        })?;
        wal.start();

        let max = settings.grpc_max_server_conn as f64;
        let burst = settings.grpc_burst_server_conn;

        let (pts_tx, mut pts_rx) = mpsc::channel::<Vec<proto::Point>>(INGRESS_DEPTH);
        let (meta_tx, mut meta_rx) = mpsc::channel::<Vec<proto::Meta>>(INGRESS_DEPTH);

        let node = Arc::new(Self {
            address: address.to_string(),
            port,
            settings,
            transport,
            w_limiter: RateLimiter::new(max * 0.9, burst),
            r_limiter: RateLimiter::new(max * 0.1, burst),
            m_limiter: RateLimiter::new(max * 0.1, burst),
            pts_tx,
            meta_tx,
            wal,
            tasks: Mutex::new(Vec::new()),
        });

        info!("new node {}", node.address);

        let writer = node.clone();
        let write_dispatch = tokio::spawn(async move {
            while let Some(pts) = pts_rx.recv().await {
                // write() already spilled the batch to the WAL on failure.
                let _ = writer.write(pts).await;
            }
        });

        let searcher = node.clone();
        let meta_dispatch = tokio::spawn(async move {
            while let Some(metas) = meta_rx.recv().await {
                match searcher.meta(metas).await {
                    Ok(mut found) => {
                        let mut count = 0usize;
                        while found.recv().await.is_some() {
                            count += 1;
                        }
                        debug!("node {} - meta answers: {}", searcher.address, count);
                    }
                    Err(e) => error!("node {} - meta exchange: {}", searcher.address, e),
                }
            }
        });

        let replayer = node.clone();
        let replay = tokio::spawn(async move { replayer.replay_loop().await });

        node.tasks
            .lock()
            .extend([write_dispatch, meta_dispatch, replay]);

        Ok(node)
    }

    /// Peer address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Peer port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Queue a batch for forwarding; blocks while the ingress window is full
    pub async fn enqueue(&self, pts: Vec<proto::Point>) -> Result<()> {
        self.pts_tx
            .send(pts)
            .await
            .map_err(|_| KairoError::Transport("node ingress closed".into()))
    }

    /// Queue a meta batch for forwarding
    pub async fn enqueue_meta(&self, metas: Vec<proto::Meta>) -> Result<()> {
        self.meta_tx
            .send(metas)
            .await
            .map_err(|_| KairoError::Transport("node ingress closed".into()))
    }

    /// Forward a batch now. On any failure the batch lands in the WAL for
    /// replay and the error surfaces: every point is either delivered live
    /// or durably queued.
    pub async fn write(&self, pts: Vec<proto::Point>) -> Result<()> {
        if let Err(e) = self.write_points(self.settings.grpc_timeout, &pts).await {
            error!("node {} - sending points to replay log: {}", self.address, e);
            self.send_to_wal(&pts);
            return Err(e);
        }
        Ok(())
    }

    /// Stream a batch to the peer under one deadline covering the limiter
    /// wait, every send, and the final acknowledgement
    pub async fn write_points(&self, timeout: Duration, pts: &[proto::Point]) -> Result<()> {
        let body = async {
            self.w_limiter.acquire().await;

            let mut stream = self.transport.open_write().await?;

            for p in pts {
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    match stream.send(p.clone()).await {
                        Ok(()) => break,
                        Err(KairoError::StreamClosed) => return Ok(()),
                        Err(e) => {
                            warn!(
                                "node {} - retrying stream send, attempt {}: {}",
                                self.address, attempts, e
                            );
                            if attempts >= MAX_SEND_ATTEMPTS {
                                return Err(e);
                            }
                        }
                    }
                }
            }

            match stream.close_and_recv().await {
                Ok(_) | Err(KairoError::StreamClosed) => Ok(()),
                Err(e) => Err(e),
            }
        };

        match tokio::time::timeout(timeout, body).await {
            Ok(result) => result,
            Err(_) => Err(KairoError::DeadlineExceeded),
        }
    }

    /// Query the peer for one series range, draining the stream until it
    /// ends. The outcome keeps whatever arrived before a failure.
    pub async fn read(&self, ksid: &str, tsid: &str, start: i64, end: i64) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let deadline = tokio::time::Instant::now() + self.settings.grpc_timeout;

        let open = async {
            self.r_limiter.acquire().await;
            self.transport
                .open_read(proto::Query {
                    ksid: ksid.into(),
                    tsid: tsid.into(),
                    start,
                    end,
                })
                .await
        };

        let mut stream = match tokio::time::timeout_at(deadline, open).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                outcome.error = Some(e);
                return outcome;
            }
            Err(_) => {
                outcome.error = Some(KairoError::DeadlineExceeded);
                return outcome;
            }
        };

        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(Ok(p))) => outcome.points.push(p),
                Ok(Some(Err(e))) => {
                    outcome.error = Some(e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    outcome.error = Some(KairoError::DeadlineExceeded);
                    break;
                }
            }
        }

        outcome
    }

    /// Push `metas` to the peer and hand back a channel of the answers,
    /// bounded to exactly the number of questions. The channel always
    /// closes, answered or not.
    pub async fn meta(&self, metas: Vec<proto::Meta>) -> Result<mpsc::Receiver<proto::MetaFound>> {
        let deadline = tokio::time::Instant::now() + self.settings.grpc_timeout;

        if tokio::time::timeout_at(deadline, self.m_limiter.acquire())
            .await
            .is_err()
        {
            return Err(KairoError::DeadlineExceeded);
        }

        let (mut sink, mut stream) = self.transport.open_meta().await?;
        let expected = metas.len();

        let address = self.address.clone();
        tokio::spawn(async move {
            for m in metas {
                match sink.send(m).await {
                    Ok(()) => {}
                    Err(KairoError::StreamClosed) => return,
                    Err(e) => error!("node {} - meta send: {}", address, e),
                }
            }
            if let Err(e) = sink.close_send().await {
                error!("node {} - meta close-send: {}", address, e);
            }
        });

        let (tx, rx) = mpsc::channel(expected.max(1));
        let address = self.address.clone();
        tokio::spawn(async move {
            for _ in 0..expected {
                match stream.next().await {
                    Some(Ok(found)) => {
                        if tx.send(found).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        error!("node {} - meta recv: {}", address, e);
                        continue;
                    }
                    None => return,
                }
            }
        });

        Ok(rx)
    }

    /// Group a failed batch by series key and append it to the replay log
    fn send_to_wal(&self, pts: &[proto::Point]) {
        let mut values: HashMap<String, Vec<FloatValue>> = HashMap::new();
        for p in pts {
            values
                .entry(p.ksts())
                .or_default()
                .push(FloatValue::new(p.date, p.value as f64));
        }

        match self.wal.write_multi(values) {
            Ok(segment) => debug!(
                "node {} - {} points logged to segment {}",
                self.address,
                pts.len(),
                segment
            ),
            Err(e) => error!("node {} - logging points for replay: {}", self.address, e),
        }
    }

    async fn replay_loop(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            let lrt = now_micros();
            ticker.tick().await;
            self.replay_pass(lrt).await;
        }
    }

    /// One replay sweep: when the log saw writes after `lrt`, push every
    /// segment downstream in id order, deleting each one that went through.
    /// The newest segment always stays; it may still be the active write
    /// target.
    async fn replay_pass(&self, lrt: i64) {
        if self.wal.last_write_time() <= lrt {
            return;
        }

        let names = match segment_file_names(self.wal.path()) {
            Ok(names) => names,
            Err(e) => {
                error!("node {} - listing replay segments: {}", self.address, e);
                return;
            }
        };

        let count = names.len();
        for (i, name) in names.iter().enumerate() {
            let pts = match self.wal.replay(name) {
                Ok(pts) => pts,
                Err(e) => {
                    error!("node {} - replaying segment {}: {}", self.address, name, e);
                    continue;
                }
            };

            // Generous deadline so a large backlog can finish.
            let timeout = Duration::from_secs(pts.len().max(1) as u64);
            if let Err(e) = self.write_points(timeout, &pts).await {
                error!(
                    "node {} - forwarding replayed segment {}: {}",
                    self.address, name, e
                );
                continue;
            }

            debug!(
                "node {} - segment {} replayed, {} points",
                self.address,
                name,
                pts.len()
            );

            if i + 1 == count {
                continue;
            }
            if let Err(e) = self.wal.remove(std::slice::from_ref(name)) {
                error!(
                    "node {} - removing replayed segment {}: {}",
                    self.address, name, e
                );
            }
        }
    }

    /// Stop the dispatcher and replay tasks and close the WAL. In-flight
    /// streams fail with a transport error and are not retried.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.wal.close();
        info!("node {} closed", self.address);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
