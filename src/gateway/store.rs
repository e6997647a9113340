use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::agent::ChatKind;
use crate::config::ResolvedAccount;

/// Visible stream content cap; the bot client renders at most this much.
pub const STREAM_MAX_BYTES: usize = 20 * 1024;
/// DM-fallback accumulator cap.
pub const DM_MAX_BYTES: usize = 200 * 1024;

const STREAM_TTL: Duration = Duration::from_secs(600);
const PENDING_TTL: Duration = Duration::from_secs(600);
const REPLY_URL_TTL: Duration = Duration::from_secs(3_600);
const APP_SEEN_TTL: Duration = Duration::from_secs(600);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

pub fn new_stream_id() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill(&mut raw[..]);
    hex::encode(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackMode {
    #[default]
    None,
    Media,
    Timeout,
    Error,
}

#[derive(Debug, Clone)]
pub struct StreamImage {
    pub base64: String,
    pub md5: String,
}

/// One passive-stream reply slot.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub stream_id: String,
    pub msg_id: Option<String>,
    pub conversation_key: String,
    pub batch_key: String,
    pub user_id: String,
    pub chat: ChatKind,
    pub chat_id: Option<String>,
    pub ai_agent_id: String,
    pub task_key: String,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub started: bool,
    pub finished: bool,
    pub error: bool,
    pub content: String,
    pub images: Vec<StreamImage>,
    pub dm_content: String,
    pub agent_media_keys: HashSet<String>,
    pub fallback: FallbackMode,
    pub fallback_prompt_sent_at: Option<Instant>,
    pub final_delivered_at: Option<Instant>,
}

/// Routing context of the first message of a batch, carried through the
/// queue to the driver.
#[derive(Debug, Clone)]
pub struct BatchOrigin {
    pub account: Arc<ResolvedAccount>,
    pub user_id: String,
    pub chat: ChatKind,
    pub chat_id: Option<String>,
    pub ai_agent_id: String,
    pub msg_type: String,
    pub payload: Value,
}

/// A batch waiting for its debounce flush.
#[derive(Debug)]
pub struct PendingBatch {
    pub batch_key: String,
    pub conversation_key: String,
    pub stream_id: String,
    pub origin: BatchOrigin,
    pub contents: Vec<String>,
    pub msg_ids: Vec<String>,
    pub created_at: Instant,
    pub ready_to_flush: bool,
    timer: Option<JoinHandle<()>>,
}

impl PendingBatch {
    /// A one-shot batch driven outside the queue; no debounce timer.
    pub fn detached(
        batch_key: String,
        conversation_key: String,
        stream_id: String,
        origin: BatchOrigin,
        content: String,
        msg_id: String,
    ) -> Self {
        Self {
            batch_key,
            conversation_key,
            stream_id,
            origin,
            contents: vec![content],
            msg_ids: if msg_id.is_empty() { Vec::new() } else { vec![msg_id] },
            created_at: Instant::now(),
            ready_to_flush: true,
            timer: None,
        }
    }
}

#[derive(Debug)]
struct ConversationEntry {
    active_batch_key: String,
    queued_batch_key: Option<String>,
    next_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStatus {
    ActiveNew,
    ActiveMerged,
    QueuedNew,
    QueuedMerged,
}

#[derive(Debug, Clone)]
pub struct Admission {
    pub stream_id: String,
    pub status: AdmissionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyUrlPolicy {
    Once,
    Multi,
}

#[derive(Debug, Clone)]
pub struct ReplyUrlEntry {
    pub response_url: String,
    pub proxy_url: Option<String>,
    pub created_at: Instant,
    pub used_at: Option<Instant>,
    pub last_error: Option<String>,
}

/// The conversation queue proper: conversations, pending batches and their
/// ack streams move together, so they share one lock.
#[derive(Default)]
struct QueueState {
    conversations: HashMap<String, ConversationEntry>,
    pending: HashMap<String, PendingBatch>,
    ack_streams: HashMap<String, Vec<String>>,
}

pub type FlushHandler = Arc<dyn Fn(PendingBatch) + Send + Sync>;

/// Process-wide state for both channels. Lock order where nesting is
/// unavoidable: queue before streams; no lock is ever held across I/O.
pub struct GatewayStore {
    queue: Mutex<QueueState>,
    streams: Mutex<HashMap<String, StreamState>>,
    msg_streams: Mutex<HashMap<String, String>>,
    reply_urls: Mutex<HashMap<String, ReplyUrlEntry>>,
    app_seen: Mutex<HashMap<String, Instant>>,
    flush_handler: Mutex<Option<FlushHandler>>,
    pruner_started: AtomicBool,
    reply_url_policy: ReplyUrlPolicy,
}

impl GatewayStore {
    pub fn new() -> Arc<Self> {
        Self::with_policy(ReplyUrlPolicy::Multi)
    }

    pub fn with_policy(policy: ReplyUrlPolicy) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(QueueState::default()),
            streams: Mutex::new(HashMap::new()),
            msg_streams: Mutex::new(HashMap::new()),
            reply_urls: Mutex::new(HashMap::new()),
            app_seen: Mutex::new(HashMap::new()),
            flush_handler: Mutex::new(None),
            pruner_started: AtomicBool::new(false),
            reply_url_policy: policy,
        })
    }

    /// Register the flush handler and start the prune task. One handler per
    /// process; re-registration replaces it.
    pub fn set_flush_handler(self: &Arc<Self>, handler: FlushHandler) {
        *self.flush_handler.lock() = Some(handler);
        if !self.pruner_started.swap(true, Ordering::SeqCst) {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    store.prune();
                }
            });
        }
    }

    // ── Admission ───────────────────────────────────────────────

    /// Admit one inbound message into the conversation queue.
    ///
    /// The first message of an idle conversation opens the initial batch;
    /// follow-ups while the initial batch is live never merge into it (its
    /// placeholder is already committed to the platform) and instead open or
    /// merge into a single queued batch. A promoted queued batch accepts
    /// merges only until its stream starts.
    pub fn add_pending_message(
        self: &Arc<Self>,
        conversation_key: &str,
        origin: BatchOrigin,
        content: String,
        msg_id: Option<String>,
        debounce: Duration,
    ) -> Admission {
        let mut queue = self.queue.lock();

        let Some(entry) = queue.conversations.get_mut(conversation_key) else {
            // Case A: idle conversation; the initial batch key is the
            // conversation key itself.
            let batch_key = conversation_key.to_string();
            queue.conversations.insert(
                conversation_key.to_string(),
                ConversationEntry {
                    active_batch_key: batch_key.clone(),
                    queued_batch_key: None,
                    next_seq: 1,
                },
            );
            let stream_id = self.create_batch_locked(
                &mut queue,
                conversation_key,
                &batch_key,
                origin,
                content,
                msg_id,
                debounce,
            );
            return Admission {
                stream_id,
                status: AdmissionStatus::ActiveNew,
            };
        };

        let active_key = entry.active_batch_key.clone();
        let queued_key = entry.queued_batch_key.clone();
        let seq = entry.next_seq;
        entry.next_seq += 1;
        let active_is_initial = active_key == conversation_key;

        if !active_is_initial {
            // Case C: the active batch is a promoted queued batch; merge into
            // it while its pending still exists and its stream is unstarted.
            let can_merge = match queue.pending.get(&active_key) {
                Some(pending) => self
                    .streams
                    .lock()
                    .get(&pending.stream_id)
                    .map(|s| !s.started)
                    .unwrap_or(false),
                None => false,
            };
            if can_merge {
                if let Some(stream_id) = self.merge_into_locked(
                    &mut queue,
                    &active_key,
                    content.clone(),
                    msg_id.clone(),
                    debounce,
                ) {
                    return Admission {
                        stream_id,
                        status: AdmissionStatus::ActiveMerged,
                    };
                }
            }
        }

        if let Some(queued_key) = queued_key {
            // Case D: merge into the queued follow-up batch.
            if let Some(stream_id) = self.merge_into_locked(
                &mut queue,
                &queued_key,
                content.clone(),
                msg_id.clone(),
                debounce,
            ) {
                return Admission {
                    stream_id,
                    status: AdmissionStatus::QueuedMerged,
                };
            }
        }

        // Case E (and case B's fall-through): open the queued follow-up batch.
        let batch_key = format!("{conversation_key}#q{seq}");
        if let Some(entry) = queue.conversations.get_mut(conversation_key) {
            entry.queued_batch_key = Some(batch_key.clone());
        }
        let stream_id = self.create_batch_locked(
            &mut queue,
            conversation_key,
            &batch_key,
            origin,
            content,
            msg_id,
            debounce,
        );
        Admission {
            stream_id,
            status: AdmissionStatus::QueuedNew,
        }
    }

    fn create_batch_locked(
        self: &Arc<Self>,
        queue: &mut QueueState,
        conversation_key: &str,
        batch_key: &str,
        origin: BatchOrigin,
        content: String,
        msg_id: Option<String>,
        debounce: Duration,
    ) -> String {
        let stream_id = self.create_stream_locked(conversation_key, batch_key, &origin, msg_id.clone());
        if let Some(msg_id) = msg_id.as_deref() {
            self.msg_streams
                .lock()
                .insert(msg_id.to_string(), stream_id.clone());
        }
        let timer = self.spawn_debounce(batch_key, debounce);
        queue.pending.insert(
            batch_key.to_string(),
            PendingBatch {
                batch_key: batch_key.to_string(),
                conversation_key: conversation_key.to_string(),
                stream_id: stream_id.clone(),
                origin,
                contents: vec![content],
                msg_ids: msg_id.into_iter().collect(),
                created_at: Instant::now(),
                ready_to_flush: false,
                timer: Some(timer),
            },
        );
        stream_id
    }

    /// Merged msg-ids are recorded on the pending for retry detection but
    /// deliberately not mapped to the batch stream: a platform retry of a
    /// merged message must not produce a second copy of the final answer.
    /// Returns None when the target pending is already gone.
    fn merge_into_locked(
        self: &Arc<Self>,
        queue: &mut QueueState,
        batch_key: &str,
        content: String,
        msg_id: Option<String>,
        debounce: Duration,
    ) -> Option<String> {
        let pending = queue.pending.get_mut(batch_key)?;
        pending.contents.push(content);
        if let Some(msg_id) = msg_id {
            pending.msg_ids.push(msg_id);
        }
        if let Some(old) = pending.timer.take() {
            old.abort();
        }
        pending.timer = Some(self.spawn_debounce(batch_key, debounce));
        Some(pending.stream_id.clone())
    }

    fn create_stream_locked(
        &self,
        conversation_key: &str,
        batch_key: &str,
        origin: &BatchOrigin,
        msg_id: Option<String>,
    ) -> String {
        let stream_id = new_stream_id();
        let now = Instant::now();
        self.streams.lock().insert(
            stream_id.clone(),
            StreamState {
                stream_id: stream_id.clone(),
                msg_id,
                conversation_key: conversation_key.to_string(),
                batch_key: batch_key.to_string(),
                user_id: origin.user_id.clone(),
                chat: origin.chat,
                chat_id: origin.chat_id.clone(),
                ai_agent_id: origin.ai_agent_id.clone(),
                task_key: format!("{}:{conversation_key}", origin.ai_agent_id),
                created_at: now,
                updated_at: now,
                started: false,
                finished: false,
                error: false,
                content: String::new(),
                images: Vec::new(),
                dm_content: String::new(),
                agent_media_keys: HashSet::new(),
                fallback: FallbackMode::None,
                fallback_prompt_sent_at: None,
                final_delivered_at: None,
            },
        );
        stream_id
    }

    /// Allocate a stream outside the conversation queue, for synthetic
    /// messages (card interactions) that own their reply slot directly.
    pub fn create_stream(
        &self,
        conversation_key: &str,
        batch_key: &str,
        origin: &BatchOrigin,
        msg_id: Option<String>,
    ) -> String {
        self.create_stream_locked(conversation_key, batch_key, origin, msg_id)
    }

    fn spawn_debounce(self: &Arc<Self>, batch_key: &str, debounce: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let key = batch_key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            store.request_flush(&key);
        })
    }

    // ── Flush & completion ──────────────────────────────────────

    /// Debounce expiry. The active batch flushes now; a queued batch only
    /// arms itself and waits for the active batch to finish.
    pub fn request_flush(&self, batch_key: &str) {
        let flushable = {
            let mut queue = self.queue.lock();
            let conversation_key = {
                let Some(pending) = queue.pending.get(batch_key) else {
                    return;
                };
                pending.conversation_key.clone()
            };
            let is_active = queue
                .conversations
                .get(&conversation_key)
                .map(|entry| entry.active_batch_key == batch_key)
                .unwrap_or(false);
            if !is_active {
                let Some(pending) = queue.pending.get_mut(batch_key) else {
                    return;
                };
                pending.ready_to_flush = true;
                return;
            }
            Self::take_pending_locked(&mut queue, batch_key)
        };
        self.run_flush(flushable);
    }

    /// Advance the conversation once its active batch's stream finishes.
    pub fn on_stream_finished(&self, stream_id: &str) {
        let Some((conversation_key, batch_key)) = self
            .streams
            .lock()
            .get(stream_id)
            .map(|s| (s.conversation_key.clone(), s.batch_key.clone()))
        else {
            return;
        };

        let flushable = {
            let mut queue = self.queue.lock();
            let Some(entry) = queue.conversations.get_mut(&conversation_key) else {
                return;
            };
            if entry.active_batch_key != batch_key {
                return;
            }
            match entry.queued_batch_key.take() {
                None => {
                    queue.conversations.remove(&conversation_key);
                    None
                }
                Some(promoted) => {
                    entry.active_batch_key = promoted.clone();
                    let ready = queue
                        .pending
                        .get(&promoted)
                        .map(|p| p.ready_to_flush)
                        .unwrap_or(false);
                    if ready {
                        Self::take_pending_locked(&mut queue, &promoted)
                    } else {
                        // The promoted batch keeps its original debounce
                        // timer; promotion only changes what a flush means.
                        tracing::debug!(
                            "batch promoted to active, debounce still pending: {promoted}"
                        );
                        None
                    }
                }
            }
        };
        self.run_flush(flushable);
    }

    fn take_pending_locked(queue: &mut QueueState, batch_key: &str) -> Option<PendingBatch> {
        let mut pending = queue.pending.remove(batch_key)?;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        Some(pending)
    }

    fn run_flush(&self, pending: Option<PendingBatch>) {
        let Some(pending) = pending else { return };
        let handler = self.flush_handler.lock().clone();
        match handler {
            Some(handler) => handler(pending),
            None => tracing::warn!(
                "batch flushed with no handler registered: {}",
                pending.batch_key
            ),
        }
    }

    // ── Msg-id dedupe ───────────────────────────────────────────

    pub fn stream_for_msg(&self, msg_id: &str) -> Option<String> {
        self.msg_streams.lock().get(msg_id).cloned()
    }

    pub fn map_msg(&self, msg_id: &str, stream_id: &str) {
        self.msg_streams
            .lock()
            .insert(msg_id.to_string(), stream_id.to_string());
    }

    /// Application-channel dedupe: true when the msg-id was already seen
    /// within the TTL window.
    pub fn app_msg_seen(&self, msg_id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.app_seen.lock();
        seen.retain(|_, at| now.duration_since(*at) <= APP_SEEN_TTL);
        seen.insert(msg_id.to_string(), now).is_some()
    }

    // ── Ack streams ─────────────────────────────────────────────

    /// Allocate an auxiliary stream whose only content is a "merged into an
    /// earlier reply" note for one coalesced message.
    pub fn add_ack_stream_for_batch(
        &self,
        batch_key: &str,
        origin: &BatchOrigin,
        conversation_key: &str,
        content: &str,
    ) -> String {
        let stream_id = self.create_stream_locked(conversation_key, batch_key, origin, None);
        {
            let mut streams = self.streams.lock();
            if let Some(stream) = streams.get_mut(&stream_id) {
                stream.started = true;
                stream.content = content.to_string();
                stream.updated_at = Instant::now();
            }
        }
        self.queue
            .lock()
            .ack_streams
            .entry(batch_key.to_string())
            .or_default()
            .push(stream_id.clone());
        stream_id
    }

    pub fn take_ack_streams(&self, batch_key: &str) -> Vec<String> {
        self.queue
            .lock()
            .ack_streams
            .remove(batch_key)
            .unwrap_or_default()
    }

    // ── Stream mutation ─────────────────────────────────────────

    pub fn stream_snapshot(&self, stream_id: &str) -> Option<StreamState> {
        self.streams.lock().get(stream_id).cloned()
    }

    pub fn mark_started(&self, stream_id: &str) {
        self.with_stream(stream_id, |s| s.started = true);
    }

    /// Replace the visible content. Frozen once the stream finished.
    pub fn set_stream_content(&self, stream_id: &str, content: &str) {
        self.with_stream(stream_id, |s| {
            if !s.finished {
                s.content = tail_utf8(content, STREAM_MAX_BYTES);
            }
        });
    }

    /// Append a block of agent text; the visible window keeps the most
    /// recent STREAM_MAX_BYTES.
    pub fn append_stream_text(&self, stream_id: &str, text: &str) {
        self.with_stream(stream_id, |s| {
            if !s.finished {
                s.content.push_str(text);
                if s.content.len() > STREAM_MAX_BYTES {
                    s.content = tail_utf8(&s.content, STREAM_MAX_BYTES);
                }
            }
        });
    }

    /// Accumulate the DM-fallback transcript, head-capped at DM_MAX_BYTES.
    pub fn append_dm_text(&self, stream_id: &str, text: &str) {
        self.with_stream(stream_id, |s| {
            let room = DM_MAX_BYTES.saturating_sub(s.dm_content.len());
            if room > 0 {
                s.dm_content.push_str(head_utf8(text, room));
            }
        });
    }

    pub fn push_image(&self, stream_id: &str, image: StreamImage) {
        self.with_stream(stream_id, |s| s.images.push(image));
    }

    /// Monotonic finish.
    pub fn finish_stream(&self, stream_id: &str) {
        self.with_stream(stream_id, |s| s.finished = true);
    }

    /// Finish with a fallback prompt; this is the one write allowed to
    /// replace content after `finished` is set.
    pub fn finish_stream_with(&self, stream_id: &str, content: &str, mode: FallbackMode) {
        self.with_stream(stream_id, |s| {
            s.content = tail_utf8(content, STREAM_MAX_BYTES);
            s.finished = true;
            if s.fallback == FallbackMode::None {
                s.fallback = mode;
            }
        });
    }

    pub fn set_stream_error(&self, stream_id: &str, message: &str) {
        self.with_stream(stream_id, |s| {
            s.content = tail_utf8(message, STREAM_MAX_BYTES);
            s.finished = true;
            s.error = true;
            s.fallback = FallbackMode::Error;
        });
    }

    /// Flip into a fallback mode. Returns false when some fallback is
    /// already active.
    pub fn enter_fallback(&self, stream_id: &str, mode: FallbackMode) -> bool {
        let mut entered = false;
        self.with_stream(stream_id, |s| {
            if s.fallback == FallbackMode::None {
                s.fallback = mode;
                entered = true;
            }
        });
        entered
    }

    pub fn mark_fallback_prompt_sent(&self, stream_id: &str) -> bool {
        let mut first = false;
        self.with_stream(stream_id, |s| {
            if s.fallback_prompt_sent_at.is_none() {
                s.fallback_prompt_sent_at = Some(Instant::now());
                first = true;
            }
        });
        first
    }

    pub fn mark_final_delivered(&self, stream_id: &str) -> bool {
        let mut first = false;
        self.with_stream(stream_id, |s| {
            if s.final_delivered_at.is_none() {
                s.final_delivered_at = Some(Instant::now());
                first = true;
            }
        });
        first
    }

    /// Record a DM media transmission; true when the key is new for this
    /// stream.
    pub fn note_media_key(&self, stream_id: &str, key: &str) -> bool {
        let mut fresh = false;
        self.with_stream(stream_id, |s| {
            fresh = s.agent_media_keys.insert(key.to_string());
        });
        fresh
    }

    #[cfg(test)]
    pub(crate) fn streams_for_test(
        &self,
    ) -> parking_lot::MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock()
    }

    fn with_stream(&self, stream_id: &str, f: impl FnOnce(&mut StreamState)) {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(stream_id) {
            f(stream);
            stream.updated_at = Instant::now();
        }
    }

    // ── Passive-reply URLs ──────────────────────────────────────

    pub fn store_reply_url(&self, stream_id: &str, response_url: &str, proxy_url: Option<&str>) {
        let url = response_url.trim();
        if url.is_empty() {
            return;
        }
        self.reply_urls.lock().insert(
            stream_id.to_string(),
            ReplyUrlEntry {
                response_url: url.to_string(),
                proxy_url: proxy_url.map(ToOwned::to_owned),
                created_at: Instant::now(),
                used_at: None,
                last_error: None,
            },
        );
    }

    pub fn reply_url(&self, stream_id: &str) -> Option<ReplyUrlEntry> {
        self.reply_urls.lock().get(stream_id).cloned()
    }

    /// Run `f` against the stored reply URL, recording use or the failure.
    pub async fn use_reply_url<F, Fut, T>(&self, stream_id: &str, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(String, Option<String>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let entry = self
            .reply_url(stream_id)
            .ok_or_else(|| anyhow::anyhow!("no reply url stored for stream {stream_id}"))?;

        match f(entry.response_url.clone(), entry.proxy_url.clone()).await {
            Ok(value) => {
                let mut urls = self.reply_urls.lock();
                match self.reply_url_policy {
                    ReplyUrlPolicy::Once => {
                        urls.remove(stream_id);
                    }
                    ReplyUrlPolicy::Multi => {
                        if let Some(entry) = urls.get_mut(stream_id) {
                            entry.used_at = Some(Instant::now());
                        }
                    }
                }
                Ok(value)
            }
            Err(err) => {
                if let Some(entry) = self.reply_urls.lock().get_mut(stream_id) {
                    entry.last_error = Some(err.to_string());
                }
                Err(err)
            }
        }
    }

    // ── Pruning ─────────────────────────────────────────────────

    /// One prune pass: TTL out streams, reply URLs, stale pendings and seen
    /// msg-ids, then drop dangling mappings and empty conversations.
    pub fn prune(&self) {
        let now = Instant::now();

        let live_batches: HashSet<String> = {
            let mut streams = self.streams.lock();
            streams.retain(|_, s| now.duration_since(s.updated_at) <= STREAM_TTL);
            streams.values().map(|s| s.batch_key.clone()).collect()
        };

        {
            let streams = self.streams.lock();
            self.msg_streams
                .lock()
                .retain(|_, stream_id| streams.contains_key(stream_id));
        }

        self.reply_urls
            .lock()
            .retain(|_, entry| now.duration_since(entry.created_at) <= REPLY_URL_TTL);

        self.app_seen
            .lock()
            .retain(|_, at| now.duration_since(*at) <= APP_SEEN_TTL);

        let mut queue = self.queue.lock();
        let stale: Vec<String> = queue
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.created_at) > PENDING_TTL)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            if let Some(mut pending) = queue.pending.remove(key) {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
                tracing::warn!("pending batch timed out before flush: {key}");
            }
        }
        let pending_keys: HashSet<String> = queue.pending.keys().cloned().collect();
        queue.conversations.retain(|_, entry| {
            if let Some(queued) = entry.queued_batch_key.as_deref() {
                if !pending_keys.contains(queued) && !live_batches.contains(queued) {
                    entry.queued_batch_key = None;
                }
            }
            let active_alive = pending_keys.contains(&entry.active_batch_key)
                || live_batches.contains(&entry.active_batch_key);
            active_alive || entry.queued_batch_key.is_some()
        });
        let conversations = &queue.conversations;
        let retained: HashSet<String> = conversations
            .values()
            .flat_map(|entry| {
                entry
                    .queued_batch_key
                    .iter()
                    .cloned()
                    .chain(std::iter::once(entry.active_batch_key.clone()))
            })
            .collect();
        queue
            .ack_streams
            .retain(|batch_key, _| retained.contains(batch_key) || live_batches.contains(batch_key));
    }
}

// ── UTF-8 byte slicing ──────────────────────────────────────────

/// Keep the rightmost `max` bytes, never splitting a code point.
pub fn tail_utf8(input: &str, max: usize) -> String {
    if input.len() <= max {
        return input.to_string();
    }
    let mut start = input.len() - max;
    while start < input.len() && !input.is_char_boundary(start) {
        start += 1;
    }
    input[start..].to_string()
}

/// Keep the leftmost `max` bytes, never splitting a code point.
pub fn head_utf8(input: &str, max: usize) -> &str {
    if input.len() <= max {
        return input;
    }
    let mut end = max;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkOptions, TableMode};
    use parking_lot::Mutex as PlMutex;

    fn test_account() -> Arc<ResolvedAccount> {
        Arc::new(ResolvedAccount {
            name: "acct".to_string(),
            corp_id: "ww1".to_string(),
            agent_id: "1000002".to_string(),
            app_secret: "s".to_string(),
            bot_token: "t".to_string(),
            bot_encoding_aes_key: "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG".to_string(),
            app_token: "t2".to_string(),
            app_encoding_aes_key: "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG".to_string(),
            receiver_id: String::new(),
            welcome_text: None,
            stream_placeholder: "1".to_string(),
            table_mode: TableMode::Fence,
            debounce_ms: 50,
            network: NetworkOptions::default(),
        })
    }

    fn origin() -> BatchOrigin {
        BatchOrigin {
            account: test_account(),
            user_id: "u1".to_string(),
            chat: ChatKind::Direct,
            chat_id: None,
            ai_agent_id: "bot1".to_string(),
            msg_type: "text".to_string(),
            payload: serde_json::json!({"text": {"content": "hi"}}),
        }
    }

    fn recording_handler(store: &Arc<GatewayStore>) -> Arc<PlMutex<Vec<String>>> {
        let flushed = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        store.set_flush_handler(Arc::new(move |batch: PendingBatch| {
            sink.lock().push(batch.batch_key.clone());
        }));
        flushed
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initial_active_batch_does_not_merge() {
        let store = GatewayStore::new();
        let flushed = recording_handler(&store);
        let debounce = Duration::from_millis(100);

        let a1 = store.add_pending_message("ck", origin(), "m1".into(), Some("x1".into()), debounce);
        let a2 = store.add_pending_message("ck", origin(), "m2".into(), Some("x2".into()), debounce);
        assert_eq!(a1.status, AdmissionStatus::ActiveNew);
        assert_eq!(a2.status, AdmissionStatus::QueuedNew);
        assert_ne!(a1.stream_id, a2.stream_id);

        tokio::time::advance(Duration::from_millis(150)).await;
        settle().await;
        // Only the active batch flushed; the queued one is armed but waiting.
        assert_eq!(flushed.lock().clone(), vec!["ck".to_string()]);

        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(flushed.lock().len(), 1, "queued batch must wait for finish");

        store.on_stream_finished(&a1.stream_id);
        settle().await;
        assert_eq!(flushed.lock().clone(), vec!["ck".to_string(), "ck#q1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn merge_into_unstarted_promoted_batch() {
        let store = GatewayStore::new();
        let flushed = recording_handler(&store);

        let a1 = store.add_pending_message(
            "ck",
            origin(),
            "m1".into(),
            Some("x1".into()),
            Duration::from_millis(10),
        );
        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(flushed.lock().len(), 1);
        store.mark_started(&a1.stream_id);

        // m2 lands while m1 is still processing: queued with a long debounce.
        let a2 = store.add_pending_message(
            "ck",
            origin(),
            "m2".into(),
            Some("x2".into()),
            Duration::from_millis(100),
        );
        assert_eq!(a2.status, AdmissionStatus::QueuedNew);

        // m1 finishes: m2's batch is promoted to active, debounce untouched,
        // its stream not yet started.
        store.on_stream_finished(&a1.stream_id);
        settle().await;
        assert_eq!(flushed.lock().len(), 1, "promoted batch waits for its debounce");

        // m3 merges into the promoted-but-unstarted batch.
        let a3 = store.add_pending_message(
            "ck",
            origin(),
            "m3".into(),
            Some("x3".into()),
            Duration::from_millis(30),
        );
        assert_eq!(a3.status, AdmissionStatus::ActiveMerged);
        assert_eq!(a3.stream_id, a2.stream_id);

        // The reset (30 ms) debounce now flushes the promoted batch.
        tokio::time::advance(Duration::from_millis(40)).await;
        settle().await;
        assert_eq!(flushed.lock().clone(), vec!["ck".to_string(), "ck#q1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_conversation_resets_to_active_new() {
        let store = GatewayStore::new();
        let _flushed = recording_handler(&store);
        let a1 = store.add_pending_message(
            "ck",
            origin(),
            "m1".into(),
            Some("x1".into()),
            Duration::from_millis(10),
        );
        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;
        store.mark_started(&a1.stream_id);
        store.on_stream_finished(&a1.stream_id);

        let a2 = store.add_pending_message(
            "ck",
            origin(),
            "m2".into(),
            Some("x2".into()),
            Duration::from_millis(10),
        );
        assert_eq!(a2.status, AdmissionStatus::ActiveNew);
    }

    #[tokio::test(start_paused = true)]
    async fn merged_msg_ids_are_not_mapped() {
        let store = GatewayStore::new();
        let _flushed = recording_handler(&store);
        let debounce = Duration::from_millis(100);

        let a1 = store.add_pending_message("ck", origin(), "m1".into(), Some("x1".into()), debounce);
        let _a2 = store.add_pending_message("ck", origin(), "m2".into(), Some("x2".into()), debounce);
        let a3 = store.add_pending_message("ck", origin(), "m3".into(), Some("x3".into()), debounce);
        assert_eq!(a3.status, AdmissionStatus::QueuedMerged);

        assert_eq!(store.stream_for_msg("x1").as_deref(), Some(a1.stream_id.as_str()));
        assert!(store.stream_for_msg("x3").is_none(), "merged id must stay unmapped");
    }

    #[tokio::test(start_paused = true)]
    async fn queue_depth_is_bounded_to_one() {
        let store = GatewayStore::new();
        let _flushed = recording_handler(&store);
        let debounce = Duration::from_millis(100);

        store.add_pending_message("ck", origin(), "m1".into(), None, debounce);
        let a2 = store.add_pending_message("ck", origin(), "m2".into(), None, debounce);
        let a3 = store.add_pending_message("ck", origin(), "m3".into(), None, debounce);
        let a4 = store.add_pending_message("ck", origin(), "m4".into(), None, debounce);
        assert_eq!(a2.status, AdmissionStatus::QueuedNew);
        assert_eq!(a3.status, AdmissionStatus::QueuedMerged);
        assert_eq!(a4.status, AdmissionStatus::QueuedMerged);
        assert_eq!(a3.stream_id, a2.stream_id);
        assert_eq!(a4.stream_id, a2.stream_id);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_is_monotonic_and_content_freezes() {
        let store = GatewayStore::new();
        let _flushed = recording_handler(&store);
        let a = store.add_pending_message("ck", origin(), "m".into(), None, Duration::from_secs(1));

        store.append_stream_text(&a.stream_id, "hello");
        store.finish_stream(&a.stream_id);
        store.append_stream_text(&a.stream_id, " world");
        store.set_stream_content(&a.stream_id, "replaced");
        let snap = store.stream_snapshot(&a.stream_id).unwrap();
        assert!(snap.finished);
        assert_eq!(snap.content, "hello");

        // The explicit fallback write is the one exception.
        store.finish_stream_with(&a.stream_id, "剩余内容将通过私信发送", FallbackMode::Timeout);
        let snap = store.stream_snapshot(&a.stream_id).unwrap();
        assert_eq!(snap.content, "剩余内容将通过私信发送");
        assert_eq!(snap.fallback, FallbackMode::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn dm_content_is_head_capped_independently() {
        let store = GatewayStore::new();
        let _flushed = recording_handler(&store);
        let a = store.add_pending_message("ck", origin(), "m".into(), None, Duration::from_secs(1));

        let big = "字".repeat(8_000); // 24 KB utf-8
        store.append_stream_text(&a.stream_id, &big);
        store.append_dm_text(&a.stream_id, &big);
        let snap = store.stream_snapshot(&a.stream_id).unwrap();
        assert!(snap.content.len() <= STREAM_MAX_BYTES);
        assert!(std::str::from_utf8(snap.content.as_bytes()).is_ok());
        assert_eq!(snap.dm_content, big, "dm side is not limited by the stream cap");
    }

    #[tokio::test(start_paused = true)]
    async fn media_keys_dedupe_per_stream() {
        let store = GatewayStore::new();
        let _flushed = recording_handler(&store);
        let a = store.add_pending_message("ck", origin(), "m".into(), None, Duration::from_secs(1));
        assert!(store.note_media_key(&a.stream_id, "/tmp/a.pdf"));
        assert!(!store.note_media_key(&a.stream_id, "/tmp/a.pdf"));
        assert!(store.note_media_key(&a.stream_id, "/tmp/b.pdf"));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_url_multi_policy_records_use_and_errors() {
        let store = GatewayStore::new();
        store.store_reply_url("s1", "https://example.com/hook", None);

        let out: anyhow::Result<u32> = store
            .use_reply_url("s1", |url, _proxy| async move {
                assert_eq!(url, "https://example.com/hook");
                Ok(7)
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert!(store.reply_url("s1").unwrap().used_at.is_some());

        let out: anyhow::Result<()> = store
            .use_reply_url("s1", |_url, _proxy| async move {
                anyhow::bail!("push rejected")
            })
            .await;
        assert!(out.is_err());
        assert_eq!(
            store.reply_url("s1").unwrap().last_error.as_deref(),
            Some("push rejected")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reply_url_once_policy_consumes_the_entry() {
        let store = GatewayStore::with_policy(ReplyUrlPolicy::Once);
        store.store_reply_url("s1", "https://example.com/hook", None);
        let _: anyhow::Result<()> = store.use_reply_url("s1", |_u, _p| async { Ok(()) }).await;
        assert!(store.reply_url("s1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_expires_streams_and_mappings() {
        let store = GatewayStore::new();
        let _flushed = recording_handler(&store);
        let a = store.add_pending_message(
            "ck",
            origin(),
            "m".into(),
            Some("x1".into()),
            Duration::from_millis(10),
        );
        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;

        // Age the stream beyond its TTL by rewriting its timestamps.
        let Some(past) = Instant::now().checked_sub(STREAM_TTL + Duration::from_secs(5)) else {
            return; // clock too close to boot to backdate
        };
        {
            let mut streams = store.streams.lock();
            let state = streams.get_mut(&a.stream_id).unwrap();
            state.updated_at = past;
        }
        store.prune();
        assert!(store.stream_snapshot(&a.stream_id).is_none());
        assert!(store.stream_for_msg("x1").is_none());
        assert!(store.queue.lock().conversations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ack_streams_register_and_drain() {
        let store = GatewayStore::new();
        let _flushed = recording_handler(&store);
        let a = store.add_pending_message("ck", origin(), "m1".into(), None, Duration::from_secs(1));
        let ack = store.add_ack_stream_for_batch("ck", &origin(), "ck", "已收到，已合并排队处理中...");
        let snap = store.stream_snapshot(&ack).unwrap();
        assert!(snap.started && !snap.finished);
        assert_eq!(snap.content, "已收到，已合并排队处理中...");

        let drained = store.take_ack_streams("ck");
        assert_eq!(drained, vec![ack]);
        assert!(store.take_ack_streams("ck").is_empty());
        let _ = a;
    }

    #[test]
    fn utf8_slicing_respects_boundaries() {
        let text = "汉字abc汉字";
        for cap in 0..text.len() {
            assert!(std::str::from_utf8(tail_utf8(text, cap).as_bytes()).is_ok());
            assert!(head_utf8(text, cap).len() <= cap);
        }
        assert_eq!(tail_utf8("hello", 10), "hello");
        assert_eq!(tail_utf8("hello", 3), "llo");
        assert_eq!(head_utf8("hello", 3), "hel");
    }

    #[test]
    fn stream_ids_are_128_bit_hex() {
        let id = new_stream_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_stream_id());
    }
}
