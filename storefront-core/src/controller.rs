//! Session controller: runs one exchange at a time against the transport.
//!
//! `submit` starts the exchange and returns right away. The response is
//! decoded, interpreted and reconciled on a spawned task, and the host hears
//! about progress through [`ControllerEvent`]s.

use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use config::ClientSettings;
use config::settings::{DEFAULT_HISTORY_LIMIT, DEFAULT_PROVIDER};

use crate::collaborators::{CartSink, DiagnosticSink, Notice, Notifier};
use crate::conversation::{Conversation, Effect, welcome_message};
use crate::decoder::FrameDecoder;
use crate::frame::{FrameAction, SkipReason, interpret};
use crate::message::{Message, MessageId};
use crate::persistence::HistoryStore;
use crate::traffic_log;
use crate::transport::{ChatRequest, ChatTransport};

const EMPTY_STREAM: &str = "The assistant closed the connection without replying";

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub provider: String,
    pub api_key: Option<String>,
    pub history_limit: usize,
    /// Append request/response summaries to the traffic log
    pub traffic_log: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            provider: DEFAULT_PROVIDER.to_string(),
            api_key: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            traffic_log: false,
        }
    }
}

impl From<&ClientSettings> for ControllerConfig {
    fn from(settings: &ClientSettings) -> Self {
        ControllerConfig {
            provider: settings.provider.clone(),
            api_key: settings.api_key.clone(),
            history_limit: settings.history_limit,
            traffic_log: true,
        }
    }
}

/// Host-side seams the controller signals into.
#[derive(Clone)]
pub struct Collaborators {
    pub cart: Arc<dyn CartSink>,
    pub notifier: Arc<dyn Notifier>,
    pub diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// The message log changed; re-read `messages()`
    LogChanged,
    Notice(Notice),
    /// The open exchange ended
    Settled,
    Cleared,
}

/// Identifies one exchange. Generations never repeat within a controller,
/// even when a cleared log hands out the same placeholder id again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Ticket {
    generation: u64,
    placeholder: MessageId,
}

struct Exchange {
    ticket: Ticket,
    token: CancellationToken,
}

struct State {
    conversation: Conversation,
    exchange: Option<Exchange>,
    generation: u64,
    // bumped for every snapshot handed to the store, and by clear
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

struct Inner {
    state: Mutex<State>,
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn HistoryStore>,
    /// Serializes store access; holds the newest revision written or cleared
    store_gate: AsyncMutex<u64>,
    collaborators: Collaborators,
    config: ControllerConfig,
    event_tx: mpsc::UnboundedSender<ControllerEvent>,
}

pub struct ChatController {
    inner: Arc<Inner>,
    event_rx: mpsc::UnboundedReceiver<ControllerEvent>,
}

impl ChatController {
    pub fn new(
        messages: Vec<Message>,
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn HistoryStore>,
        collaborators: Collaborators,
        config: ControllerConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            state: Mutex::new(State {
                conversation: Conversation::new(messages),
                exchange: None,
                generation: 0,
                revision: 0,
            }),
            transport,
            store,
            store_gate: AsyncMutex::new(0),
            collaborators,
            config,
            event_tx,
        };
        Self {
            inner: Arc::new(inner),
            event_rx,
        }
    }

    /// Build a controller around whatever `store` last saved.
    pub async fn restore(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn HistoryStore>,
        collaborators: Collaborators,
        config: ControllerConfig,
    ) -> Self {
        let messages = store.load().await;
        Self::new(messages, transport, store, collaborators, config)
    }

    /// Start an exchange for `text`. Returns false, changing nothing, when an
    /// exchange is already open or the text is blank.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, text: &str) -> bool {
        let (request, ticket, token) = {
            let mut state = self.inner.lock();
            if state.exchange.is_some() {
                debug!("exchange already open, ignoring submit");
                return false;
            }
            let history = state.conversation.history(self.inner.config.history_limit);
            let Some(placeholder) = state.conversation.begin(text) else {
                return false;
            };
            state.generation += 1;
            let ticket = Ticket {
                generation: state.generation,
                placeholder,
            };
            let token = CancellationToken::new();
            state.exchange = Some(Exchange {
                ticket,
                token: token.clone(),
            });
            let request = ChatRequest {
                message: text.trim().to_string(),
                history,
                provider: self.inner.config.provider.clone(),
                api_key: self.inner.config.api_key.clone(),
            };
            (request, ticket, token)
        };

        info!(
            placeholder = %ticket.placeholder,
            generation = ticket.generation,
            history = request.history.len(),
            "exchange started"
        );
        self.inner.emit(ControllerEvent::LogChanged);
        tokio::spawn(run_exchange(Arc::clone(&self.inner), request, ticket, token));
        true
    }

    /// Stop the open exchange. Returns false when nothing was streaming.
    pub async fn cancel(&self) -> bool {
        let (snapshot, revision) = {
            let mut state = self.inner.lock();
            let Some(exchange) = state.exchange.take() else {
                return false;
            };
            exchange.token.cancel();
            state.conversation.cancel();
            (state.conversation.messages().to_vec(), state.next_revision())
        };
        info!("exchange cancelled");
        self.inner.emit(ControllerEvent::LogChanged);
        self.inner.notify(Notice::info("Response cancelled"));
        self.inner.persist(&snapshot, revision).await;
        self.inner.emit(ControllerEvent::Settled);
        true
    }

    /// Drop the whole conversation, persisted copy included. Snapshots
    /// taken before the clear are never written afterwards.
    pub async fn clear(&self) -> anyhow::Result<()> {
        let (interrupted, revision) = {
            let mut state = self.inner.lock();
            let interrupted = match state.exchange.take() {
                Some(exchange) => {
                    exchange.token.cancel();
                    true
                }
                None => false,
            };
            state.conversation.reset(vec![welcome_message()]);
            (interrupted, state.next_revision())
        };
        {
            let mut written = self.inner.store_gate.lock().await;
            *written = revision;
            self.inner.store.clear().await?;
        }
        info!("conversation cleared");
        self.inner.emit(ControllerEvent::Cleared);
        self.inner.emit(ControllerEvent::LogChanged);
        self.inner.notify(Notice::success("Chat history cleared"));
        if interrupted {
            self.inner.emit(ControllerEvent::Settled);
        }
        Ok(())
    }

    pub async fn stats(&self) -> anyhow::Result<serde_json::Value> {
        self.inner.transport.stats().await
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().conversation.messages().to_vec()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().exchange.is_some()
    }

    pub fn try_recv(&mut self) -> Option<ControllerEvent> {
        self.event_rx.try_recv().ok()
    }

    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        self.event_rx.recv().await
    }
}

impl Drop for ChatController {
    fn drop(&mut self) {
        if let Some(exchange) = self.inner.lock().exchange.take() {
            exchange.token.cancel();
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn notify(&self, notice: Notice) {
        self.collaborators.notifier.notify(&notice);
        self.emit(ControllerEvent::Notice(notice));
    }

    fn report_skip(&self, reason: &SkipReason) {
        debug!(%reason, "frame skipped");
        if let Some(diagnostics) = &self.collaborators.diagnostics {
            diagnostics.frame_skipped(reason);
        }
    }

    /// Save `messages` unless a newer snapshot or a clear already reached
    /// the store.
    async fn persist(&self, messages: &[Message], revision: u64) {
        let mut written = self.store_gate.lock().await;
        if revision <= *written {
            debug!(revision, latest = *written, "skipping outdated snapshot");
            return;
        }
        if let Err(e) = self.store.save(messages).await {
            warn!(error = %e, "failed to save conversation");
        }
        *written = revision;
    }

    /// Apply `action` to the exchange identified by `ticket`. Returns whether
    /// that exchange is still open afterwards.
    async fn dispatch(&self, ticket: Ticket, action: FrameAction) -> bool {
        if let FrameAction::Skip(reason) = &action {
            self.report_skip(reason);
            return true;
        }

        let (effects, settled) = {
            let mut state = self.lock();
            let open = state
                .exchange
                .as_ref()
                .is_some_and(|e| e.ticket == ticket && !e.token.is_cancelled());
            if !open {
                debug!(generation = ticket.generation, "exchange no longer open, dropping action");
                return false;
            }
            let effects = state.conversation.apply(action);
            let settled = effects.contains(&Effect::Settled).then(|| {
                state.exchange = None;
                (state.conversation.messages().to_vec(), state.next_revision())
            });
            (effects, settled)
        };

        self.emit(ControllerEvent::LogChanged);
        for effect in effects {
            match effect {
                Effect::AddToCart(item) => self.collaborators.cart.add(&item),
                Effect::Notify(notice) => self.notify(notice),
                Effect::Settled => {}
            }
        }

        let Some((messages, revision)) = settled else {
            return true;
        };
        if self.config.traffic_log {
            let reply = messages
                .iter()
                .find(|m| m.id == ticket.placeholder)
                .map(Message::text)
                .unwrap_or_default();
            traffic_log::log_stream_end(&self.config.provider, reply);
        }
        self.persist(&messages, revision).await;
        info!(placeholder = %ticket.placeholder, "exchange settled");
        self.emit(ControllerEvent::Settled);
        false
    }
}

async fn run_exchange(
    inner: Arc<Inner>,
    request: ChatRequest,
    ticket: Ticket,
    token: CancellationToken,
) {
    if inner.config.traffic_log {
        traffic_log::log_stream_start(&request);
    }

    let opened = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        opened = inner.transport.open_stream(&request) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            fail(&inner, ticket, e).await;
            return;
        }
    };

    let mut decoder = FrameDecoder::new();
    let mut received = false;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                for line in decoder.feed(&chunk) {
                    if token.is_cancelled() {
                        return;
                    }
                    let action = interpret(&line);
                    received |= !matches!(action, FrameAction::Skip(_));
                    if !inner.dispatch(ticket, action).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                fail(&inner, ticket, e).await;
                return;
            }
            None => break,
        }
    }

    if let Some(tail) = decoder.finish() {
        inner.report_skip(&SkipReason::Truncated { tail });
    }
    let action = if received {
        FrameAction::Complete
    } else {
        FrameAction::Fail(EMPTY_STREAM.to_string())
    };
    inner.dispatch(ticket, action).await;
}

async fn fail(inner: &Inner, ticket: Ticket, error: anyhow::Error) {
    warn!(error = %error, "assistant stream failed");
    if inner.config.traffic_log {
        traffic_log::log_error(&inner.config.provider, &error.to_string());
    }
    inner.dispatch(ticket, FrameAction::Fail(error.to_string())).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NoticeKind;
    use crate::conversation::{ERROR_REPLY, WELCOME_MESSAGE};
    use crate::message::{CartItem, Role};
    use crate::persistence::MemoryHistoryStore;
    use crate::transport::ByteStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::time::Duration;

    /// Replays fixed chunks and records every request.
    struct ScriptedTransport {
        chunks: Vec<&'static str>,
        fail_after: bool,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedTransport {
        fn new(chunks: Vec<&'static str>) -> Self {
            ScriptedTransport {
                chunks,
                fail_after: false,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open_stream(&self, request: &ChatRequest) -> anyhow::Result<ByteStream> {
            self.requests.lock().unwrap().push(request.clone());
            let mut items: Vec<anyhow::Result<Bytes>> = self
                .chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect();
            if self.fail_after {
                items.push(Err(anyhow::anyhow!("connection reset")));
            }
            Ok(Box::pin(stream::iter(items)))
        }
    }

    /// Opens a stream that never yields.
    struct PendingTransport;

    #[async_trait]
    impl ChatTransport for PendingTransport {
        async fn open_stream(&self, _request: &ChatRequest) -> anyhow::Result<ByteStream> {
            Ok(Box::pin(stream::pending()))
        }
    }

    struct RefusingTransport;

    #[async_trait]
    impl ChatTransport for RefusingTransport {
        async fn open_stream(&self, _request: &ChatRequest) -> anyhow::Result<ByteStream> {
            Err(anyhow::anyhow!("Request failed with status 503"))
        }
    }

    #[derive(Default)]
    struct Recorder {
        cart: Mutex<Vec<CartItem>>,
        notices: Mutex<Vec<Notice>>,
        skipped: Mutex<Vec<SkipReason>>,
    }

    impl CartSink for Recorder {
        fn add(&self, item: &CartItem) {
            self.cart.lock().unwrap().push(item.clone());
        }
    }

    impl Notifier for Recorder {
        fn notify(&self, notice: &Notice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }

    impl DiagnosticSink for Recorder {
        fn frame_skipped(&self, reason: &SkipReason) {
            self.skipped.lock().unwrap().push(reason.clone());
        }
    }

    struct Harness {
        controller: ChatController,
        recorder: Arc<Recorder>,
        store: Arc<MemoryHistoryStore>,
    }

    fn harness(transport: Arc<dyn ChatTransport>) -> Harness {
        let recorder = Arc::new(Recorder::default());
        let store = Arc::new(MemoryHistoryStore::default());
        let collaborators = Collaborators {
            cart: recorder.clone(),
            notifier: recorder.clone(),
            diagnostics: Some(recorder.clone()),
        };
        let controller = ChatController::new(
            vec![welcome_message()],
            transport,
            store.clone(),
            collaborators,
            ControllerConfig::default(),
        );
        Harness {
            controller,
            recorder,
            store,
        }
    }

    async fn wait_settled(controller: &mut ChatController) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match controller.next_event().await {
                    Some(ControllerEvent::Settled) => return,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("exchange did not settle");
    }

    #[tokio::test]
    async fn test_streamed_reply_settles_and_persists() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            "data: {\"type\": \"intent_detected\", \"intent\": \"list_products\"}\n\ndata: {\"content\": \"Here",
            "\"}\n\ndata: {\"type\": \"product_list\", \"products\": [{\"name\": \"Tiramisu\", \"price\": \"950.00\"}]}\n",
            "\ndata: {\"content\": \" you go\"}\n\ndata: [DONE]\n\n",
        ]));
        let mut h = harness(transport.clone());

        assert!(h.controller.submit("  Show me cakes "));
        wait_settled(&mut h.controller).await;

        let messages = h.controller.messages();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::Assistant, Role::User, Role::ProductList, Role::Assistant]
        );
        assert_eq!(messages[2].products[0].name, "Tiramisu");
        assert_eq!(messages[3].text(), "Here you go");
        assert!(messages.iter().all(|m| !m.is_streaming));
        assert!(!h.controller.is_active());

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].message, "Show me cakes");
        assert_eq!(requests[0].history.len(), 1);
        assert_eq!(requests[0].history[0].content, WELCOME_MESSAGE);

        assert_eq!(h.store.load().await, messages);
        assert!(matches!(
            h.recorder.skipped.lock().unwrap().as_slice(),
            [SkipReason::Informational { .. }]
        ));
    }

    #[tokio::test]
    async fn test_submit_while_active_is_rejected() {
        let mut h = harness(Arc::new(PendingTransport));

        assert!(h.controller.submit("first"));
        let before = h.controller.messages();
        assert!(!h.controller.submit("second"));
        assert_eq!(h.controller.messages(), before);
        assert!(h.controller.is_active());

        assert!(h.controller.cancel().await);
        wait_settled(&mut h.controller).await;
        assert!(!h.controller.is_active());
        assert!(!h.controller.cancel().await);
        assert!(!h.controller.submit("   "));
    }

    #[tokio::test]
    async fn test_cancel_removes_empty_placeholder_and_notifies() {
        let mut h = harness(Arc::new(PendingTransport));
        assert!(h.controller.submit("anything vegan?"));
        tokio::task::yield_now().await;
        assert!(h.controller.cancel().await);
        wait_settled(&mut h.controller).await;

        let messages = h.controller.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text(), "anything vegan?");
        let notices = h.recorder.notices.lock().unwrap();
        assert_eq!(notices.last().unwrap().message, "Response cancelled");

        assert_eq!(h.store.load().await, messages);
    }

    #[tokio::test]
    async fn test_auth_required_prompts_sign_in() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            "data: {\"type\":\"auth_required\",\"message\":\"Please sign in\"}\n\n",
        ]));
        let mut h = harness(transport);
        assert!(h.controller.submit("add a brownie"));
        wait_settled(&mut h.controller).await;

        let messages = h.controller.messages();
        let last = messages.last().unwrap();
        assert_eq!(last.text(), "Please sign in");
        assert!(!last.is_streaming);

        let notices = h.recorder.notices.lock().unwrap();
        assert_eq!(notices[0].kind, NoticeKind::Error);
        assert_eq!(notices[0].action.as_ref().unwrap().path, "/signin");
    }

    #[tokio::test]
    async fn test_cart_update_reaches_cart_in_order() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            "data: {\"type\":\"cart_update\",\"added_products\":[{\"name\":\"Brownie\",\"price\":\"450.00\"},{\"name\":\"Macaron\",\"price\":300,\"quantity\":3}]}\n\n",
            "data: {\"content\":\"Added!\"}\n\ndata: [DONE]\n\n",
        ]));
        let mut h = harness(transport);
        assert!(h.controller.submit("add brownie and macarons"));
        wait_settled(&mut h.controller).await;

        let cart = h.recorder.cart.lock().unwrap();
        let names: Vec<&str> = cart.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Brownie", "Macaron"]);
        assert_eq!(cart[1].quantity, 3);
        assert_eq!(
            h.recorder.notices.lock().unwrap()[0].message,
            "Added Brownie, Macaron to cart!"
        );
        assert_eq!(h.controller.messages().last().unwrap().text(), "Added!");
    }

    #[tokio::test]
    async fn test_refused_request_becomes_error_reply() {
        let mut h = harness(Arc::new(RefusingTransport));
        assert!(h.controller.submit("hello"));
        wait_settled(&mut h.controller).await;

        assert_eq!(h.controller.messages().last().unwrap().text(), ERROR_REPLY);
        let notices = h.recorder.notices.lock().unwrap();
        assert_eq!(notices[0].kind, NoticeKind::Error);
        assert!(notices[0].message.contains("503"));
        assert!(h.controller.submit("again"));
    }

    #[tokio::test]
    async fn test_read_error_mid_stream_fails_exchange() {
        let mut transport = ScriptedTransport::new(vec!["data: {\"content\":\"Half\"}\n\n"]);
        transport.fail_after = true;
        let mut h = harness(Arc::new(transport));
        assert!(h.controller.submit("hello"));
        wait_settled(&mut h.controller).await;

        assert_eq!(h.controller.messages().last().unwrap().text(), ERROR_REPLY);
        assert_eq!(
            h.recorder.notices.lock().unwrap()[0].message,
            "connection reset"
        );
    }

    #[tokio::test]
    async fn test_stream_without_terminator_completes() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            "data: {\"content\":\"Hi\"}\n\ndata: {\"content\"",
        ]));
        let mut h = harness(transport);
        assert!(h.controller.submit("hello"));
        wait_settled(&mut h.controller).await;

        assert_eq!(h.controller.messages().last().unwrap().text(), "Hi");
        assert!(matches!(
            h.recorder.skipped.lock().unwrap().as_slice(),
            [SkipReason::Truncated { .. }]
        ));
    }

    #[tokio::test]
    async fn test_empty_stream_fails() {
        let mut h = harness(Arc::new(ScriptedTransport::new(Vec::new())));
        assert!(h.controller.submit("hello"));
        wait_settled(&mut h.controller).await;

        assert_eq!(h.controller.messages().last().unwrap().text(), ERROR_REPLY);
    }

    #[tokio::test]
    async fn test_clear_resets_to_welcome() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            "data: {\"content\":\"Hi\"}\n\ndata: [DONE]\n\n",
        ]));
        let mut h = harness(transport);
        assert!(h.controller.submit("hello"));
        wait_settled(&mut h.controller).await;
        assert!(h.store.raw().is_some());

        h.controller.clear().await.unwrap();
        let messages = h.controller.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), WELCOME_MESSAGE);
        assert!(h.store.raw().is_none());

        let mut saw_cleared = false;
        while let Some(event) = h.controller.try_recv() {
            saw_cleared |= event == ControllerEvent::Cleared;
        }
        assert!(saw_cleared);
    }

    type ChunkSender = mpsc::UnboundedSender<anyhow::Result<Bytes>>;

    /// Each opened stream is fed by the test through a channel, one channel
    /// per request in order.
    struct ChannelTransport {
        pending: Mutex<Vec<mpsc::UnboundedReceiver<anyhow::Result<Bytes>>>>,
        opened: Mutex<usize>,
    }

    impl ChannelTransport {
        fn with_streams(count: usize) -> (Self, Vec<ChunkSender>) {
            let (senders, receivers): (Vec<_>, Vec<_>) =
                (0..count).map(|_| mpsc::unbounded_channel()).unzip();
            let transport = ChannelTransport {
                pending: Mutex::new(receivers.into_iter().rev().collect()),
                opened: Mutex::new(0),
            };
            (transport, senders)
        }

        fn opened(&self) -> usize {
            *self.opened.lock().unwrap()
        }
    }

    #[async_trait]
    impl ChatTransport for ChannelTransport {
        async fn open_stream(&self, _request: &ChatRequest) -> anyhow::Result<ByteStream> {
            let rx = self.pending.lock().unwrap().pop().expect("unexpected request");
            *self.opened.lock().unwrap() += 1;
            Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            })))
        }
    }

    /// Memory store whose saves take a while to land.
    struct SlowStore {
        inner: MemoryHistoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl HistoryStore for SlowStore {
        async fn save(&self, messages: &[Message]) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.save(messages).await
        }

        async fn load(&self) -> Vec<Message> {
            self.inner.load().await
        }

        async fn clear(&self) -> anyhow::Result<()> {
            self.inner.clear().await
        }
    }

    fn controller_with(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn HistoryStore>,
    ) -> ChatController {
        let recorder = Arc::new(Recorder::default());
        ChatController::new(
            vec![welcome_message()],
            transport,
            store,
            Collaborators {
                cart: recorder.clone(),
                notifier: recorder,
                diagnostics: None,
            },
            ControllerConfig::default(),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn chunk(text: &'static str) -> anyhow::Result<Bytes> {
        Ok(Bytes::from_static(text.as_bytes()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_from_cleared_exchange_never_reach_next_one() {
        for _ in 0..20 {
            let (transport, senders) = ChannelTransport::with_streams(2);
            let transport = Arc::new(transport);
            let store = Arc::new(MemoryHistoryStore::default());
            let controller = controller_with(transport.clone(), store);

            assert!(controller.submit("first"));
            wait_until(|| transport.opened() == 1).await;
            let first_placeholder = controller.messages()[2].id;

            senders[0].send(chunk("data: {\"content\":\"STALE\"}\n\n")).unwrap();
            controller.clear().await.unwrap();
            assert!(controller.submit("second"));
            let _ = senders[0].send(chunk("data: {\"content\":\" STALE\"}\n\ndata: [DONE]\n\n"));

            wait_until(|| transport.opened() == 2).await;
            senders[1]
                .send(chunk("data: {\"content\":\"fresh\"}\n\ndata: [DONE]\n\n"))
                .unwrap();
            wait_until(|| !controller.is_active()).await;

            let messages = controller.messages();
            assert_eq!(messages.len(), 3);
            assert_eq!(messages[1].text(), "second");
            assert_eq!(messages[2].text(), "fresh");
            assert!(messages[2].id > first_placeholder);
            assert!(messages.iter().all(|m| !m.text().contains("STALE")));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clear_wins_over_pending_save() {
        let store = Arc::new(SlowStore {
            inner: MemoryHistoryStore::default(),
            delay: Duration::from_millis(50),
        });
        let transport = Arc::new(ScriptedTransport::new(vec![
            "data: {\"content\":\"answer\"}\n\ndata: [DONE]\n\n",
        ]));
        let controller = controller_with(transport, store.clone());

        assert!(controller.submit("secret question"));
        wait_until(|| !controller.is_active()).await;
        controller.clear().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let stored = store.load().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].text(), WELCOME_MESSAGE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_save_does_not_overwrite_later_exchange() {
        let store = Arc::new(SlowStore {
            inner: MemoryHistoryStore::default(),
            delay: Duration::from_millis(50),
        });
        let (transport, senders) = ChannelTransport::with_streams(2);
        let transport = Arc::new(transport);
        let controller = controller_with(transport.clone(), store.clone());

        assert!(controller.submit("first"));
        wait_until(|| transport.opened() == 1).await;
        assert!(controller.cancel().await);
        assert!(controller.submit("second"));
        wait_until(|| transport.opened() == 2).await;
        senders[1]
            .send(chunk("data: {\"content\":\"done\"}\n\ndata: [DONE]\n\n"))
            .unwrap();
        wait_until(|| !controller.is_active()).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(controller.messages().last().unwrap().text(), "done");
        assert_eq!(store.load().await, controller.messages());
    }

    #[tokio::test]
    async fn test_clear_during_exchange_settles() {
        let mut h = harness(Arc::new(PendingTransport));
        assert!(h.controller.submit("hello"));
        tokio::task::yield_now().await;

        h.controller.clear().await.unwrap();
        assert!(!h.controller.is_active());
        let mut events = Vec::new();
        while let Some(event) = h.controller.try_recv() {
            events.push(event);
        }
        let cleared = events.iter().position(|e| *e == ControllerEvent::Cleared).unwrap();
        let settled = events.iter().position(|e| *e == ControllerEvent::Settled).unwrap();
        assert!(cleared < settled);
    }

    #[tokio::test]
    async fn test_restore_continues_saved_conversation() {
        let store = Arc::new(MemoryHistoryStore::default());
        store
            .save(&[
                welcome_message(),
                Message::user(MessageId(7), "earlier question"),
                Message::assistant(MessageId(8), "earlier answer"),
            ])
            .await
            .unwrap();

        let transport = Arc::new(ScriptedTransport::new(vec![
            "data: {\"content\":\"Sure\"}\n\ndata: [DONE]\n\n",
        ]));
        let recorder = Arc::new(Recorder::default());
        let mut controller = ChatController::restore(
            transport.clone(),
            store.clone(),
            Collaborators {
                cart: recorder.clone(),
                notifier: recorder.clone(),
                diagnostics: None,
            },
            ControllerConfig::default(),
        )
        .await;
        assert_eq!(controller.messages().len(), 3);

        assert!(controller.submit("follow up"));
        wait_settled(&mut controller).await;

        let messages = controller.messages();
        assert_eq!(messages[3].id, MessageId(9));
        assert_eq!(messages[4].text(), "Sure");
        let history = &transport.requests.lock().unwrap()[0].history;
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].content, "earlier answer");
    }
}
