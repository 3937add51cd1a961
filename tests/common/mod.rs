#![allow(dead_code)]

use async_trait::async_trait;
use popmitra_server::db::MemoryStore;
use popmitra_server::generation::ContentGenerator;
use popmitra_server::notify::{EmailMessage, EmailSender, SmsMessage, SmsSender};
use popmitra_server::{AppError, AppState, Channels, Settings};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const VALID_CONTENT: &str = r##"{
    "titles": ["One", "Two", "Three", "Four", "Five"],
    "description": "Watch till the end 🔥",
    "hashtags": ["#viral", "#reels"]
}"##;

/// Captures every delivered code instead of sending it.
#[derive(Default)]
pub struct Outbox {
    emails: Mutex<Vec<EmailMessage>>,
    texts: Mutex<Vec<SmsMessage>>,
}

impl Outbox {
    pub fn emails(&self) -> Vec<EmailMessage> {
        self.emails.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<SmsMessage> {
        self.texts.lock().unwrap().clone()
    }

    pub fn last_code_for(&self, recipient: &str) -> Option<String> {
        let from_email = self
            .emails()
            .into_iter()
            .rev()
            .find(|m| m.to == recipient)
            .map(|m| m.body_html);
        let from_sms = self
            .texts()
            .into_iter()
            .rev()
            .find(|m| m.to == recipient)
            .map(|m| m.body);
        from_email.or(from_sms).and_then(|body| six_digit_code(&body))
    }
}

#[async_trait]
impl EmailSender for Outbox {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), AppError> {
        self.emails.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl SmsSender for Outbox {
    async fn send_sms(&self, message: &SmsMessage) -> Result<(), AppError> {
        self.texts.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Replies with a fixed payload and counts calls.
pub struct StubGenerator {
    reply: String,
    calls: AtomicUsize,
}

impl StubGenerator {
    pub fn new(reply: &str) -> Self {
        Self { reply: reply.to_string(), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentGenerator for StubGenerator {
    async fn complete(&self, _prompt: &str) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

pub struct Harness {
    pub state: AppState,
    pub store: MemoryStore,
    pub outbox: Arc<Outbox>,
    pub generator: Arc<StubGenerator>,
}

pub fn harness(reply: &str) -> Harness {
    let config = Settings::new_for_test().expect("test settings");
    let store = MemoryStore::new();
    let outbox = Arc::new(Outbox::default());
    let generator = Arc::new(StubGenerator::new(reply));
    let channels = Channels {
        email: outbox.clone(),
        sms: outbox.clone(),
        generator: generator.clone(),
    };
    let state = AppState::with_store(config, store.clone(), channels);
    Harness { state, store, outbox, generator }
}

pub fn six_digit_code(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    (0..bytes.len().saturating_sub(5)).find_map(|i| {
        let window = &bytes[i..i + 6];
        let bounded_before = i == 0 || !bytes[i - 1].is_ascii_digit();
        let bounded_after = bytes.get(i + 6).map_or(true, |b| !b.is_ascii_digit());
        (window.iter().all(u8::is_ascii_digit) && bounded_before && bounded_after)
            .then(|| text[i..i + 6].to_string())
    })
}
