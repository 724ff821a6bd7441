//! Shared fixtures for the integration tests.
//!
//! Note: `helpers/mod.rs` keeps Cargo from compiling the helpers as a
//! standalone test target.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nestcache::error::BoxError;
use nestcache::language::RegexEmbeddingProvider;
use nestcache::{
    LanguageRegistry, ParseContext, Parser, ParserManager, ParserOutput, Snapshot,
    SourceModificationEvent, Task, TaskSerializer,
};
use url::Url;

pub const HTML: &str = "<html><script>var x=1;</script></html>";

/// How a [`CountingParser`] behaves while parsing.
#[derive(Debug, Clone, Copy, Default)]
pub enum Behavior {
    #[default]
    Immediate,
    /// Sleep before finishing, without checkpoints
    Slow(Duration),
    /// Spin on checkpoints until cancelled, giving up after the timeout
    UntilCancelled(Duration),
    /// Report a syntax error
    Fail,
    Panic,
}

/// Parse statistics shared by every parser a factory creates.
#[derive(Debug, Default)]
pub struct ParseLog {
    pub parses: AtomicUsize,
    pub texts: Mutex<Vec<String>>,
    pub behavior: Mutex<Behavior>,
}

impl ParseLog {
    pub fn parses(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

/// Parser whose result is the text it parsed.
pub struct CountingParser {
    log: Arc<ParseLog>,
    text: Option<String>,
}

impl Parser for CountingParser {
    fn parse(
        &mut self,
        snapshot: &Arc<Snapshot>,
        _task: &Task,
        _event: &SourceModificationEvent,
        cx: &ParseContext<'_>,
    ) -> Result<(), BoxError> {
        let behavior = *self.log.behavior.lock().unwrap();
        self.log.parses.fetch_add(1, Ordering::SeqCst);
        match behavior {
            Behavior::Immediate => {}
            Behavior::Slow(delay) => std::thread::sleep(delay),
            Behavior::UntilCancelled(timeout) => {
                let started = Instant::now();
                loop {
                    cx.checkpoint()?;
                    if started.elapsed() > timeout {
                        return Err("parse was never cancelled".into());
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            Behavior::Fail => return Err("syntax error".into()),
            Behavior::Panic => panic!("parser crashed"),
        }
        self.text = Some(snapshot.text().to_string());
        self.log.texts.lock().unwrap().push(snapshot.text().to_string());
        Ok(())
    }

    fn result(&mut self, _task: &Task) -> Result<ParserOutput, BoxError> {
        let text = self.text.clone().ok_or("result requested before parse")?;
        Ok(Box::new(text))
    }
}

pub fn counting_factory(log: &Arc<ParseLog>) -> impl Fn() -> Box<dyn Parser> + Send + Sync + 'static {
    let log = Arc::clone(log);
    move || {
        Box::new(CountingParser {
            log: Arc::clone(&log),
            text: None,
        }) as Box<dyn Parser>
    }
}

/// Registry with counting parsers and `<script>`/`<style>` discovery for html.
pub fn registry(log: &Arc<ParseLog>) -> LanguageRegistry {
    let registry = LanguageRegistry::new();
    registry.set_fallback_parser(counting_factory(log));
    registry.add_embedder(
        "html",
        RegexEmbeddingProvider::new("<script>(?P<content>.*?)</script>", "javascript").unwrap(),
    );
    registry.add_embedder(
        "html",
        RegexEmbeddingProvider::new("<style>(?P<content>.*?)</style>", "css").unwrap(),
    );
    registry
}

/// Manager with its own serializer, so tests never contend on the global one.
pub fn manager() -> (ParserManager, Arc<ParseLog>) {
    let log = Arc::new(ParseLog::default());
    let manager = ParserManager::with_serializer(registry(&log), Arc::new(TaskSerializer::new()));
    (manager, log)
}

pub fn uri(name: &str) -> Url {
    Url::parse(&format!("file:///{name}")).unwrap()
}
