//! Minimal parser that reports byte, line and word counts.
//!
//! Used as the fallback parser of the command line tool and in benches, so
//! every embedded region has a result to show.

use std::sync::Arc;

use serde::Serialize;

use super::plugin::{Parser, ParserOutput};
use crate::error::BoxError;
use crate::serializer::ParseContext;
use crate::source::Snapshot;
use crate::task::Task;
use crate::text::SourceModificationEvent;

/// Lines counted between two cancellation checkpoints.
const CHECKPOINT_INTERVAL: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TextStats {
    pub bytes: usize,
    pub lines: usize,
    pub words: usize,
}

#[derive(Debug, Default)]
pub struct TextStatsParser {
    stats: Option<TextStats>,
}

impl TextStatsParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> impl Fn() -> Box<dyn Parser> + Send + Sync + Clone + 'static {
        || Box::new(TextStatsParser::new()) as Box<dyn Parser>
    }
}

impl Parser for TextStatsParser {
    fn parse(
        &mut self,
        snapshot: &Arc<Snapshot>,
        _task: &Task,
        _event: &SourceModificationEvent,
        cx: &ParseContext<'_>,
    ) -> Result<(), BoxError> {
        let text = snapshot.text();
        let mut stats = TextStats {
            bytes: text.len(),
            ..TextStats::default()
        };
        for (index, line) in text.lines().enumerate() {
            if index % CHECKPOINT_INTERVAL == 0 {
                cx.checkpoint()?;
            }
            stats.lines += 1;
            stats.words += line.split_whitespace().count();
        }
        self.stats = Some(stats);
        Ok(())
    }

    fn result(&mut self, _task: &Task) -> Result<ParserOutput, BoxError> {
        let stats = self.stats.ok_or("text stats requested before parse")?;
        Ok(Box::new(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::TaskSerializer;
    use crate::source::Source;
    use url::Url;

    #[test]
    fn test_counts_lines_and_words() {
        let source = Source::new(Url::parse("file:///a.txt").unwrap(), "text", "one two\nthree\n\nfour");
        let snapshot = source.snapshot();
        let serializer = TaskSerializer::new();
        let task = Task::user();
        let mut parser = TextStatsParser::new();

        let guard = serializer.lock(&task);
        let cx = guard.context(&snapshot);
        parser
            .parse(&snapshot, &task, &SourceModificationEvent::initial(&snapshot), &cx)
            .unwrap();
        let stats = parser.result(&task).unwrap().downcast::<TextStats>().unwrap();

        assert_eq!(
            *stats,
            TextStats {
                bytes: 19,
                lines: 4,
                words: 4
            }
        );
    }

    #[test]
    fn test_result_before_parse_fails() {
        let mut parser = TextStatsParser::new();
        assert!(parser.result(&Task::user()).is_err());
    }
}
