//! Normalization of embedding provider output.
//!
//! Providers run in registration order and their output is repaired before
//! the cache sees it: overlaps are truncated in favour of earlier embeddings,
//! the result is ordered by start offset, and joinable embeddings of the same
//! language are merged.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use super::{Embedding, Section};
use crate::language::LanguageId;
use crate::source::Snapshot;

/// Output of one provider, tagged with its name for logging.
pub(crate) struct ProviderBatch {
    pub provider: String,
    pub embeddings: Vec<Embedding>,
}

/// Repair and merge the output of all providers of one host.
pub(crate) fn normalize(host: &Arc<Snapshot>, batches: Vec<ProviderBatch>) -> Vec<Embedding> {
    let mut accepted: Vec<Embedding> = Vec::new();
    let mut claimed: Vec<Range<usize>> = Vec::new();

    for batch in batches {
        let mut previous_start = 0;
        let mut out_of_order = false;

        for embedding in batch.embeddings {
            if !Arc::ptr_eq(embedding.host(), host) {
                log::warn!(
                    target: "nestcache::embedding",
                    "Provider {} returned an embedding for another snapshot; dropped",
                    batch.provider
                );
                continue;
            }

            let start = start_key(&embedding);
            if start < previous_start {
                out_of_order = true;
            }
            previous_start = start;

            let Some(embedding) = resolve_overlaps(host, embedding, &claimed, &batch.provider) else {
                continue;
            };
            claimed.extend(embedding.sections().iter().filter_map(|section| match section {
                Section::Source(range) if !range.is_empty() => Some(range.clone()),
                _ => None,
            }));
            accepted.push(embedding);
        }

        if out_of_order {
            log::debug!(
                target: "nestcache::embedding",
                "Provider {} returned embeddings out of order; sorting",
                batch.provider
            );
        }
    }

    accepted.sort_by_key(start_key);
    join(host, accepted)
}

fn start_key(embedding: &Embedding) -> usize {
    embedding
        .host_range()
        .map(|range| range.start)
        .unwrap_or(usize::MAX)
}

/// Truncate the sections of `embedding` that overlap already claimed ranges.
fn resolve_overlaps(
    host: &Arc<Snapshot>,
    embedding: Embedding,
    claimed: &[Range<usize>],
    provider: &str,
) -> Option<Embedding> {
    let mut changed = false;
    let mut had_source = false;
    let mut sections = Vec::with_capacity(embedding.sections().len());

    for section in embedding.sections() {
        match section {
            Section::Generated(_) => sections.push(section.clone()),
            Section::Source(range) => {
                had_source = true;
                match truncate(range.clone(), claimed) {
                    Some(kept) if kept == *range => sections.push(section.clone()),
                    Some(kept) => {
                        log::warn!(
                            target: "nestcache::embedding",
                            "Embedding {:?}..{:?} from {} overlaps an earlier embedding; truncated to {:?}",
                            range.start,
                            range.end,
                            provider,
                            kept
                        );
                        changed = true;
                        sections.push(Section::Source(kept));
                    }
                    None => {
                        log::warn!(
                            target: "nestcache::embedding",
                            "Section {:?} from {} is covered by an earlier embedding; dropped",
                            range,
                            provider
                        );
                        changed = true;
                    }
                }
            }
        }
    }

    if !changed {
        return Some(embedding);
    }
    let has_source = sections
        .iter()
        .any(|section| matches!(section, Section::Source(_)));
    if had_source && !has_source {
        log::warn!(
            target: "nestcache::embedding",
            "Embedding for {} from {} is fully covered by earlier embeddings; dropped",
            embedding.language(),
            provider
        );
        return None;
    }

    match Embedding::builder(host, embedding.language())
        .sections(sections)
        .join_sections(embedding.joins_sections())
        .build()
    {
        Ok(rebuilt) => Some(rebuilt),
        Err(err) => {
            log::warn!(
                target: "nestcache::embedding",
                "Failed to rebuild truncated embedding from {}: {}",
                provider,
                err
            );
            None
        }
    }
}

/// Cut `range` at the first claimed range it conflicts with.
fn truncate(mut range: Range<usize>, claimed: &[Range<usize>]) -> Option<Range<usize>> {
    loop {
        let Some(conflict) = claimed.iter().find(|other| overlaps(&range, other)) else {
            return Some(range);
        };
        if range.start < conflict.start {
            range.end = conflict.start;
        } else if conflict.end < range.end {
            range.start = conflict.end;
        } else {
            return None;
        }
    }
}

fn overlaps(range: &Range<usize>, claimed: &Range<usize>) -> bool {
    if range.is_empty() {
        // An empty region conflicts only when strictly inside a claimed one
        claimed.start < range.start && range.start < claimed.end
    } else {
        range.start < claimed.end && claimed.start < range.end
    }
}

enum Slot {
    Single(Embedding),
    Group(usize),
}

/// Merge joinable embeddings of the same language into one embedding placed
/// at the position of the first member.
fn join(host: &Arc<Snapshot>, embeddings: Vec<Embedding>) -> Vec<Embedding> {
    if !embeddings.iter().any(Embedding::joins_sections) {
        return embeddings;
    }

    let mut slots = Vec::with_capacity(embeddings.len());
    let mut groups: Vec<Vec<Embedding>> = Vec::new();
    let mut by_language: HashMap<LanguageId, usize> = HashMap::new();

    for embedding in embeddings {
        if !embedding.joins_sections() {
            slots.push(Slot::Single(embedding));
            continue;
        }
        match by_language.get(embedding.language()) {
            Some(&group) => groups[group].push(embedding),
            None => {
                by_language.insert(embedding.language().clone(), groups.len());
                slots.push(Slot::Group(groups.len()));
                groups.push(vec![embedding]);
            }
        }
    }

    let mut groups: Vec<Option<Vec<Embedding>>> = groups.into_iter().map(Some).collect();
    let mut joined = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Slot::Single(embedding) => joined.push(embedding),
            Slot::Group(index) => {
                let Some(members) = groups[index].take() else {
                    continue;
                };
                joined.extend(join_group(host, members));
            }
        }
    }
    joined
}

fn join_group(host: &Arc<Snapshot>, members: Vec<Embedding>) -> Vec<Embedding> {
    if members.len() == 1 {
        return members;
    }
    let language = members[0].language().clone();
    let sections: Vec<Section> = members
        .iter()
        .flat_map(|member| member.sections().iter().cloned())
        .collect();

    match Embedding::builder(host, &language)
        .sections(sections)
        .join_sections(true)
        .build()
    {
        Ok(joined) => vec![joined],
        Err(err) => {
            log::warn!(
                target: "nestcache::embedding",
                "Failed to join {} sections of {}: {}",
                members.len(),
                language,
                err
            );
            members
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use url::Url;

    fn host(text: &str) -> Arc<Snapshot> {
        Source::new(Url::parse("file:///host.html").unwrap(), "html", text).snapshot()
    }

    fn batch(embeddings: Vec<Embedding>) -> ProviderBatch {
        ProviderBatch {
            provider: "test".to_string(),
            embeddings,
        }
    }

    fn texts(embeddings: &[Embedding]) -> Vec<&str> {
        embeddings.iter().map(|e| e.snapshot().text()).collect()
    }

    #[test]
    fn test_well_formed_output_is_unchanged() {
        let host = host("aaaa bbbb cccc");
        let first = Embedding::region(&host, "x", 0..4).unwrap();
        let second = Embedding::region(&host, "y", 5..9).unwrap();

        let result = normalize(&host, vec![batch(vec![first.clone(), second.clone()])]);
        assert_eq!(result.len(), 2);
        assert!(Embedding::ptr_eq(&result[0], &first));
        assert!(Embedding::ptr_eq(&result[1], &second));
    }

    #[test]
    fn test_out_of_order_output_is_sorted() {
        let host = host("aaaa bbbb cccc");
        let late = Embedding::region(&host, "x", 10..14).unwrap();
        let early = Embedding::region(&host, "x", 0..4).unwrap();

        let result = normalize(&host, vec![batch(vec![late, early])]);
        assert_eq!(texts(&result), vec!["aaaa", "cccc"]);
    }

    #[test]
    fn test_overlap_keeps_part_before_conflict() {
        let host = host("0123456789");
        let first = Embedding::region(&host, "x", 5..8).unwrap();
        let second = Embedding::region(&host, "y", 2..7).unwrap();

        let result = normalize(&host, vec![batch(vec![first, second])]);
        assert_eq!(texts(&result), vec!["234", "567"]);
        assert_eq!(result[0].language().as_str(), "y");
    }

    #[test]
    fn test_overlap_starting_inside_keeps_tail() {
        let host = host("0123456789");
        let first = Embedding::region(&host, "x", 2..5).unwrap();
        let second = Embedding::region(&host, "y", 4..9).unwrap();

        let result = normalize(&host, vec![batch(vec![first, second])]);
        assert_eq!(texts(&result), vec!["234", "5678"]);
    }

    #[test]
    fn test_fully_covered_embedding_is_dropped() {
        let host = host("0123456789");
        let first = Embedding::region(&host, "x", 1..9).unwrap();
        let second = Embedding::region(&host, "y", 3..6).unwrap();

        let result = normalize(&host, vec![batch(vec![first.clone(), second])]);
        assert_eq!(result.len(), 1);
        assert!(Embedding::ptr_eq(&result[0], &first));
    }

    #[test]
    fn test_first_registered_provider_wins() {
        let host = host("0123456789");
        let from_first = Embedding::region(&host, "x", 0..6).unwrap();
        let from_second = Embedding::region(&host, "y", 0..6).unwrap();

        let result = normalize(
            &host,
            vec![batch(vec![from_first.clone()]), batch(vec![from_second])],
        );
        assert_eq!(result.len(), 1);
        assert!(Embedding::ptr_eq(&result[0], &from_first));
    }

    #[test]
    fn test_touching_embeddings_do_not_conflict() {
        let host = host("0123456789");
        let first = Embedding::region(&host, "x", 0..5).unwrap();
        let second = Embedding::region(&host, "y", 5..10).unwrap();
        let empty = Embedding::region(&host, "z", 5..5).unwrap();

        let result = normalize(&host, vec![batch(vec![first, second, empty])]);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_join_sections_merges_same_language() {
        let text = "<s>a=1</s><p>hi</p><s>b=2</s>";
        let span = |needle: &str| {
            let start = text.find(needle).unwrap();
            start..start + needle.len()
        };
        let host = host(text);
        let a = Embedding::builder(&host, "js").source(span("a=1")).join_sections(true).build().unwrap();
        let p = Embedding::region(&host, "text", span("hi")).unwrap();
        let b = Embedding::builder(&host, "js").source(span("b=2")).join_sections(true).build().unwrap();

        let result = normalize(&host, vec![batch(vec![a, p, b])]);
        assert_eq!(texts(&result), vec!["a=1b=2", "hi"]);

        let joined = result[0].snapshot();
        assert_eq!(joined.original_offset(0), Some(span("a=1").start));
        assert_eq!(joined.original_offset(3), Some(span("b=2").start));
        assert!(result[0].joins_sections());
    }

    #[test]
    fn test_foreign_host_embeddings_are_dropped() {
        let host_a = host("aaaa");
        let host_b = host("bbbb");
        let foreign = Embedding::region(&host_b, "x", 0..2).unwrap();

        assert!(normalize(&host_a, vec![batch(vec![foreign])]).is_empty());
    }
}
