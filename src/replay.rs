//! Replay index: journal contents organised for serving responses.
//!
//! Loading folds the journal's blocks into one response handler per
//! distinct request descriptor, each owning an ordered list of response
//! groups. Lookup is exact where possible and best-fit otherwise, scored
//! by a longest-common-subsequence decomposition over descriptor words.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::journal::{self, JournalEntry};
use crate::traffic::{Direction, TrafficTag};

/// Outcome of asking the index for the responses to a live request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Responses drawn from the matched handler's current group, in
    /// journal order.
    Found(Vec<JournalEntry>),
    /// Nothing matched; the adapter renders the message on the wire.
    Mismatch(String),
}

#[derive(Debug)]
struct ResponseHandler {
    tag: TrafficTag,
    /// Descriptor text, the matching target for best-fit.
    text: String,
    /// Outgoing entries per response group, in journal order.
    groups: Vec<Vec<JournalEntry>>,
    /// Per group: descriptors of nested sub-calls that gate advancement.
    intermediates: Vec<Vec<String>>,
    times_chosen: usize,
    /// Current group when intermediates are in play.
    position: usize,
}

impl ResponseHandler {
    fn new(tag: TrafficTag, text: String) -> Self {
        Self {
            tag,
            text,
            groups: vec![Vec::new()],
            intermediates: vec![Vec::new()],
            times_chosen: 0,
            position: 0,
        }
    }

    fn new_response(&mut self) {
        self.groups.push(Vec::new());
        self.intermediates.push(Vec::new());
    }

    fn add_response(&mut self, entry: JournalEntry) {
        self.groups.last_mut().expect("at least one group").push(entry);
    }

    fn add_intermediate(&mut self, key: String) {
        let gate = self.intermediates.last_mut().expect("at least one group");
        if !gate.contains(&key) {
            gate.push(key);
        }
    }

    fn has_intermediates(&self) -> bool {
        self.intermediates.iter().any(|gate| !gate.is_empty())
    }

    fn unmatched_responses(&self) -> usize {
        self.groups.len().saturating_sub(self.times_chosen)
    }
}

pub struct ReplayIndex {
    handlers: Vec<ResponseHandler>,
    by_key: HashMap<String, usize>,
    exact_matching: bool,
    last_descriptor: Option<String>,
}

impl ReplayIndex {
    pub fn load(path: &Path, exact_matching: bool) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReplayJournal {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_journal(&contents, exact_matching))
    }

    pub fn from_journal(contents: &str, exact_matching: bool) -> Self {
        let mut index = Self {
            handlers: Vec::new(),
            by_key: HashMap::new(),
            exact_matching,
            last_descriptor: None,
        };
        // Handlers currently open for responses, with their nesting level.
        let mut stack: Vec<(usize, usize)> = Vec::new();
        for entry in journal::parse(contents) {
            match entry.direction {
                Direction::Incoming => {
                    // A request at the same or shallower level closes the
                    // handlers opened since.
                    while let Some(&(_, level)) = stack.last() {
                        if level >= entry.level {
                            stack.pop();
                        } else {
                            break;
                        }
                    }
                    let key = entry.descriptor();
                    if entry.level > 0 {
                        if let Some(&(outer, _)) = stack.last() {
                            index.handlers[outer].add_intermediate(key.clone());
                        }
                    }
                    let idx = match index.by_key.get(&key) {
                        Some(&idx) => {
                            index.handlers[idx].new_response();
                            idx
                        }
                        None => {
                            let idx = index.handlers.len();
                            index
                                .handlers
                                .push(ResponseHandler::new(entry.tag, entry.text.clone()));
                            index.by_key.insert(key, idx);
                            idx
                        }
                    };
                    stack.push((idx, entry.level));
                }
                Direction::Outgoing => {
                    while let Some(&(_, level)) = stack.last() {
                        if level > entry.level {
                            stack.pop();
                        } else {
                            break;
                        }
                    }
                    match stack.last() {
                        Some(&(idx, _)) => index.handlers[idx].add_response(entry),
                        None => warn!("Ignoring response before any request: {:?}", entry.text),
                    }
                }
            }
        }
        index
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// True for journals recorded while playing client: nothing but
    /// generically-keyed server traffic.
    pub fn has_only_server_keys(&self) -> bool {
        !self.handlers.is_empty()
            && self.handlers.iter().all(|handler| handler.tag == TrafficTag::Srv)
    }

    /// Whether a command appears as a recorded `CMD` descriptor. Used to
    /// filter which intercept shims are worth creating in replay mode.
    pub fn has_command(&self, command: &str) -> bool {
        self.handlers.iter().any(|handler| {
            handler.tag == TrafficTag::Cmd
                && handler
                    .text
                    .split_whitespace()
                    .next()
                    .is_some_and(|word| word == command)
        })
    }

    /// Find the responses for a live request, advancing the matched
    /// handler's counter.
    ///
    /// When an id pattern is given, the id found in the matched recorded
    /// descriptor (the replay id) is substituted with the id found in the
    /// live text (the record id) throughout the response texts, aliasing
    /// recorded test-specific identifiers to new ones.
    pub fn find_responses(
        &mut self,
        tag: TrafficTag,
        text: &str,
        id_pattern: Option<&regex::Regex>,
    ) -> ReplayOutcome {
        let descriptor = if tag == TrafficTag::Srv {
            tag.as_str().to_string()
        } else {
            format!("{tag}:{text}")
        };
        let duplicate = !tag.has_repeats_in_replay()
            && self.last_descriptor.as_deref() == Some(descriptor.as_str());
        let Some(idx) = self.lookup(tag, text, &descriptor) else {
            return ReplayOutcome::Mismatch(format!(
                "recorded traffic of type {tag} has no response for {text:?}"
            ));
        };
        debug!("Matched {:?} against recorded {:?}", text, self.handlers[idx].text);
        self.last_descriptor = Some(descriptor);
        let ids = id_pattern.and_then(|pattern| {
            let replay_id = pattern.find(&self.handlers[idx].text)?.as_str().to_string();
            let record_id = pattern.find(text)?.as_str().to_string();
            (!replay_id.is_empty() && !record_id.is_empty()).then_some((replay_id, record_id))
        });
        let group_index = self.choose_group(idx, duplicate);
        let handler = &mut self.handlers[idx];
        if !duplicate {
            handler.times_chosen += 1;
        }
        let entries = handler.groups.get(group_index).cloned().unwrap_or_default();
        let responses = entries
            .into_iter()
            .filter(|entry| entry.direction == Direction::Outgoing)
            .map(|mut entry| {
                if let Some((replay_id, record_id)) = &ids {
                    entry.text = entry.text.replace(replay_id, record_id);
                }
                entry
            })
            .collect();
        ReplayOutcome::Found(responses)
    }

    fn lookup(&self, tag: TrafficTag, text: &str, descriptor: &str) -> Option<usize> {
        if let Some(&idx) = self.by_key.get(descriptor) {
            return Some(idx);
        }
        if self.exact_matching {
            return None;
        }
        let target = split_words(text);
        let (quality, _, idx) = self
            .handlers
            .iter()
            .enumerate()
            .filter(|(_, handler)| handler.tag == tag)
            .map(|(idx, handler)| {
                let quality =
                    match_quality(&split_words(&handler.text), &target, handler.unmatched_responses());
                (quality, &handler.text, idx)
            })
            // Ties on quality fall to the lexicographically smaller
            // descriptor, keeping the choice independent of key order.
            .max_by(|(qa, ta, _), (qb, tb, _)| qa.cmp(qb).then_with(|| tb.cmp(ta)))?;
        // A candidate sharing no words at all is a mismatch, not a match.
        (quality.0 > 0).then_some(idx)
    }

    fn choose_group(&mut self, idx: usize, duplicate: bool) -> usize {
        let handler = &self.handlers[idx];
        let group_count = handler.groups.len();
        if handler.has_intermediates() {
            if handler.times_chosen == 0 {
                self.handlers[idx].position = 0;
                return 0;
            }
            let previous = handler.position;
            let gate = handler
                .intermediates
                .get(previous)
                .cloned()
                .unwrap_or_default();
            let all_called = gate.iter().all(|key| {
                self.by_key
                    .get(key)
                    .map(|&i| self.handlers[i].times_chosen >= 1)
                    .unwrap_or(true)
            });
            let position = if all_called {
                (previous + 1).min(group_count - 1)
            } else {
                previous
            };
            self.handlers[idx].position = position;
            position
        } else if duplicate {
            match handler.times_chosen {
                0 => 0,
                chosen if chosen - 1 < group_count => chosen - 1,
                _ => 0,
            }
        } else if handler.times_chosen < group_count {
            handler.times_chosen
        } else {
            0
        }
    }
}

fn split_words(text: &str) -> Vec<&str> {
    text.split(|c: char| matches!(c, '/' | '(' | ')' | '\\') || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .collect()
}

/// Match quality of `candidate` against `target`:
/// (words in common, −non-matching runs, unmatched response groups),
/// compared lexicographically, greatest wins. A trailing run on one side
/// only is not held against the candidate.
fn match_quality(candidate: &[&str], target: &[&str], unmatched: usize) -> (usize, i64, usize) {
    let blocks = matching_blocks(candidate, target);
    let words: usize = blocks.iter().map(|&(_, _, len)| len).sum();
    let mut runs = 0i64;
    let (mut end_a, mut end_b) = (0, 0);
    for &(a, b, len) in &blocks {
        if a > end_a || b > end_b {
            runs += 1;
        }
        end_a = a + len;
        end_b = b + len;
    }
    if end_a < candidate.len() && end_b < target.len() {
        runs += 1;
    }
    (words, -runs, unmatched)
}

/// Contiguous matching runs between two word sequences, longest-first
/// recursion, returned in ascending order.
fn matching_blocks(a: &[&str], b: &[&str]) -> Vec<(usize, usize, usize)> {
    let mut blocks = Vec::new();
    let mut queue = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = queue.pop() {
        let (i, j, len) = longest_match(a, b, alo, ahi, blo, bhi);
        if len > 0 {
            blocks.push((i, j, len));
            queue.push((alo, i, blo, j));
            queue.push((i + len, ahi, j + len, bhi));
        }
    }
    blocks.sort_unstable();
    blocks
}

fn longest_match(
    a: &[&str],
    b: &[&str],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let mut best = (alo, blo, 0);
    let mut run_lengths: HashMap<usize, usize> = HashMap::new();
    for i in alo..ahi {
        let mut next_lengths = HashMap::new();
        for j in blo..bhi {
            if a[i] == b[j] {
                let len = j
                    .checked_sub(1)
                    .and_then(|prev| run_lengths.get(&prev))
                    .copied()
                    .unwrap_or(0)
                    + 1;
                next_lengths.insert(j, len);
                if len > best.2 {
                    best = (i + 1 - len, j + 1 - len, len);
                }
            }
        }
        run_lengths = next_lengths;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responses(outcome: ReplayOutcome) -> Vec<String> {
        match outcome {
            ReplayOutcome::Found(entries) => entries.into_iter().map(|e| e.text).collect(),
            ReplayOutcome::Mismatch(message) => panic!("unexpected mismatch: {message}"),
        }
    }

    #[test]
    fn exact_match_serves_the_recorded_response() {
        let mut index = ReplayIndex::from_journal("<-CLI:ping\n->SRV:pong\n", false);
        let texts = responses(index.find_responses(TrafficTag::Cli, "ping", None));
        assert_eq!(texts, vec!["pong"]);
    }

    #[test]
    fn response_groups_are_served_in_journal_order() {
        let journal = "<-CLI:poll\n->SRV:starting\n<-CLI:poll\n->SRV:done\n";
        let mut index = ReplayIndex::from_journal(journal, false);
        assert_eq!(responses(index.find_responses(TrafficTag::Cli, "poll", None)), vec!["starting"]);
        assert_eq!(responses(index.find_responses(TrafficTag::Cli, "poll", None)), vec!["done"]);
        // exhausted: falls back to the first group
        assert_eq!(responses(index.find_responses(TrafficTag::Cli, "poll", None)), vec!["starting"]);
    }

    #[test]
    fn exact_matching_mode_refuses_near_misses() {
        let mut index = ReplayIndex::from_journal("<-CLI:ping\n->SRV:pong\n", true);
        assert!(matches!(
            index.find_responses(TrafficTag::Cli, "pingg", None),
            ReplayOutcome::Mismatch(_)
        ));
    }

    #[test]
    fn best_fit_prefers_more_words_in_common() {
        let journal = "<-CLI:get /api/users/list\n->SRV:users\n<-CLI:get /api/items\n->SRV:items\n";
        let mut index = ReplayIndex::from_journal(journal, false);
        let texts = responses(index.find_responses(TrafficTag::Cli, "get /api/users/all", None));
        assert_eq!(texts, vec!["users"]);
    }

    #[test]
    fn best_fit_tie_breaks_deterministically() {
        // both candidates differ from the target in exactly one word:
        // identical quality tuples, so the lexicographically smaller
        // descriptor must win regardless of journal order
        for journal in [
            "<-CLI:foo/a/b\n->SRV:from b\n<-CLI:foo/a/c\n->SRV:from c\n",
            "<-CLI:foo/a/c\n->SRV:from c\n<-CLI:foo/a/b\n->SRV:from b\n",
        ] {
            let mut index = ReplayIndex::from_journal(journal, false);
            let texts = responses(index.find_responses(TrafficTag::Cli, "foo/a/d", None));
            assert_eq!(texts, vec!["from b"]);
        }
    }

    #[test]
    fn unmatched_responses_break_quality_ties() {
        let journal = "<-CLI:job/1/status\n->SRV:first\n<-CLI:job/2/status\n->SRV:second\n";
        let mut index = ReplayIndex::from_journal(journal, false);
        // consume job/1 so its unmatched count drops below job/2's
        assert_eq!(responses(index.find_responses(TrafficTag::Cli, "job/1/status", None)), vec!["first"]);
        let texts = responses(index.find_responses(TrafficTag::Cli, "job/9/status", None));
        assert_eq!(texts, vec!["second"]);
    }

    #[test]
    fn best_fit_never_crosses_type_tags() {
        let mut index = ReplayIndex::from_journal("<-CMD:echo hello\n->OUT:hello\n\n->EXC:0\n", false);
        assert!(matches!(
            index.find_responses(TrafficTag::Cli, "echo hello", None),
            ReplayOutcome::Mismatch(_)
        ));
    }

    #[test]
    fn duplicates_of_non_repeatable_traffic_do_not_advance() {
        let journal = "<-PYT:handle.count\n->RET:1\n<-PYT:handle.count\n->RET:2\n";
        let mut index = ReplayIndex::from_journal(journal, false);
        assert_eq!(responses(index.find_responses(TrafficTag::Pyt, "handle.count", None)), vec!["1"]);
        // same descriptor again: previous group, counter untouched
        assert_eq!(responses(index.find_responses(TrafficTag::Pyt, "handle.count", None)), vec!["1"]);
        // a different descriptor in between re-arms the counter
        index.last_descriptor = None;
        assert_eq!(responses(index.find_responses(TrafficTag::Pyt, "handle.count", None)), vec!["2"]);
    }

    #[test]
    fn server_traffic_is_served_in_order_not_matched() {
        let journal = "<-SRV:connect a\n->CLI:ack a\n<-SRV:completely different\n->CLI:ack b\n";
        let mut index = ReplayIndex::from_journal(journal, false);
        assert_eq!(responses(index.find_responses(TrafficTag::Srv, "whatever", None)), vec!["ack a"]);
        assert_eq!(responses(index.find_responses(TrafficTag::Srv, "anything", None)), vec!["ack b"]);
    }

    #[test]
    fn intermediate_sub_calls_gate_group_advancement() {
        let journal = "<-CMD:run job\n<-  PYT:job.status()\n->  RET:'pending'\n->OUT:queued\n\n->EXC:0\n<-CMD:run job\n->OUT:finished\n\n->EXC:0\n";
        let mut index = ReplayIndex::from_journal(journal, false);
        assert_eq!(
            responses(index.find_responses(TrafficTag::Cmd, "run job", None)),
            vec!["queued\n", "0"]
        );
        // the nested handler has not been called: stay on group 0
        assert_eq!(
            responses(index.find_responses(TrafficTag::Cmd, "run job", None)),
            vec!["queued\n", "0"]
        );
        assert_eq!(responses(index.find_responses(TrafficTag::Pyt, "job.status()", None)), vec!["'pending'"]);
        // gate satisfied: advance to the second group
        assert_eq!(
            responses(index.find_responses(TrafficTag::Cmd, "run job", None)),
            vec!["finished\n", "0"]
        );
    }

    #[test]
    fn replay_ids_are_substituted_with_record_ids() {
        let journal = "<-CLI:create session_17\n->SRV:created session_17 ok\n";
        let mut index = ReplayIndex::from_journal(journal, false);
        let pattern = regex::Regex::new(r"session_\d+").unwrap();
        // the live request carries a fresh id: best-fit still matches, and
        // the recorded id is aliased to the live one in the response
        let texts =
            responses(index.find_responses(TrafficTag::Cli, "create session_42", Some(&pattern)));
        assert_eq!(texts, vec!["created session_42 ok"]);
    }

    #[test]
    fn commands_are_discoverable_for_shim_filtering() {
        let index = ReplayIndex::from_journal("<-CMD:echo hello\n->EXC:0\n", false);
        assert!(index.has_command("echo"));
        assert!(!index.has_command("ls"));
    }
}
