//! The dispatch engine: decide replay versus forward for every incoming
//! traffic item, keep the journal ordered, and hand responses back to the
//! owning adapter.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;

use crate::alteration::Alterations;
use crate::config::{RcConfig, GENERAL_SECTION};
use crate::edits::EditTracker;
use crate::error::{Error, Result};
use crate::journal;
use crate::recorder::RecordFileWriter;
use crate::replay::{ReplayIndex, ReplayOutcome};
use crate::traffic::{TrafficItem, TrafficTag};

/// The three operating modes of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Serve everything from the journal; fail on the first deviation.
    Replay,
    /// Forward everything to the real collaborator and journal it.
    Record,
    /// Replay when an entry exists, record otherwise.
    ReplayOrRecord,
}

impl CaptureMode {
    pub fn from_number(mode: u8) -> Self {
        match mode {
            1 => CaptureMode::Record,
            2 => CaptureMode::ReplayOrRecord,
            _ => CaptureMode::Replay,
        }
    }
}

/// The adapter-side client path: carry an outgoing request to the real
/// collaborator and gather its responses.
#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(&self, item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>>;
}

/// Used when no backend exists, i.e. pure replay.
pub struct NoForward;

#[async_trait]
impl Forward for NoForward {
    async fn forward(&self, _item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no backend configured",
        ))
    }
}

struct DispatchState {
    recorder: Option<RecordFileWriter>,
    replay: Option<ReplayIndex>,
    alterations: Alterations,
    edits: EditTracker,
}

/// Options distilled from the CLI and rc files.
pub struct DispatcherBuilder {
    mode: CaptureMode,
    replay_file: Option<PathBuf>,
    record_file: Option<PathBuf>,
    replay_edit_dir: Option<PathBuf>,
    record_edit_dir: Option<PathBuf>,
    config: RcConfig,
}

impl DispatcherBuilder {
    pub fn new(mode: CaptureMode, config: RcConfig) -> Self {
        Self {
            mode,
            replay_file: None,
            record_file: None,
            replay_edit_dir: None,
            record_edit_dir: None,
            config,
        }
    }

    pub fn replay_file(mut self, path: Option<PathBuf>) -> Self {
        self.replay_file = path;
        self
    }

    pub fn record_file(mut self, path: Option<PathBuf>) -> Self {
        self.record_file = path;
        self
    }

    pub fn replay_edit_dir(mut self, path: Option<PathBuf>) -> Self {
        self.replay_edit_dir = path;
        self
    }

    pub fn record_edit_dir(mut self, path: Option<PathBuf>) -> Self {
        self.record_edit_dir = path;
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        let exact = self
            .config
            .get_bool(GENERAL_SECTION, "use_exact_matching", false);
        let replay = match (&self.mode, &self.replay_file) {
            (CaptureMode::Record, _) | (_, None) => None,
            (CaptureMode::ReplayOrRecord, Some(path)) if !path.exists() => {
                // first run of a fallback session: nothing recorded yet
                debug!("No replay journal at {} yet", path.display());
                None
            }
            (_, Some(path)) => Some(ReplayIndex::load(path, exact)?),
        };
        let recorder = match (&self.mode, &self.record_file) {
            (CaptureMode::Replay, _) | (_, None) => None,
            (_, Some(path)) => Some(RecordFileWriter::create(path)?),
        };
        let ignored = self.config.get_list(GENERAL_SECTION, "ignore_edits");
        let mut edits = EditTracker::new(self.record_edit_dir, self.replay_edit_dir, ignored);
        for path in self.config.get_list(GENERAL_SECTION, "watch_paths") {
            edits.watch(PathBuf::from(path));
        }
        let parse_pattern = |key: &str| {
            self.config.get(GENERAL_SECTION, key).and_then(|p| match Regex::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Ignoring invalid {key}: {e}");
                    None
                }
            })
        };
        Ok(Dispatcher {
            mode: self.mode,
            record_timestamps: self
                .config
                .get_bool(GENERAL_SECTION, "record_timestamps", false),
            id_pattern_client: parse_pattern("id_pattern_client"),
            id_pattern_server: parse_pattern("id_pattern_server"),
            state: Mutex::new(DispatchState {
                recorder,
                replay,
                alterations: Alterations::from_config(&self.config),
                edits,
            }),
            request_counter: AtomicU64::new(0),
            forward_target: Mutex::new(None),
        })
    }
}

/// Per-request: decide replay versus forward, invoke the adapter's client
/// path, record, and chain nested responses.
pub struct Dispatcher {
    mode: CaptureMode,
    record_timestamps: bool,
    id_pattern_client: Option<Regex>,
    id_pattern_server: Option<Regex>,
    state: Mutex<DispatchState>,
    request_counter: AtomicU64,
    /// Downstream real server registered with `SUT_SERVER:<host>:<port>`.
    forward_target: Mutex<Option<String>>,
}

impl Dispatcher {
    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Request numbers are assigned at accept time, strictly increasing.
    pub fn next_request_number(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register the downstream real server: the SUT is acting as a client
    /// to it, and record mode forwards there.
    pub fn set_forward_target(&self, address: &str) {
        info!("Forwarding to real server at {address}");
        *self.forward_target.lock().expect("poisoned lock") = Some(address.to_string());
    }

    pub fn forward_target(&self) -> Option<String> {
        self.forward_target.lock().expect("poisoned lock").clone()
    }

    /// The tag for generic incoming socket traffic. A journal recorded
    /// while playing client consists of server messages only; replay then
    /// keys everything generically and serves the messages in order.
    pub fn incoming_tag(&self) -> TrafficTag {
        let state = self.state.lock().expect("poisoned lock");
        match &state.replay {
            Some(index) if index.has_only_server_keys() => TrafficTag::Srv,
            _ => TrafficTag::Cli,
        }
    }

    /// Whether a recorded `CMD` entry exists for `command`; replay mode
    /// creates shims only for commands the journal mentions.
    pub fn has_recorded_command(&self, command: &str) -> bool {
        let state = self.state.lock().expect("poisoned lock");
        match &state.replay {
            Some(index) => index.has_command(command),
            None => true,
        }
    }

    /// Register a directory whose edits should be mirrored as traffic.
    pub fn watch_edits(&self, path: PathBuf) {
        self.state.lock().expect("poisoned lock").edits.watch(path);
    }

    /// The record-side edit directory, where uploads and edited-file
    /// copies are stored for byte-exact replay.
    pub fn edit_record_dir(&self) -> Option<PathBuf> {
        let state = self.state.lock().expect("poisoned lock");
        state.edits.record_dir().map(|dir| dir.to_path_buf())
    }

    /// Drop accumulated per-lifetime state: alteration variables and the
    /// repeat cache. Called on `TERMINATE_SERVER`.
    pub fn reset(&self) {
        self.state.lock().expect("poisoned lock").alterations.reset();
    }

    /// Process one incoming traffic item.
    ///
    /// The returned items are in delivery order; rendering them back onto
    /// the transport is the calling adapter's business. The request is
    /// always marked complete towards the record writer, matched or not.
    pub async fn process(
        &self,
        item: TrafficItem,
        request_number: u64,
        forward: &dyn Forward,
    ) -> Result<Vec<TrafficItem>> {
        let result = self.process_inner(item, request_number, forward).await;
        let mut state = self.state.lock().expect("poisoned lock");
        if let Some(recorder) = state.recorder.as_mut() {
            recorder.request_complete(request_number);
        }
        result
    }

    async fn process_inner(
        &self,
        mut item: TrafficItem,
        request_number: u64,
        forward: &dyn Forward,
    ) -> Result<Vec<TrafficItem>> {
        {
            let mut state = self.state.lock().expect("poisoned lock");
            item.text = state.alterations.apply(&item.text);
            if self.record_timestamps {
                item.timestamp = Some(journal::timestamp_now());
            }
            if item.record && state.recorder.is_some() && state.edits.is_active() {
                state.edits.snapshot();
            }
        }

        let replayed = self.try_replay(&item)?;
        let from_replay = replayed.is_some();
        let responses = match replayed {
            Some(responses) => responses,
            None => match forward.forward(&item).await {
                Ok(responses) => responses,
                Err(e) => {
                    // The SUT gets an empty payload, not a stack trace.
                    warn!("Backend unreachable, recording empty response: {e}");
                    Vec::new()
                }
            },
        };

        let mut responses = responses;
        if self.record_timestamps {
            for response in &mut responses {
                response.timestamp = Some(journal::timestamp_now());
            }
        }

        let mut state = self.state.lock().expect("poisoned lock");
        let already_covered = from_replay && self.mode == CaptureMode::ReplayOrRecord;
        if item.record && !already_covered && state.recorder.is_some() {
            let mut text = journal::format_item(&item);
            for response in &responses {
                text.push_str(&journal::format_item(response));
            }
            if state.edits.is_active() {
                for edit in state.edits.diff_since_snapshot() {
                    text.push_str(&journal::format_item(&edit));
                }
            }
            let recorder = state.recorder.as_mut().expect("checked above");
            recorder.record(&text, request_number);
        }
        if from_replay {
            for response in &responses {
                if response.tag == TrafficTag::Fil && response.data.is_none() {
                    state.edits.apply_edit(response);
                }
            }
        }
        Ok(responses)
    }

    /// Consult the replay index, if it is active for this item.
    fn try_replay(&self, item: &TrafficItem) -> Result<Option<Vec<TrafficItem>>> {
        let mut state = self.state.lock().expect("poisoned lock");
        let Some(index) = state.replay.as_mut() else {
            return Ok(None);
        };
        let id_pattern = match item.tag {
            TrafficTag::Srv => self.id_pattern_server.as_ref(),
            _ => self.id_pattern_client.as_ref(),
        };
        match index.find_responses(item.tag, &item.text, id_pattern) {
            ReplayOutcome::Found(entries) => {
                debug!("Replaying {} response(s) for {:?}", entries.len(), item.text);
                Ok(Some(entries.iter().map(|entry| entry.to_item()).collect()))
            }
            ReplayOutcome::Mismatch(message) => {
                if self.mode == CaptureMode::ReplayOrRecord {
                    debug!("No recorded entry, falling back to recording: {message}");
                    Ok(None)
                } else {
                    Err(Error::ReplayMismatch(message))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::Direction;

    struct StaticForward(Vec<TrafficItem>);

    #[async_trait]
    impl Forward for StaticForward {
        async fn forward(&self, _item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>> {
            Ok(self.0.clone())
        }
    }

    fn replay_dispatcher(journal: &str) -> Dispatcher {
        let dir = tempfile::tempdir().unwrap();
        let replay_path = dir.path().join("replay.journal");
        std::fs::write(&replay_path, journal).unwrap();
        DispatcherBuilder::new(CaptureMode::Replay, RcConfig::new())
            .replay_file(Some(replay_path))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn replay_mode_serves_from_the_journal() {
        let dispatcher = replay_dispatcher("<-CLI:ping\n->SRV:pong\n");
        let request = dispatcher.next_request_number();
        let responses = dispatcher
            .process(TrafficItem::incoming(TrafficTag::Cli, "ping"), request, &NoForward)
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].text, "pong");
        assert_eq!(responses[0].direction, Direction::Outgoing);
    }

    #[tokio::test]
    async fn replay_mismatch_is_a_typed_error() {
        let dispatcher = replay_dispatcher("<-CMD:ls\n->EXC:0\n");
        let request = dispatcher.next_request_number();
        let error = dispatcher
            .process(TrafficItem::incoming(TrafficTag::Cli, "ping"), request, &NoForward)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::ReplayMismatch(_)));
    }

    #[tokio::test]
    async fn record_mode_forwards_and_journals() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("record.journal");
        let dispatcher = DispatcherBuilder::new(CaptureMode::Record, RcConfig::new())
            .record_file(Some(record_path.clone()))
            .build()
            .unwrap();
        let backend = StaticForward(vec![TrafficItem::outgoing(TrafficTag::Srv, "pong")]);

        let request = dispatcher.next_request_number();
        let responses = dispatcher
            .process(TrafficItem::incoming(TrafficTag::Cli, "ping"), request, &backend)
            .await
            .unwrap();
        assert_eq!(responses[0].text, "pong");
        assert_eq!(
            std::fs::read_to_string(&record_path).unwrap(),
            "<-CLI:ping\n->SRV:pong\n"
        );
    }

    #[tokio::test]
    async fn unreachable_backend_records_an_empty_response() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("record.journal");
        let dispatcher = DispatcherBuilder::new(CaptureMode::Record, RcConfig::new())
            .record_file(Some(record_path.clone()))
            .build()
            .unwrap();

        let request = dispatcher.next_request_number();
        let responses = dispatcher
            .process(TrafficItem::incoming(TrafficTag::Cli, "ping"), request, &NoForward)
            .await
            .unwrap();
        assert!(responses.is_empty());
        assert_eq!(std::fs::read_to_string(&record_path).unwrap(), "<-CLI:ping\n");
    }

    #[tokio::test]
    async fn fallback_mode_records_only_unknown_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let replay_path = dir.path().join("replay.journal");
        let record_path = dir.path().join("record.journal");
        std::fs::write(&replay_path, "<-CLI:known\n->SRV:covered\n").unwrap();
        let dispatcher = DispatcherBuilder::new(CaptureMode::ReplayOrRecord, RcConfig::new())
            .replay_file(Some(replay_path))
            .record_file(Some(record_path.clone()))
            .build()
            .unwrap();
        let backend = StaticForward(vec![TrafficItem::outgoing(TrafficTag::Srv, "fresh")]);

        let request = dispatcher.next_request_number();
        let covered = dispatcher
            .process(TrafficItem::incoming(TrafficTag::Cli, "known"), request, &backend)
            .await
            .unwrap();
        assert_eq!(covered[0].text, "covered");

        let request = dispatcher.next_request_number();
        let fresh = dispatcher
            .process(TrafficItem::incoming(TrafficTag::Cli, "unknown"), request, &backend)
            .await
            .unwrap();
        assert_eq!(fresh[0].text, "fresh");

        // only the forwarded request reached the journal
        assert_eq!(
            std::fs::read_to_string(&record_path).unwrap(),
            "<-CLI:unknown\n->SRV:fresh\n"
        );
    }

    #[tokio::test]
    async fn request_numbers_strictly_increase() {
        let dispatcher = replay_dispatcher("<-CLI:ping\n->SRV:pong\n");
        let first = dispatcher.next_request_number();
        let second = dispatcher.next_request_number();
        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test]
    async fn file_edits_are_journalled_alongside_the_request() {
        struct WritingForward(PathBuf);

        #[async_trait]
        impl Forward for WritingForward {
            async fn forward(&self, _item: &TrafficItem) -> std::io::Result<Vec<TrafficItem>> {
                std::fs::write(&self.0, "fresh output")?;
                Ok(vec![TrafficItem::outgoing(TrafficTag::Srv, "done")])
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let watched = dir.path().join("work");
        std::fs::create_dir_all(&watched).unwrap();
        let edits_dir = dir.path().join("edits");
        std::fs::create_dir_all(&edits_dir).unwrap();
        let record_path = dir.path().join("record.journal");
        let dispatcher = DispatcherBuilder::new(CaptureMode::Record, RcConfig::new())
            .record_file(Some(record_path.clone()))
            .record_edit_dir(Some(edits_dir))
            .build()
            .unwrap();
        dispatcher.watch_edits(watched.clone());

        let request = dispatcher.next_request_number();
        let backend = WritingForward(watched.join("result.txt"));
        dispatcher
            .process(TrafficItem::incoming(TrafficTag::Cli, "run"), request, &backend)
            .await
            .unwrap();

        let journal = std::fs::read_to_string(&record_path).unwrap();
        assert!(journal.contains("<-CLI:run\n"), "journal: {journal}");
        assert!(journal.contains("->FIL:"), "journal: {journal}");
        assert!(journal.contains("result.txt"), "journal: {journal}");
    }

    #[tokio::test]
    async fn alterations_canonicalise_before_matching() {
        let dir = tempfile::tempdir().unwrap();
        let replay_path = dir.path().join("replay.journal");
        std::fs::write(&replay_path, "<-CLI:run at <date>\n->SRV:ok\n").unwrap();
        let mut config = RcConfig::new();
        config.set(GENERAL_SECTION, "alterations", "dates");
        config.set("dates", "match_pattern", r"\d{4}-\d{2}-\d{2}");
        config.set("dates", "replacement", "<date>");
        let dispatcher = DispatcherBuilder::new(CaptureMode::Replay, config)
            .replay_file(Some(replay_path))
            .build()
            .unwrap();

        let request = dispatcher.next_request_number();
        let responses = dispatcher
            .process(
                TrafficItem::incoming(TrafficTag::Cli, "run at 2024-05-01"),
                request,
                &NoForward,
            )
            .await
            .unwrap();
        assert_eq!(responses[0].text, "ok");
    }
}
