//! Typed traffic items: the unit of recording, matching and replay.
//!
//! Every message that crosses an adapter becomes one [`TrafficItem`],
//! whether it came off the wire or out of a journal. The item's canonical
//! text is what gets matched and journalled; opaque binary payloads ride
//! alongside it for the transports that need byte-exact replay.

use std::fmt;

/// Direction of a traffic item, from the system-under-test's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the SUT towards the mocked collaborator.
    Incoming,
    /// From the mocked collaborator back to the SUT.
    Outgoing,
}

impl Direction {
    pub fn prefix(self) -> &'static str {
        match self {
            Direction::Incoming => "<-",
            Direction::Outgoing => "->",
        }
    }
}

/// Three-letter type tag carried by every journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficTag {
    /// Generic client request.
    Cli,
    /// Generic server response.
    Srv,
    /// Command-line invocation.
    Cmd,
    /// Captured stdout of a command.
    Out,
    /// Captured stderr of a command.
    Err,
    /// Exit code of a command.
    Exc,
    /// RPC return value.
    Ret,
    /// RPC call on a mocked instance.
    Pyt,
    /// File payload (FTP transfer or file-edit mirror).
    Fil,
    /// Directory listing payload.
    Lst,
    /// AMQP delivery.
    Rmq,
}

impl TrafficTag {
    pub const ALL: [TrafficTag; 11] = [
        TrafficTag::Cli,
        TrafficTag::Srv,
        TrafficTag::Cmd,
        TrafficTag::Out,
        TrafficTag::Err,
        TrafficTag::Exc,
        TrafficTag::Ret,
        TrafficTag::Pyt,
        TrafficTag::Fil,
        TrafficTag::Lst,
        TrafficTag::Rmq,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficTag::Cli => "CLI",
            TrafficTag::Srv => "SRV",
            TrafficTag::Cmd => "CMD",
            TrafficTag::Out => "OUT",
            TrafficTag::Err => "ERR",
            TrafficTag::Exc => "EXC",
            TrafficTag::Ret => "RET",
            TrafficTag::Pyt => "PYT",
            TrafficTag::Fil => "FIL",
            TrafficTag::Lst => "LST",
            TrafficTag::Rmq => "RMQ",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == tag)
    }

    /// The socket-id prefix this kind of traffic is recognised by on a
    /// line-oriented wire, if any.
    pub fn socket_id(self) -> Option<&'static str> {
        match self {
            TrafficTag::Cmd => Some(wire::SUT_COMMAND_LINE),
            TrafficTag::Pyt => Some(wire::SUT_PYTHON_CALL),
            TrafficTag::Srv => Some(wire::SUT_SERVER),
            _ => None,
        }
    }

    /// Whether successive identical descriptors of this kind should advance
    /// the replay counter. Attribute-style RPC reads do not: reading the
    /// same attribute twice must see the same value.
    pub fn has_repeats_in_replay(self) -> bool {
        !matches!(self, TrafficTag::Pyt)
    }
}

impl fmt::Display for TrafficTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reserved line-oriented wire prefixes and separators.
pub mod wire {
    /// Shuts the listener down.
    pub const TERMINATE_SERVER: &str = "TERMINATE_SERVER";
    /// Registers a downstream real server and flips the direction convention.
    pub const SUT_SERVER: &str = "SUT_SERVER";
    /// Command-line invocation from an intercept shim.
    pub const SUT_COMMAND_LINE: &str = "SUT_COMMAND_LINE";
    /// Signal received by an intercept shim.
    pub const SUT_COMMAND_KILL: &str = "SUT_COMMAND_KILL";
    /// RPC call on a mocked instance.
    pub const SUT_PYTHON_CALL: &str = "SUT_PYTHON_CALL";
    /// Field separator inside `SUT_COMMAND_LINE` messages.
    pub const SUT_SEP: &str = ":SUT_SEP:";
    /// Separator between stdout, stderr and exit code in shim replies.
    pub const CMD_SEP: &str = "|TT_CMD_SEP|";
    /// Marker prefixing replay-mismatch payloads.
    pub const MISMATCH: &str = "CAPTUREMOCK MISMATCH";
    /// Synchronisation message between related mock servers.
    pub const SYNCH: &str = "CAPTUREMOCK_SYNCH";
    /// Status probe between related mock servers.
    pub const STATUS: &str = "CAPTUREMOCK_STATUS";
}

/// One message, either direction, as matched, journalled and replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficItem {
    pub direction: Direction,
    pub tag: TrafficTag,
    /// Canonical textual rendering: alteration rules already applied.
    pub text: String,
    /// Opaque binary payload, used only by the framed-TCP and file
    /// passthrough paths. Never matched on.
    pub data: Option<Vec<u8>>,
    /// ISO-8601 stamp, present when `record_timestamps` is on.
    pub timestamp: Option<String>,
    /// Header annotations persisted as `--HEA:` continuation lines.
    pub headers: Vec<(String, String)>,
    /// Items marked false never reach the record file writer.
    pub record: bool,
    /// Nesting level for RPC sub-calls; two leading space pairs per level.
    pub indent: usize,
}

impl TrafficItem {
    pub fn incoming(tag: TrafficTag, text: impl Into<String>) -> Self {
        Self::new(Direction::Incoming, tag, text)
    }

    pub fn outgoing(tag: TrafficTag, text: impl Into<String>) -> Self {
        Self::new(Direction::Outgoing, tag, text)
    }

    pub fn new(direction: Direction, tag: TrafficTag, text: impl Into<String>) -> Self {
        Self {
            direction,
            tag,
            text: text.into(),
            data: None,
            timestamp: None,
            headers: Vec::new(),
            record: true,
            indent: 0,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn unrecorded(mut self) -> Self {
        self.record = false;
        self
    }

    /// The replay-index key for an incoming item.
    ///
    /// Server-to-SUT traffic is keyed generically: when playing client, the
    /// recorded server messages are emitted in order, not matched by payload.
    pub fn descriptor(&self) -> String {
        if self.tag == TrafficTag::Srv {
            self.tag.as_str().to_string()
        } else {
            format!("{}:{}", self.tag, self.text)
        }
    }

    /// The bytes delivered to the SUT for line-oriented transports.
    pub fn wire_bytes(&self) -> Vec<u8> {
        match &self.data {
            Some(data) => data.clone(),
            None => self.text.as_bytes().to_vec(),
        }
    }
}

/// Render an exit-status reply for an intercept shim:
/// `stdout|TT_CMD_SEP|stderr|TT_CMD_SEP|exitcode`.
pub fn join_command_reply(stdout: &str, stderr: &str, exit_code: i32) -> String {
    format!("{}{}{}{}{}", stdout, wire::CMD_SEP, stderr, wire::CMD_SEP, exit_code)
}

/// Split a shim reply into (stdout, stderr, exit code).
pub fn split_command_reply(reply: &str) -> (String, String, i32) {
    let mut parts = reply.splitn(3, wire::CMD_SEP);
    let stdout = parts.next().unwrap_or_default().to_string();
    let stderr = parts.next().unwrap_or_default().to_string();
    let exit_code = parts
        .next()
        .and_then(|code| code.trim().parse().ok())
        .unwrap_or(0);
    (stdout, stderr, exit_code)
}

/// Payload of a `SUT_COMMAND_LINE` message: argv, environment overrides,
/// working directory and client pid, `:SUT_SEP:`-joined on the wire.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommandInvocation {
    pub argv: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub working_dir: String,
    pub pid: u32,
}

impl CommandInvocation {
    /// Parse the `:SUT_SEP:`-joined wire form. The argv and environment
    /// fields are JSON renderings, which keeps embedded separators safe.
    pub fn parse(payload: &str) -> Option<Self> {
        let mut fields = payload.split(wire::SUT_SEP);
        let argv: Vec<String> = serde_json::from_str(fields.next()?).ok()?;
        let environment: Vec<(String, String)> = serde_json::from_str(fields.next()?).ok()?;
        let working_dir = fields.next()?.to_string();
        let pid = fields.next()?.trim().parse().ok()?;
        Some(Self {
            argv,
            environment,
            working_dir,
            pid,
        })
    }

    pub fn to_wire(&self) -> String {
        format!(
            "{}{}{}{}{}{}{}",
            serde_json::to_string(&self.argv).expect("argv is serialisable"),
            wire::SUT_SEP,
            serde_json::to_string(&self.environment).expect("environment is serialisable"),
            wire::SUT_SEP,
            self.working_dir,
            wire::SUT_SEP,
            self.pid,
        )
    }

    /// The canonical descriptor text: the command line as typed.
    pub fn descriptor_text(&self) -> String {
        self.argv.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_through_their_text_form() {
        for tag in TrafficTag::ALL {
            assert_eq!(TrafficTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(TrafficTag::parse("XXX"), None);
    }

    #[test]
    fn descriptors_key_server_traffic_generically() {
        let client = TrafficItem::incoming(TrafficTag::Cli, "ping");
        assert_eq!(client.descriptor(), "CLI:ping");

        let server = TrafficItem::incoming(TrafficTag::Srv, "anything at all");
        assert_eq!(server.descriptor(), "SRV");
    }

    #[test]
    fn command_replies_split_into_three_fields() {
        let reply = join_command_reply("hello\n", "", 3);
        assert_eq!(
            split_command_reply(&reply),
            ("hello\n".to_string(), String::new(), 3)
        );
    }

    #[test]
    fn command_reply_with_separator_free_payload_defaults_exit_code() {
        assert_eq!(split_command_reply("out only"), ("out only".to_string(), String::new(), 0));
    }

    #[test]
    fn command_invocations_survive_the_wire() {
        let invocation = CommandInvocation {
            argv: vec!["echo".into(), "hello world".into()],
            environment: vec![("LANG".into(), "C".into())],
            working_dir: "/tmp".into(),
            pid: 4711,
        };
        let parsed = CommandInvocation::parse(&invocation.to_wire()).unwrap();
        assert_eq!(parsed, invocation);
        assert_eq!(parsed.descriptor_text(), "echo hello world");
    }

    #[test]
    fn repeat_policy_is_per_tag() {
        assert!(TrafficTag::Cli.has_repeats_in_replay());
        assert!(!TrafficTag::Pyt.has_repeats_in_replay());
    }
}
