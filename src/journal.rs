//! The traffic-journal text format.
//!
//! One item per block: a descriptor line `(<-|->)(  )*TTT:<first payload
//! line>`, continuation lines for the rest of the payload, then optional
//! `--TIM:` / `--HEA:` annotation lines. Space pairs express RPC sub-call
//! nesting. The same grammar backs both recording and replay.

use log::warn;

use crate::traffic::{Direction, TrafficItem, TrafficTag};

pub const TIME_ANNOTATION: &str = "--TIM:";
pub const HEADER_ANNOTATION: &str = "--HEA:";

/// One parsed journal block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub direction: Direction,
    pub tag: TrafficTag,
    /// Nesting level: one per two leading spaces.
    pub level: usize,
    pub text: String,
    pub timestamp: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl JournalEntry {
    /// The replay-index key: server traffic is keyed by tag alone.
    pub fn descriptor(&self) -> String {
        if self.tag == TrafficTag::Srv {
            self.tag.as_str().to_string()
        } else {
            format!("{}:{}", self.tag, self.text)
        }
    }

    pub fn to_item(&self) -> TrafficItem {
        let mut item = TrafficItem::new(self.direction, self.tag, self.text.clone());
        item.timestamp = self.timestamp.clone();
        item.headers = self.headers.clone();
        item.indent = self.level;
        item
    }
}

fn parse_descriptor(line: &str) -> Option<(Direction, TrafficTag, usize, String)> {
    let trimmed = line.trim_start_matches(' ');
    let leading = line.len() - trimmed.len();
    let (direction, rest) = if let Some(rest) = trimmed.strip_prefix("<-") {
        (Direction::Incoming, rest)
    } else if let Some(rest) = trimmed.strip_prefix("->") {
        (Direction::Outgoing, rest)
    } else {
        return None;
    };
    // Accept the indent either side of the direction prefix.
    let inner = rest.trim_start_matches(' ');
    let level = (leading + rest.len() - inner.len()) / 2;
    let (tag_text, payload) = inner.split_once(':')?;
    let tag = TrafficTag::parse(tag_text)?;
    Some((direction, tag, level, payload.to_string()))
}

fn is_descriptor_like(line: &str) -> bool {
    let trimmed = line.trim_start_matches(' ');
    trimmed.starts_with("<-") || trimmed.starts_with("->")
}

/// Parse a journal into blocks, skipping malformed ones with a warning.
pub fn parse(contents: &str) -> Vec<JournalEntry> {
    let mut entries: Vec<JournalEntry> = Vec::new();
    // Payload lines accumulated for the block currently being read; None
    // while inside a block that failed to parse.
    let mut current: Option<(JournalEntry, Vec<String>)> = None;
    let mut skipping = false;

    let mut finish = |current: &mut Option<(JournalEntry, Vec<String>)>, entries: &mut Vec<JournalEntry>| {
        if let Some((mut entry, lines)) = current.take() {
            entry.text = lines.join("\n");
            entries.push(entry);
        }
    };

    for line in contents.lines() {
        if is_descriptor_like(line) {
            finish(&mut current, &mut entries);
            skipping = false;
            match parse_descriptor(line) {
                Some((direction, tag, level, first_line)) => {
                    current = Some((
                        JournalEntry {
                            direction,
                            tag,
                            level,
                            text: String::new(),
                            timestamp: None,
                            headers: Vec::new(),
                        },
                        vec![first_line],
                    ));
                }
                None => {
                    warn!("Skipping journal block with unparseable prefix: {line:?}");
                    skipping = true;
                }
            }
        } else if let Some(stamp) = line.strip_prefix(TIME_ANNOTATION) {
            if let Some((entry, _)) = current.as_mut() {
                entry.timestamp = Some(stamp.to_string());
            }
        } else if let Some(header) = line.strip_prefix(HEADER_ANNOTATION) {
            if let Some((entry, _)) = current.as_mut() {
                let (key, value) = header.split_once('=').unwrap_or((header, ""));
                entry.headers.push((key.to_string(), value.to_string()));
            }
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line.to_string());
        } else if !skipping && !line.is_empty() {
            warn!("Ignoring journal line outside any block: {line:?}");
        }
    }
    finish(&mut current, &mut entries);
    entries
}

/// Serialise one traffic item into its journal block.
pub fn format_item(item: &TrafficItem) -> String {
    let mut block = String::new();
    block.push_str(item.direction.prefix());
    for _ in 0..item.indent {
        block.push_str("  ");
    }
    block.push_str(item.tag.as_str());
    block.push(':');
    block.push_str(&item.text);
    block.push('\n');
    for (key, value) in &item.headers {
        block.push_str(HEADER_ANNOTATION);
        block.push_str(key);
        block.push('=');
        block.push_str(value);
        block.push('\n');
    }
    if let Some(stamp) = &item.timestamp {
        block.push_str(TIME_ANNOTATION);
        block.push_str(stamp);
        block.push('\n');
    }
    block
}

/// Current time in the ISO-8601 form used by `--TIM:` annotations.
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_session_parses_in_order() {
        let entries = parse("<-CLI:ping\n->SRV:pong\n<-CLI:ping\n->SRV:pong again\n");
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].descriptor(), "CLI:ping");
        assert_eq!(entries[0].direction, Direction::Incoming);
        assert_eq!(entries[1].text, "pong");
        assert_eq!(entries[3].text, "pong again");
    }

    #[test]
    fn multiline_payloads_keep_their_trailing_newline() {
        // stdout "hello\n" serialises as a payload line plus a blank line
        let entries = parse("<-CMD:echo hello\n->OUT:hello\n\n->EXC:0\n");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].tag, TrafficTag::Out);
        assert_eq!(entries[1].text, "hello\n");
        assert_eq!(entries[2].text, "0");
    }

    #[test]
    fn annotations_attach_to_their_block() {
        let entries = parse(
            "<-CLI:GET /items/42\n--HEA:Accept-Encoding=identity\n->SRV:200 OK\n{\"id\":42}\n--HEA:Content-Type=application/json\n--TIM:2024-05-01T12:00:00Z\n",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].headers, vec![("Accept-Encoding".into(), "identity".into())]);
        assert_eq!(entries[1].text, "200 OK\n{\"id\":42}");
        assert_eq!(entries[1].headers, vec![("Content-Type".into(), "application/json".into())]);
        assert_eq!(entries[1].timestamp.as_deref(), Some("2024-05-01T12:00:00Z"));
    }

    #[test]
    fn nested_sub_calls_carry_their_level() {
        let entries = parse("<-CMD:prog\n<-  PYT:handle.call()\n->  RET:'x'\n->OUT:done\n");
        assert_eq!(entries[1].level, 1);
        assert_eq!(entries[2].level, 1);
        assert_eq!(entries[3].level, 0);

        // Leading indent is accepted too
        let entries = parse("<-CMD:prog\n  <-PYT:handle.call()\n");
        assert_eq!(entries[1].level, 1);
    }

    #[test]
    fn malformed_blocks_are_skipped_not_fatal() {
        let entries = parse("<-XYZ:unknown tag\nits continuation\n<-CLI:ping\n->SRV:pong\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].descriptor(), "CLI:ping");
    }

    #[test]
    fn formatting_round_trips_through_parse() {
        let mut item = TrafficItem::outgoing(TrafficTag::Srv, "200 OK\nbody line");
        item.headers.push(("Content-Type".into(), "text/plain".into()));
        item.indent = 1;
        let block = format_item(&item);
        assert_eq!(block, "->  SRV:200 OK\nbody line\n--HEA:Content-Type=text/plain\n");
        let entries = parse(&block);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "200 OK\nbody line");
        assert_eq!(entries[0].level, 1);
    }
}
