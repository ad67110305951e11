/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{collections::VecDeque, fmt::Display, sync::Mutex};

use serde::{Deserialize, Serialize};

/// How an operation came out of the chaos layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventKind {
    Ok,
    Fail,
    ShortRead,
    PartialRead,
    PartialWrite,
    ShortWrite,
    PartialReaddir,
}

impl Display for TraceEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TraceEventKind::Ok => "ok",
            TraceEventKind::Fail => "fail",
            TraceEventKind::ShortRead => "short_read",
            TraceEventKind::PartialRead => "partial_read",
            TraceEventKind::PartialWrite => "partial_write",
            TraceEventKind::ShortWrite => "short_write",
            TraceEventKind::PartialReaddir => "partial_readdir",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub seq: u64,
    pub op: &'static str,
    pub path: String,
    pub kind: TraceEventKind,
    pub error: Option<String>,
    pub injected: bool,
    pub attrs: Vec<(&'static str, String)>,
}

impl Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} '{}' {}", self.seq, self.op, self.path, self.kind)?;
        if self.injected {
            write!(f, " injected")?;
        }
        if let Some(error) = &self.error {
            write!(f, " error='{}'", error)?;
        }
        for (key, value) in &self.attrs {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Bounded ring buffer of trace events. Capacity 0 disables recording;
/// otherwise the oldest events are dropped once the buffer is full.
pub struct Trace {
    capacity: usize,
    state: Mutex<TraceState>,
}

struct TraceState {
    next_seq: u64,
    events: VecDeque<TraceEvent>,
}

impl Trace {
    pub fn new(capacity: usize) -> Self {
        Trace {
            capacity,
            state: Mutex::new(TraceState {
                next_seq: 1,
                events: VecDeque::new(),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn record(
        &self,
        op: &'static str,
        path: String,
        kind: TraceEventKind,
        error: Option<String>,
        injected: bool,
        attrs: Vec<(&'static str, String)>,
    ) {
        if !self.enabled() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        if state.events.len() == self.capacity {
            state.events.pop_front();
        }
        state.events.push_back(TraceEvent {
            seq,
            op,
            path,
            kind,
            error,
            injected,
            attrs,
        });
    }

    /// Events currently held, in insertion order.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.state.lock().unwrap().events.iter().cloned().collect()
    }

    /// One line per event, insertion order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for event in self.events() {
            out.push_str(&event.to_string());
            out.push('\n');
        }
        out
    }
}
