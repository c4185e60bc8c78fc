//! Runtime event logging
//!
//! Structured record of the things an embedder may want to observe: context
//! lifecycle, guard installation, interrupt delivery, foreign calls and
//! fatal errors. Backends implement [`EventLogger`].

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Runtime event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    ContextCreated {
        context: u64,
        stack_slots: usize,
    },
    ContextDestroyed {
        context: u64,
    },
    /// Guard region mapped past the operand stack
    GuardInstalled {
        context: u64,
        guard_slots: usize,
        protected: bool,
    },
    GuardRemoved {
        context: u64,
    },
    StackOverflow {
        context: u64,
        requested: usize,
        available: usize,
    },
    InterruptPosted {
        context: u64,
        kind: String,
    },
    /// Interrupt recorded while delivery was disabled
    InterruptDeferred {
        context: u64,
        kind: String,
    },
    InterruptDelivered {
        context: u64,
        kind: String,
    },
    ForeignCall {
        symbol: String,
        argc: usize,
    },
    CallbackInvoked {
        signature: String,
    },
    CallbackFailed {
        signature: String,
        error: String,
    },
    LibraryLoaded {
        path: PathBuf,
    },
    LockOrderViolation {
        held: String,
        requested: String,
    },
    Fatal {
        message: String,
    },
}

impl fmt::Display for RuntimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeEvent::ContextCreated {
                context,
                stack_slots,
            } => write!(
                f,
                "Context {} created ({} stack slots)",
                context, stack_slots
            ),
            RuntimeEvent::ContextDestroyed { context } => {
                write!(f, "Context {} destroyed", context)
            }
            RuntimeEvent::GuardInstalled {
                context,
                guard_slots,
                protected,
            } => {
                let kind = if *protected { "protected" } else { "unprotected" };
                write!(
                    f,
                    "Guard installed on context {}: {} slots, {} region",
                    context, guard_slots, kind
                )
            }
            RuntimeEvent::GuardRemoved { context } => {
                write!(f, "Guard removed from context {}", context)
            }
            RuntimeEvent::StackOverflow {
                context,
                requested,
                available,
            } => write!(
                f,
                "Stack overflow on context {}: requested {} slots, {} available",
                context, requested, available
            ),
            RuntimeEvent::InterruptPosted { context, kind } => {
                write!(f, "Interrupt posted to context {}: {}", context, kind)
            }
            RuntimeEvent::InterruptDeferred { context, kind } => {
                write!(f, "Interrupt deferred on context {}: {}", context, kind)
            }
            RuntimeEvent::InterruptDelivered { context, kind } => {
                write!(f, "Interrupt delivered on context {}: {}", context, kind)
            }
            RuntimeEvent::ForeignCall { symbol, argc } => {
                write!(f, "Foreign call: {} ({} arguments)", symbol, argc)
            }
            RuntimeEvent::CallbackInvoked { signature } => {
                write!(f, "Callback invoked: {}", signature)
            }
            RuntimeEvent::CallbackFailed { signature, error } => {
                write!(f, "Callback failed: {} - {}", signature, error)
            }
            RuntimeEvent::LibraryLoaded { path } => {
                write!(f, "Library loaded: {}", path.display())
            }
            RuntimeEvent::LockOrderViolation { held, requested } => write!(
                f,
                "Lock order violation: requested {} while holding {}",
                requested, held
            ),
            RuntimeEvent::Fatal { message } => write!(f, "Fatal: {}", message),
        }
    }
}

/// Event log entry with timestamp
#[derive(Debug, Clone, Serialize)]
pub struct EventEntry {
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    #[serde(flatten)]
    pub event: RuntimeEvent,
}

impl EventEntry {
    pub fn new(event: RuntimeEvent) -> Self {
        Self {
            timestamp: current_timestamp_ms(),
            event,
        }
    }

    /// Format as log line
    pub fn to_log_line(&self) -> String {
        format!("[{}] {}", format_timestamp(self.timestamp), self.event)
    }

    /// Format as one JSON object per line
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn format_timestamp(timestamp_ms: u64) -> String {
    format!("{}+{:03}ms", timestamp_ms / 1000, timestamp_ms % 1000)
}

/// Event logger trait for customizable logging backends
pub trait EventLogger: Send + Sync {
    fn log(&self, event: RuntimeEvent);

    /// All logged entries (empty for backends that do not retain them)
    fn entries(&self) -> Vec<EventEntry>;

    fn clear(&self);
}

/// In-memory event logger
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLogger {
    entries: Arc<Mutex<Vec<EventEntry>>>,
}

impl MemoryEventLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logged events without their timestamps
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.entries().into_iter().map(|entry| entry.event).collect()
    }
}

impl EventLogger for MemoryEventLogger {
    fn log(&self, event: RuntimeEvent) {
        let entry = EventEntry::new(event);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    fn entries(&self) -> Vec<EventEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Null event logger (no-op, the default)
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventLogger;

impl EventLogger for NullEventLogger {
    fn log(&self, _event: RuntimeEvent) {}

    fn entries(&self) -> Vec<EventEntry> {
        Vec::new()
    }

    fn clear(&self) {}
}

/// Writes one log line per event to standard error
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrEventLogger {
    json: bool,
}

impl StderrEventLogger {
    pub fn new() -> Self {
        Self { json: false }
    }

    /// Emit JSON lines instead of plain text
    pub fn json() -> Self {
        Self { json: true }
    }
}

impl EventLogger for StderrEventLogger {
    fn log(&self, event: RuntimeEvent) {
        let entry = EventEntry::new(event);
        let line = if self.json {
            entry.to_json_line().unwrap_or_else(|_| entry.to_log_line())
        } else {
            entry.to_log_line()
        };
        eprintln!("{}", line);
    }

    fn entries(&self) -> Vec<EventEntry> {
        Vec::new()
    }

    fn clear(&self) {}
}
