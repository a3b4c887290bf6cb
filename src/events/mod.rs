//! Log sources and the event-to-failure translator.
//!
//! ```text
//! ┌───────────┐  EventQuery   ┌──────────────┐  EventRecord  ┌─────────────────┐
//! │ selectors │ ────────────▶ │  LogSource   │ ────────────▶ │ EventTranslator │ ──▶ Ipv4Addr
//! └───────────┘               └──────────────┘               └─────────────────┘
//! ```
//!
//! # Implementations
//!
//! - [`MemoryLogSource`]: in-process logs fed by [`MemoryLogSource::publish`]
//! - [`FileLogSource`]: tails text log files, one record per line

mod file;
mod memory;
mod source;
mod translator;

pub use file::FileLogSource;
pub use memory::MemoryLogSource;
pub use source::*;
pub use translator::{
    compile_pattern, CompiledSelector, EventTranslator, TranslatorError, FAILURE_CHANNEL_CAPACITY,
    MATCH_TIMEOUT,
};
