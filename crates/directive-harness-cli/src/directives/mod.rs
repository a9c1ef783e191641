//! Reference directives shipped as binaries.

mod echo;
mod write_note;

pub use echo::{EchoDirective, EchoInput, EchoOutput};
pub use write_note::{WriteNoteDirective, WriteNoteInput, WriteNoteOutput};
