/// A small console UI for structured command output.
pub mod ui;
