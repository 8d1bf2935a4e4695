use clap::ValueEnum;

/// What to do when a previous run left a state ledger behind.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeMode {
    /// Resume when a ledger exists, start fresh otherwise.
    Auto,
    /// Fail unless there is a ledger to resume from.
    Always,
    /// Discard any ledger and start over.
    Never,
}
