/// Exit code when `TASKS` gating leaves nothing to serve.
pub const EXIT_NO_OPS_ENABLED: i32 = 2;

/// Exit code after a second interrupt forces an immediate exit.
pub const EXIT_INTERRUPTED: i32 = 130;
