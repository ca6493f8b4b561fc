/// How much the harness prints while running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

/// Harness configuration, filled in by bring-up.
#[derive(Clone, Copy, Debug)]
pub struct TestConfig {
    pub enabled: bool,
    pub verbosity: Verbosity,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verbosity: Verbosity::Normal,
        }
    }
}
