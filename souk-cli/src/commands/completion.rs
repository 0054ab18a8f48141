//! `completion`: shell completion scripts.

use std::io;

use clap::CommandFactory;
use clap_complete::{generate, shells::Shell};

use crate::Cli;

/// Writes the completion script for `shell` to stdout, named after the
/// `souk` binary.
///
/// # Arguments
/// * `shell` - Target shell.
///
/// # Examples
/// ```text
/// souk completion --shell zsh > ~/.zfunc/_souk
/// ```
pub fn generate_completion(shell: Shell) {
    let mut command = Cli::command();
    let name = command.get_name().to_string();
    generate(shell, &mut command, name, &mut io::stdout());
}
