use clap::{Parser, Subcommand};

const HELP_EPILOG: &str = r#"Server options can also be provided via environment variables:
  CONFIG_PATH (default: ./config.yaml)
  DB_PATH     (default: data/app.db)
  PORT        (default: 5252 or config.listen_port)

The `hash-password` command prints a bcrypt hash for the `password_hash`
field of a user entry in the config file.
"#;

#[derive(Debug, Parser)]
#[command(
    name = "fampoints-server",
    version,
    about = "FamPoints server",
    long_about = None,
    after_long_help = HELP_EPILOG,
)]
pub struct Cli {
    /// Optional subcommand. Without one, runs the server.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Hash a password for use in the server config
    HashPassword {
        /// The plaintext password to hash
        password: String,
    },
}
