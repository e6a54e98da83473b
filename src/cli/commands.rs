//! CLI command definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cablecast")]
#[command(about = "Real-time publish/subscribe broadcast hub", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database URL for the Postgres relay bus
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Admin key for full access and the HTTP broadcast endpoint
    #[arg(long, env = "CABLECAST_ADMIN_KEY", global = true)]
    pub admin_key: Option<String>,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the hub
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:8080", env = "CABLECAST_BIND")]
        bind: String,

        /// Token signing secret; without it every client is accepted
        #[arg(long, env = "CABLECAST_SECRET")]
        secret: Option<String>,

        /// Rebroadcast data frames to the channel's topics
        #[arg(long)]
        republish: bool,

        /// Heartbeat interval in seconds
        #[arg(long, default_value_t = 3, env = "CABLECAST_HEARTBEAT")]
        heartbeat: u64,

        /// Outbound queue capacity per connection
        #[arg(long, default_value_t = 256, env = "CABLECAST_QUEUE_CAPACITY")]
        capacity: usize,

        /// Run without the Postgres relay even if a database is configured
        #[arg(long)]
        standalone: bool,
    },

    /// Create a signed subscriber token
    ///
    /// Examples:
    ///   cablecast token -p read 'room:*'
    ///   cablecast token -p all 'chat.lobby' --client-id alice --ttl 3600
    Token {
        /// Permission type: read, write, or all (can be repeated)
        #[arg(short, long = "permission", value_parser = parse_grant_type, required = true)]
        permission: Vec<String>,

        /// Topic pattern(s) to grant access to
        #[arg(required = true)]
        patterns: Vec<String>,

        /// Client ID carried by the token
        #[arg(long)]
        client_id: Option<String>,

        /// Lifetime in seconds
        #[arg(long)]
        ttl: Option<u64>,

        /// Token signing secret
        #[arg(long, env = "CABLECAST_SECRET")]
        secret: String,
    },

    /// Publish a JSON payload to a topic through the Postgres bus
    Publish {
        topic: String,

        /// JSON payload
        payload: String,
    },
}

fn parse_grant_type(s: &str) -> Result<String, String> {
    match s.to_lowercase().as_str() {
        "read" | "write" | "all" => Ok(s.to_lowercase()),
        _ => Err(format!("Invalid permission type: {}. Must be read, write, or all", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_defaults() {
        let cli = Cli::try_parse_from(["cablecast", "serve"]).unwrap();
        match cli.command {
            Commands::Serve {
                bind,
                republish,
                heartbeat,
                capacity,
                standalone,
                ..
            } => {
                assert_eq!(bind, "0.0.0.0:8080");
                assert!(!republish);
                assert_eq!(heartbeat, 3);
                assert_eq!(capacity, 256);
                assert!(!standalone);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_token() {
        let cli = Cli::try_parse_from([
            "cablecast", "token", "-p", "READ", "-p", "write", "room:*", "--secret", "s", "--ttl", "60",
        ])
        .unwrap();
        match cli.command {
            Commands::Token {
                permission,
                patterns,
                ttl,
                ..
            } => {
                assert_eq!(permission, vec!["read", "write"]);
                assert_eq!(patterns, vec!["room:*"]);
                assert_eq!(ttl, Some(60));
            }
            _ => panic!("expected token"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_permission() {
        assert!(Cli::try_parse_from(["cablecast", "token", "-p", "create", "room:*", "--secret", "s"]).is_err());
    }
}
