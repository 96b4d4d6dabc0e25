//! circusctl - send control commands to a running circus daemon
//!
//! # Usage
//!
//! ```text
//! circusctl list                       # watcher names
//! circusctl list web                   # pids of watcher "web"
//! circusctl incr web -p nb=2           # two more "web" processes
//! circusctl --cast quit                # fire and forget
//! circusctl discover                   # find a daemon via UDP
//! ```

use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use circus_protocol::{ControlMessage, Endpoint, MulticastEndpoint, Properties};
use circusd::client::{discover, CircusClient, DEFAULT_TIMEOUT};
use circusd::config::ENDPOINT_ENV;

// ============================================================================
// CLI Arguments
// ============================================================================

/// circusctl - control a running circus daemon
#[derive(Parser, Debug)]
#[command(name = "circusctl", version, about)]
struct Args {
    /// Control endpoint (tcp://host:port or ipc:///path)
    #[arg(long, short = 'e', global = true, env = ENDPOINT_ENV)]
    endpoint: Option<Endpoint>,

    /// Seconds to wait for a response
    #[arg(long, global = true)]
    timeout: Option<f64>,

    /// Send the command as a cast and do not wait for a response
    #[arg(long)]
    cast: bool,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Find a daemon by probing a discovery address
    Discover {
        /// Discovery address
        #[arg(long, short = 'm', default_value = "udp://237.219.251.97:12027")]
        multicast: MulticastEndpoint,
    },

    /// Send any command, e.g. `list`, `stats web`, `signal web -p signum=HUP`
    #[command(external_subcommand)]
    Command(Vec<String>),
}

/// `<command> [name] [-p key=value]...`
#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct CommandArgs {
    command: String,

    /// Watcher name, sent as the `name` property
    name: Option<String>,

    /// Extra property; the value is parsed as JSON, falling back to a string
    #[arg(short = 'p', long = "property", value_parser = parse_property)]
    properties: Vec<(String, Value)>,
}

fn parse_property(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("empty property name in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn build_message(args: CommandArgs) -> ControlMessage {
    let mut properties = Properties::new();
    if let Some(name) = args.name {
        properties.insert("name".to_string(), Value::String(name));
    }
    for (key, value) in args.properties {
        properties.insert(key, value);
    }

    let id = format!("circusctl-{}", process::id());
    let mut message = ControlMessage::new(id, args.command);
    message.properties = properties;
    message
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("circusd=warn".parse()?))
        .init();

    let args = Args::parse();
    let wait = match args.timeout {
        Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
        Some(secs) => bail!("timeout must be a positive number of seconds, got {secs}"),
        None => DEFAULT_TIMEOUT,
    };

    match args.command {
        Action::Discover { multicast } => {
            let reply = discover(&multicast, wait)
                .await
                .with_context(|| format!("No daemon answered on {multicast}"))?;
            println!("{}", reply.endpoint);
            Ok(())
        }
        Action::Command(raw) => {
            let command = CommandArgs::try_parse_from(raw).unwrap_or_else(|e| e.exit());
            let message = build_message(command);
            let client = CircusClient::new(args.endpoint.unwrap_or_default()).with_timeout(wait);

            if args.cast {
                client.cast(&message).await?;
                return Ok(());
            }

            let response = client.call(&message).await?;
            let text = String::from_utf8_lossy(&response.to_bytes()?).into_owned();
            println!("{text}");
            if !response.is_ok() {
                process::exit(1);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_property() {
        assert_eq!(parse_property("nb=2").unwrap(), ("nb".to_string(), json!(2)));
        assert_eq!(
            parse_property("signum=HUP").unwrap(),
            ("signum".to_string(), json!("HUP"))
        );
        assert!(parse_property("nb").is_err());
        assert!(parse_property("=2").is_err());
    }

    #[test]
    fn test_build_message() {
        let args = CommandArgs::try_parse_from(["incr", "web", "-p", "nb=3"]).unwrap();
        let message = build_message(args);
        assert_eq!(message.command, "incr");
        assert_eq!(message.properties.get("name"), Some(&json!("web")));
        assert_eq!(message.properties.get("nb"), Some(&json!(3)));
        assert!(!message.is_cast());
    }
}
