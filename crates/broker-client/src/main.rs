use std::collections::HashMap;
use std::fmt;
use std::process::ExitCode;
use std::time::Duration;

use broker_client::config::FileConfig;
use broker_client::{BrokerClient, ClientConfig};
use broker_helpers::logging;

const EX_USAGE: u8 = 64;
const EX_TEMPFAIL: u8 = 75;

type Result<T> = std::result::Result<T, CliError>;

fn main() -> ExitCode {
    logging::init_logging("broker_client=info", "BROKER_LOG", "broker-client");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("broker-client error: failed to start runtime: {err}");
            return ExitCode::from(EX_TEMPFAIL);
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err {
                CliError::Usage(_) => EX_USAGE,
                CliError::Runtime(_) => EX_TEMPFAIL,
            };
            eprintln!("broker-client error: {err}");
            ExitCode::from(code)
        }
    }
}

async fn run() -> Result<()> {
    let args = Cli::parse(std::env::args().skip(1))?;
    let defaults = FileConfig::load().map_err(|err| runtime_err("failed to load config file", err))?;

    let server = args.server.or(defaults.server).ok_or_else(|| {
        CliError::Usage("missing --server (and no default in ~/.broker-client.yaml)".to_string())
    })?;
    let token = args.token.or(defaults.token);

    let config = ClientConfig {
        server,
        token,
        request_timeout: Duration::from_secs(args.timeout_secs),
        ..ClientConfig::default()
    };
    let client = BrokerClient::connect(config);

    match args.command {
        Command::Publish { queue, payload, priority, ttl_ms } => {
            let id = client
                .publish(&queue, payload.into_bytes(), priority.as_deref(), ttl_ms)
                .await
                .map_err(|err| runtime_err("publish failed", err))?;
            println!("published: id={id}");
        }
        Command::Subscribe { queue, count } => {
            let mut subscription =
                client.subscribe(&queue).await.map_err(|err| runtime_err("subscribe failed", err))?;
            let mut received = 0_u64;
            while count == 0 || received < count {
                let Some(delivery) = subscription.recv().await else {
                    break;
                };
                println!(
                    "delivery: tag={}, queue={}, attempts={}, payload={}",
                    delivery.delivery_tag,
                    delivery.queue,
                    delivery.delivery_attempts,
                    String::from_utf8_lossy(&delivery.payload)
                );
                client
                    .ack(&delivery.delivery_tag)
                    .await
                    .map_err(|err| runtime_err("ack failed", err))?;
                received += 1;
            }
        }
        Command::CreateQueue { queue, headers } => {
            client.create_queue(&queue, headers).await.map_err(|err| runtime_err("create-queue failed", err))?;
            println!("queue created: {queue}");
        }
        Command::DeleteQueue { queue } => {
            client.delete_queue(&queue).await.map_err(|err| runtime_err("delete-queue failed", err))?;
            println!("queue deleted: {queue}");
        }
        Command::QueueInfo { queue } => {
            let response = client.queue_info(&queue).await.map_err(|err| runtime_err("queue-info failed", err))?;
            println!("{}", String::from_utf8_lossy(response.payload.as_deref().unwrap_or_default()));
        }
        Command::ListQueues => {
            let queues = client.list_queues().await.map_err(|err| runtime_err("list-queues failed", err))?;
            for queue in queues {
                println!("{queue}");
            }
        }
        Command::ListDlq { queue, reason, limit } => {
            let records = client
                .list_dlq(queue.as_deref(), reason.as_deref(), limit)
                .await
                .map_err(|err| runtime_err("list-dlq failed", err))?;
            for record in records {
                println!("{record}");
            }
        }
        Command::ReplayDlq { id } => {
            client.replay_dlq(&id).await.map_err(|err| runtime_err("replay-dlq failed", err))?;
            println!("replayed: id={id}");
        }
    }

    Ok(())
}

#[derive(Debug)]
struct Cli {
    server: Option<String>,
    token: Option<String>,
    timeout_secs: u64,
    command: Command,
}

#[derive(Debug)]
enum Command {
    Publish { queue: String, payload: String, priority: Option<String>, ttl_ms: Option<u64> },
    Subscribe { queue: String, count: u64 },
    CreateQueue { queue: String, headers: HashMap<String, String> },
    DeleteQueue { queue: String },
    QueueInfo { queue: String },
    ListQueues,
    ListDlq { queue: Option<String>, reason: Option<String>, limit: usize },
    ReplayDlq { id: String },
}

impl Cli {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let subcommand = args.next().ok_or_else(|| CliError::Usage(USAGE.to_string()))?;

        let mut server = None;
        let mut token = None;
        let mut timeout_secs = 10_u64;
        let mut queue = None;
        let mut payload = None;
        let mut priority = None;
        let mut ttl_ms = None;
        let mut count = 0_u64;
        let mut headers = HashMap::new();
        let mut reason = None;
        let mut limit = 100_usize;
        let mut id = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--server" => server = Some(next_value(&mut args, "--server")?),
                "--token" => token = Some(next_value(&mut args, "--token")?),
                "--timeout-secs" => timeout_secs = parse_value(&mut args, "--timeout-secs")?,
                "--queue" => queue = Some(next_value(&mut args, "--queue")?),
                "--payload" => payload = Some(next_value(&mut args, "--payload")?),
                "--priority" => priority = Some(next_value(&mut args, "--priority")?),
                "--ttl-ms" => ttl_ms = Some(parse_value(&mut args, "--ttl-ms")?),
                "--count" => count = parse_value(&mut args, "--count")?,
                "--header" => {
                    let raw = next_value(&mut args, "--header")?;
                    let (key, value) = raw.split_once('=').ok_or_else(|| {
                        CliError::Usage("--header must be in key=value form".to_string())
                    })?;
                    headers.insert(key.to_string(), value.to_string());
                }
                "--reason" => reason = Some(next_value(&mut args, "--reason")?),
                "--limit" => limit = parse_value(&mut args, "--limit")?,
                "--id" => id = Some(next_value(&mut args, "--id")?),
                "-h" | "--help" => return Err(CliError::Usage(USAGE.to_string())),
                other => return Err(CliError::Usage(format!("unknown argument: {other}"))),
            }
        }

        let command = match subcommand.as_str() {
            "publish" => Command::Publish {
                queue: require(queue, "--queue")?,
                payload: require(payload, "--payload")?,
                priority,
                ttl_ms,
            },
            "subscribe" => Command::Subscribe { queue: require(queue, "--queue")?, count },
            "create-queue" => Command::CreateQueue { queue: require(queue, "--queue")?, headers },
            "delete-queue" => Command::DeleteQueue { queue: require(queue, "--queue")? },
            "queue-info" => Command::QueueInfo { queue: require(queue, "--queue")? },
            "list-queues" => Command::ListQueues,
            "list-dlq" => Command::ListDlq { queue, reason, limit },
            "replay-dlq" => Command::ReplayDlq { id: require(id, "--id")? },
            other => return Err(CliError::Usage(format!("unknown command: {other}\n{USAGE}"))),
        };

        Ok(Self { server, token, timeout_secs, command })
    }
}

const USAGE: &str = "usage: broker-client <publish|subscribe|create-queue|delete-queue|queue-info|list-queues|list-dlq|replay-dlq> [flags]";

fn next_value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<String> {
    args.next().ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn parse_value<I: Iterator<Item = String>, T: std::str::FromStr>(args: &mut I, flag: &str) -> Result<T> {
    let raw = next_value(args, flag)?;
    raw.parse().map_err(|_| CliError::Usage(format!("{flag} must be a valid number")))
}

fn require<T>(value: Option<T>, flag: &str) -> Result<T> {
    value.ok_or_else(|| CliError::Usage(format!("missing required argument {flag}")))
}

fn runtime_err(context: impl Into<String>, err: impl fmt::Display) -> CliError {
    CliError::Runtime(format!("{}: {err}", context.into()))
}

#[derive(Debug)]
enum CliError {
    Usage(String),
    Runtime(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Usage(msg) => write!(f, "{msg}"),
            CliError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CliError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_publish_command() {
        let args = vec![
            "publish".to_string(),
            "--queue".to_string(),
            "orders".to_string(),
            "--payload".to_string(),
            "hello".to_string(),
            "--priority".to_string(),
            "high".to_string(),
        ];
        let cli = Cli::parse(args.into_iter()).expect("parse should succeed");
        match cli.command {
            Command::Publish { queue, payload, priority, ttl_ms } => {
                assert_eq!(queue, "orders");
                assert_eq!(payload, "hello");
                assert_eq!(priority.as_deref(), Some("high"));
                assert_eq!(ttl_ms, None);
            }
            other => panic!("expected publish command, got {other:?}"),
        }
    }

    #[test]
    fn parse_missing_queue_fails() {
        let args = vec!["publish".to_string(), "--payload".to_string(), "hello".to_string()];
        let err = Cli::parse(args.into_iter()).expect_err("should fail");
        match err {
            CliError::Usage(msg) => assert!(msg.contains("--queue")),
            other => panic!("expected usage error, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_command_fails() {
        let err = Cli::parse(vec!["frobnicate".to_string()].into_iter()).expect_err("should fail");
        match err {
            CliError::Usage(msg) => assert!(msg.contains("unknown command")),
            other => panic!("expected usage error, got {other:?}"),
        }
    }

    #[test]
    fn parse_header_requires_key_value_form() {
        let args = vec![
            "create-queue".to_string(),
            "--queue".to_string(),
            "orders".to_string(),
            "--header".to_string(),
            "not-a-pair".to_string(),
        ];
        let err = Cli::parse(args.into_iter()).expect_err("should fail");
        match err {
            CliError::Usage(msg) => assert!(msg.contains("key=value")),
            other => panic!("expected usage error, got {other:?}"),
        }
    }
}
