//! veil-ctl: command-line interface for the Veil daemon.

mod cmd;

use std::collections::HashMap;

use anyhow::{Context, Result};

use cmd::{communities, network, status, transfers};

const DEFAULT_PORT: u16 = 7421;

/// Options that take a value. `--anonymous` is the only bare flag.
const VALUE_OPTIONS: [&str; 7] = [
    "--port",
    "--timeout-ms",
    "--state",
    "--tags",
    "--limit",
    "--name",
    "--direction",
];

struct Args {
    options: HashMap<String, String>,
    anonymous: bool,
    words: Vec<String>,
}

impl Args {
    fn parse(raw: Vec<String>) -> Result<Self> {
        let mut options = HashMap::new();
        let mut anonymous = false;
        let mut words = Vec::new();
        let mut iter = raw.into_iter();
        while let Some(arg) = iter.next() {
            if VALUE_OPTIONS.contains(&arg.as_str()) {
                let value = iter
                    .next()
                    .with_context(|| format!("{} requires a value", arg))?;
                options.insert(arg, value);
            } else if arg == "--anonymous" {
                anonymous = true;
            } else {
                words.push(arg);
            }
        }
        Ok(Self {
            options,
            anonymous,
            words,
        })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    fn number<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>> {
        self.get(name)
            .map(|v| v.parse().ok().with_context(|| format!("{} must be a number", name)))
            .transpose()
    }
}

fn print_usage() {
    println!("Usage: veil-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                         Network health, throughput, and store");
    println!("  peers [--state s] [--anonymous] List known peers");
    println!("  transfers                      Active and recent transfers");
    println!("  publish <path>                 Publish a local file");
    println!("  upload <path>                  Send a file to the daemon and publish it");
    println!("  fetch <hash> <dest> [--timeout-ms n]");
    println!("                                 Fetch content by hash");
    println!("  seed <dir>                     Publish every file in a folder");
    println!("  cancel <id|hash> [--direction publish|fetch]");
    println!("                                 Cancel a transfer");
    println!("  bootstrap                      Show bootstrap state");
    println!("  enable [--timeout-ms n]        Bring the network up");
    println!("  disable                        Take the network down");
    println!("  discover [text] [--tags a,b] [--limit n]");
    println!("                                 Search communities");
    println!("  join <community> [--name n]    Join a community");
    println!("  joined                         List joined communities");
    println!("  leave <community>              Leave a community");
    println!("  settings                       Show stored settings");
    println!("  set <key> <value>              Change a setting");
    println!("  shutdown                       Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse(std::env::args().skip(1).collect())?;
    let port = args.number("--port")?.unwrap_or(DEFAULT_PORT);
    let timeout_ms = args.number::<u64>("--timeout-ms")?;
    let words: Vec<&str> = args.words.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["status"] | [] => status::cmd_status(port).await,
        ["peers"] => status::cmd_peers(port, args.get("--state"), args.anonymous).await,
        ["settings"] => status::cmd_settings(port).await,
        ["set", key, value] => status::cmd_set(port, key, value).await,
        ["shutdown"] => status::cmd_shutdown(port).await,
        ["transfers"] => transfers::cmd_transfers(port).await,
        ["publish", path] => transfers::cmd_publish(port, path).await,
        ["upload", path] => transfers::cmd_upload(port, path).await,
        ["fetch", hash, dest] => transfers::cmd_fetch(port, hash, dest, timeout_ms).await,
        ["seed", dir] => transfers::cmd_seed(port, dir).await,
        ["cancel", target] => transfers::cmd_cancel(port, target, args.get("--direction")).await,
        ["bootstrap"] => network::cmd_bootstrap(port).await,
        ["enable"] => network::cmd_enable(port, timeout_ms).await,
        ["disable"] => network::cmd_disable(port).await,
        ["discover", text @ ..] => {
            communities::cmd_discover(port, &text.join(" "), args.get("--tags"), args.number("--limit")?)
                .await
        }
        ["join", community] => communities::cmd_join(port, community, args.get("--name")).await,
        ["joined"] => communities::cmd_joined(port).await,
        ["leave", community] => communities::cmd_leave(port, community).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
