// SPDX-License-Identifier: Apache-2.0

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

const DEFAULT_SOCKET: &str = "/var/lib/netbridge/netbridged.sock";

fn main() {
    let mut cli_cmd = clap::Command::new("netbridgectl")
        .about("managed bridge network driver CLI")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .arg(
            clap::Arg::new("quiet")
                .short('q')
                .action(clap::ArgAction::SetTrue)
                .help("disable logging")
                .global(true),
        )
        .arg(
            clap::Arg::new("verbose")
                .short('v')
                .action(clap::ArgAction::Count)
                .help("increase verbosity")
                .global(true),
        )
        .arg(
            clap::Arg::new("socket")
                .long("socket")
                .default_value(DEFAULT_SOCKET)
                .global(true)
                .help("path to the netbridged unix socket"),
        )
        .subcommand(clap::Command::new("ping").about("check daemon connectivity"))
        .subcommand(
            clap::Command::new("show")
                .about("show a network's current state")
                .arg(clap::Arg::new("network").required(true)),
        )
        .subcommand(
            clap::Command::new("apply")
                .about("create/reconcile a network from a YAML config file")
                .arg(clap::Arg::new("network").required(true))
                .arg(clap::Arg::new("project").long("project").default_value("default"))
                .arg(clap::Arg::new("config").long("config").required(true)),
        )
        .subcommand(
            clap::Command::new("update")
                .about("diff/apply a config change against an existing network")
                .arg(clap::Arg::new("network").required(true))
                .arg(clap::Arg::new("config").long("config").required(true)),
        )
        .subcommand(
            clap::Command::new("rename")
                .about("rename an existing network's bridge interface")
                .arg(clap::Arg::new("network").required(true))
                .arg(clap::Arg::new("new_name").long("to").required(true)),
        )
        .subcommand(
            clap::Command::new("forward")
                .about("create a per-member address forward")
                .arg(clap::Arg::new("network").required(true))
                .arg(clap::Arg::new("listen").long("listen").required(true))
                .arg(clap::Arg::new("target").long("target")),
        )
        .subcommand(
            clap::Command::new("lease")
                .about("show the dnsmasq lease file for a network")
                .arg(clap::Arg::new("network").required(true)),
        )
        .subcommand(
            clap::Command::new("heartbeat")
                .about("push a cluster peer-address list to the forkdns supervisor")
                .arg(clap::Arg::new("network").required(true))
                .arg(clap::Arg::new("peers").long("peer").action(clap::ArgAction::Append)),
        );

    let matches = cli_cmd.get_matches_mut();

    let log_level = match matches.get_count("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if !matches.get_flag("quiet") {
        env_logger::Builder::new().filter(Some("netbridgectl"), log_level).init();
    }

    if let Err(e) = call_subcommand(&matches) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn call_subcommand(matches: &clap::ArgMatches) -> Result<(), String> {
    let socket = matches.get_one::<String>("socket").expect("has default").clone();

    if matches.subcommand_matches("ping").is_some() {
        let resp = send(&socket, serde_json::json!({"op": "ping"}))?;
        println!("{}", resp["message"].as_str().unwrap_or(""));
        return Ok(());
    }
    if let Some(m) = matches.subcommand_matches("show") {
        let network = m.get_one::<String>("network").unwrap();
        let resp = send(&socket, serde_json::json!({"op": "show", "network": network}))?;
        print_response(&resp);
        return Ok(());
    }
    if let Some(m) = matches.subcommand_matches("apply") {
        let network = m.get_one::<String>("network").unwrap();
        let project = m.get_one::<String>("project").unwrap();
        let config_path = m.get_one::<String>("config").unwrap();
        let text = std::fs::read_to_string(config_path).map_err(|e| format!("reading '{config_path}': {e}"))?;
        let config: netbridge::types::ConfigMap =
            serde_yaml::from_str(&text).map_err(|e| format!("parsing '{config_path}': {e}"))?;
        let resp = send(
            &socket,
            serde_json::json!({"op": "apply", "network": network, "project": project, "config": config}),
        )?;
        print_response(&resp);
        return Ok(());
    }
    if let Some(m) = matches.subcommand_matches("update") {
        let network = m.get_one::<String>("network").unwrap();
        let config_path = m.get_one::<String>("config").unwrap();
        let text = std::fs::read_to_string(config_path).map_err(|e| format!("reading '{config_path}': {e}"))?;
        let config: netbridge::types::ConfigMap =
            serde_yaml::from_str(&text).map_err(|e| format!("parsing '{config_path}': {e}"))?;
        let resp = send(&socket, serde_json::json!({"op": "update", "network": network, "config": config}))?;
        print_response(&resp);
        return Ok(());
    }
    if let Some(m) = matches.subcommand_matches("rename") {
        let network = m.get_one::<String>("network").unwrap();
        let new_name = m.get_one::<String>("new_name").unwrap();
        let resp = send(&socket, serde_json::json!({"op": "rename", "network": network, "new_name": new_name}))?;
        print_response(&resp);
        return Ok(());
    }
    if let Some(m) = matches.subcommand_matches("forward") {
        let network = m.get_one::<String>("network").unwrap();
        let listen = m.get_one::<String>("listen").unwrap();
        let target = m.get_one::<String>("target");
        let resp = send(
            &socket,
            serde_json::json!({
                "op": "forward",
                "network": network,
                "listen_address": listen,
                "target_address": target,
            }),
        )?;
        print_response(&resp);
        return Ok(());
    }
    if let Some(m) = matches.subcommand_matches("lease") {
        let network = m.get_one::<String>("network").unwrap();
        let resp = send(&socket, serde_json::json!({"op": "lease", "network": network}))?;
        print_response(&resp);
        return Ok(());
    }
    if let Some(m) = matches.subcommand_matches("heartbeat") {
        let network = m.get_one::<String>("network").unwrap();
        let peers: Vec<&str> = m
            .get_many::<String>("peers")
            .map(|vals| vals.map(String::as_str).collect())
            .unwrap_or_default();
        let resp = send(
            &socket,
            serde_json::json!({"op": "heartbeat", "network": network, "peer_addresses": peers}),
        )?;
        print_response(&resp);
        return Ok(());
    }

    Err("unknown command".to_string())
}

fn print_response(resp: &serde_json::Value) {
    if resp["ok"].as_bool().unwrap_or(false) {
        if let Some(network) = resp.get("network").filter(|v| !v.is_null()) {
            println!("{}", serde_json::to_string_pretty(network).unwrap_or_default());
        }
        let message = resp["message"].as_str().unwrap_or("");
        if !message.is_empty() {
            println!("{message}");
        }
    } else {
        eprintln!("error: {}", resp["message"].as_str().unwrap_or("unknown error"));
        std::process::exit(1);
    }
}

fn send(socket: &str, request: serde_json::Value) -> Result<serde_json::Value, String> {
    let mut stream = UnixStream::connect(socket).map_err(|e| format!("connecting to '{socket}': {e}"))?;
    let mut line = serde_json::to_string(&request).map_err(|e| e.to_string())?;
    line.push('\n');
    stream.write_all(line.as_bytes()).map_err(|e| format!("writing request: {e}"))?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(|e| format!("reading response: {e}"))?;
    serde_json::from_str(&response_line).map_err(|e| format!("parsing response: {e}"))
}
