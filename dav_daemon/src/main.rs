mod daemon;
mod local_channel;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::daemon::{
    run_dav_daemon, DaemonCommand, DavDaemonRunOptions, DEFAULT_DAV_DAEMON_CONFIG_PATH,
};

fn usage() -> String {
    format!(
        "usage: dav_daemon [--config <path>] <command> [args]\n\
         commands:\n\
         reconcile\n\
         mkdir <path>\n\
         rmdir <path>\n\
         put <local-file> <path> [--content-type <type>]\n\
         get <path> <local-file>\n\
         rm <path>\n\
         ls <path>\n\
         stat <path>\n\
         defaults:\n\
         --config {}",
        DEFAULT_DAV_DAEMON_CONFIG_PATH
    )
}

fn take_arg(rest: &[String], index: usize, what: &str) -> Result<String, String> {
    rest.get(index)
        .cloned()
        .ok_or_else(|| format!("missing {}\n{}", what, usage()))
}

fn parse_command(rest: &[String]) -> Result<DaemonCommand, String> {
    let name = take_arg(rest, 0, "command")?;
    let command = match name.as_str() {
        "reconcile" => DaemonCommand::Reconcile,
        "mkdir" => DaemonCommand::Mkdir(take_arg(rest, 1, "path")?),
        "rmdir" => DaemonCommand::Rmdir(take_arg(rest, 1, "path")?),
        "rm" => DaemonCommand::Rm(take_arg(rest, 1, "path")?),
        "ls" => DaemonCommand::Ls(take_arg(rest, 1, "path").unwrap_or_else(|_| "/".to_string())),
        "stat" => DaemonCommand::Stat(take_arg(rest, 1, "path")?),
        "get" => DaemonCommand::Get {
            remote: take_arg(rest, 1, "path")?,
            local: PathBuf::from(take_arg(rest, 2, "local file")?),
        },
        "put" => {
            let local = PathBuf::from(take_arg(rest, 1, "local file")?);
            let remote = take_arg(rest, 2, "path")?;
            let content_type = match rest.get(3).map(|s| s.as_str()) {
                Some("--content-type") => Some(take_arg(rest, 4, "value for --content-type")?),
                Some(other) => return Err(format!("unknown argument: {}\n{}", other, usage())),
                None => None,
            };
            DaemonCommand::Put {
                local,
                remote,
                content_type,
            }
        }
        other => return Err(format!("unknown command: {}\n{}", other, usage())),
    };
    Ok(command)
}

fn parse_args(args: &[String]) -> Result<DavDaemonRunOptions, String> {
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mut config_path = PathBuf::from(DEFAULT_DAV_DAEMON_CONFIG_PATH);
    let mut i = 0usize;
    while i < args.len() && args[i].starts_with("--") {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(DavDaemonRunOptions {
        config_path,
        command: parse_command(&args[i..])?,
    })
}

fn main() {
    env_logger::init();
    let args = env::args().skip(1).collect::<Vec<String>>();
    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    match run_dav_daemon(options) {
        Ok(output) => println!("{}", output),
        Err(err) => {
            error!("dav_daemon failed: {}", err);
            eprintln!("error ({}): {}", err.status_code(), err);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod daemon_tests;
