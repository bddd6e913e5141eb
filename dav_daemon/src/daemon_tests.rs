use crate::daemon::{
    execute_command, init_engine, read_json_config, run_dav_daemon, DaemonCommand,
    DavDaemonRunOptions, DavDaemonServiceConfig,
};
use crate::parse_args;
use std::path::PathBuf;
use tempfile::TempDir;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn create_test_config(tmp: &TempDir) -> PathBuf {
    let config_path = tmp.path().join("dav_daemon.json");
    let config_json = serde_json::json!({
        "db_path": tmp.path().join("meta").join("meta.db"),
        "blob_dir": tmp.path().join("blobs"),
        "engine": { "max_chunk_size": 8, "max_in_flight": 2 }
    });
    std::fs::write(
        &config_path,
        serde_json::to_string_pretty(&config_json).expect("serialize config"),
    )
    .expect("write config");
    config_path
}

#[test]
fn test_parse_args() {
    let options = parse_args(&args(&[
        "--config",
        "/tmp/c.json",
        "put",
        "a.txt",
        "/d/a.txt",
        "--content-type",
        "text/plain",
    ]))
    .expect("parse put");
    assert_eq!(options.config_path, PathBuf::from("/tmp/c.json"));
    assert_eq!(
        options.command,
        DaemonCommand::Put {
            local: PathBuf::from("a.txt"),
            remote: "/d/a.txt".to_string(),
            content_type: Some("text/plain".to_string()),
        }
    );

    let options = parse_args(&args(&["ls"])).expect("parse ls");
    assert_eq!(options.command, DaemonCommand::Ls("/".to_string()));

    assert!(parse_args(&args(&[])).is_err());
    assert!(parse_args(&args(&["--config"])).is_err());
    assert!(parse_args(&args(&["frobnicate"])).is_err());
    assert!(parse_args(&args(&["get", "/a"])).is_err());
}

#[test]
fn test_service_config_defaults() {
    let tmp = TempDir::new().expect("create temp dir");
    let config_path = create_test_config(&tmp);
    let config: DavDaemonServiceConfig = read_json_config(&config_path).expect("read config");
    assert_eq!(config.engine.max_chunk_size, 8);
    assert_eq!(config.engine.max_in_flight, 2);
    assert!(config.engine.auto_create_parents);
    assert!(config.blob_max_size.is_none());

    let missing = read_json_config::<DavDaemonServiceConfig>(&tmp.path().join("none.json"));
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_commands_end_to_end() {
    let tmp = TempDir::new().expect("create temp dir");
    let config: DavDaemonServiceConfig =
        read_json_config(&create_test_config(&tmp)).expect("read config");
    let engine = init_engine(&config).await.expect("init engine");

    let local = tmp.path().join("input.bin");
    let data: Vec<u8> = (0..20u8).collect();
    std::fs::write(&local, &data).expect("write input");

    let out = execute_command(
        &engine,
        DaemonCommand::Put {
            local: local.clone(),
            remote: "/docs/input.bin".to_string(),
            content_type: None,
        },
    )
    .await
    .expect("put");
    assert!(out.contains("3 chunk(s)"));

    let stat = execute_command(&engine, DaemonCommand::Stat("/docs/input.bin".to_string()))
        .await
        .expect("stat");
    let stat: serde_json::Value = serde_json::from_str(&stat).expect("stat json");
    assert_eq!(stat["size"], 20);
    assert_eq!(stat["chunks"], 3);

    let listing = execute_command(&engine, DaemonCommand::Ls("/docs".to_string()))
        .await
        .expect("ls");
    let listing: serde_json::Value = serde_json::from_str(&listing).expect("ls json");
    assert_eq!(listing[0]["name"], "input.bin");
    assert_eq!(listing[0]["is_folder"], false);

    let fetched = tmp.path().join("output.bin");
    execute_command(
        &engine,
        DaemonCommand::Get {
            remote: "/docs/input.bin".to_string(),
            local: fetched.clone(),
        },
    )
    .await
    .expect("get");
    assert_eq!(std::fs::read(&fetched).expect("read output"), data);

    execute_command(&engine, DaemonCommand::Rm("/docs/input.bin".to_string()))
        .await
        .expect("rm");
    let again = execute_command(&engine, DaemonCommand::Rm("/docs/input.bin".to_string())).await;
    assert_eq!(again.unwrap_err().status_code(), 404);

    execute_command(&engine, DaemonCommand::Rmdir("/docs".to_string()))
        .await
        .expect("rmdir");
    let report = execute_command(&engine, DaemonCommand::Reconcile)
        .await
        .expect("reconcile");
    let report: serde_json::Value = serde_json::from_str(&report).expect("report json");
    assert_eq!(report["rolled_back_files"].as_array().map(|a| a.len()), Some(0));
}

#[test]
fn test_run_dav_daemon_persists_between_runs() {
    let tmp = TempDir::new().expect("create temp dir");
    let config_path = create_test_config(&tmp);

    let out = run_dav_daemon(DavDaemonRunOptions {
        config_path: config_path.clone(),
        command: DaemonCommand::Ls("/".to_string()),
    })
    .expect("ls on empty store");
    let listing: serde_json::Value = serde_json::from_str(&out).expect("ls json");
    assert_eq!(listing.as_array().map(|a| a.len()), Some(0));

    let out = run_dav_daemon(DavDaemonRunOptions {
        config_path: config_path.clone(),
        command: DaemonCommand::Mkdir("/projects".to_string()),
    })
    .expect("mkdir");
    assert!(out.starts_with("created /projects"));

    let out = run_dav_daemon(DavDaemonRunOptions {
        config_path,
        command: DaemonCommand::Ls("/".to_string()),
    })
    .expect("ls");
    assert!(out.contains("\"projects\""));
}
