use gcs_resource::{
    config::{AppConfig, BackendKind, Command},
    handlers::command_handlers::run,
};
use tempfile::TempDir;

fn local_config(dir: &TempDir) -> AppConfig {
    AppConfig {
        backend: BackendKind::Local,
        storage_dir: dir.path().join("objects").display().to_string(),
        database_url: format!("sqlite://{}", dir.path().join("meta/cli.db").display()),
        endpoint: "http://127.0.0.1:1".into(),
        access_token: None,
        user_agent: "gcs-resource-test".into(),
        host: "127.0.0.1".into(),
        port: 0,
        progress: false,
    }
}

async fn output(cfg: &AppConfig, command: Command) -> String {
    let mut out = Vec::new();
    run(cfg, command, &mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn commands_drive_the_local_backend() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = local_config(&dir);
    let source = dir.path().join("f.txt");
    std::fs::write(&source, b"hello").unwrap();

    let created = output(
        &cfg,
        Command::CreateBucket {
            bucket: "demo-v".into(),
            versioning: true,
        },
    )
    .await;
    assert!(created.contains("\"versioning_enabled\": true"));

    let generation: i64 = output(
        &cfg,
        Command::Upload {
            bucket: "demo-v".into(),
            path: "f.txt".into(),
            source: source.display().to_string(),
            content_type: "text/plain".into(),
            predefined_acl: String::new(),
            cache_control: String::new(),
        },
    )
    .await
    .trim()
    .parse()
    .unwrap();
    assert!(generation > 0);

    let listed = output(
        &cfg,
        Command::List {
            bucket: "demo-v".into(),
            prefix: String::new(),
        },
    )
    .await;
    assert_eq!(listed, "f.txt\n");

    let generations = output(
        &cfg,
        Command::Generations {
            bucket: "demo-v".into(),
            path: "f.txt".into(),
        },
    )
    .await;
    assert_eq!(generations, format!("{generation}\n"));

    let url = output(
        &cfg,
        Command::Url {
            bucket: "demo-v".into(),
            path: "f.txt".into(),
            generation,
        },
    )
    .await;
    assert_eq!(url, format!("gs://demo-v/f.txt#{generation}\n"));

    let dest = dir.path().join("copy.txt");
    output(
        &cfg,
        Command::Download {
            bucket: "demo-v".into(),
            path: "f.txt".into(),
            dest: dest.display().to_string(),
            generation: 0,
        },
    )
    .await;
    assert_eq!(std::fs::read(&dest).unwrap(), b"hello");

    let info = output(
        &cfg,
        Command::Info {
            bucket: "demo-v".into(),
            path: "f.txt".into(),
        },
    )
    .await;
    let info: serde_json::Value = serde_json::from_str(&info).unwrap();
    assert_eq!(info["generation"], generation);
    assert_eq!(info["content_type"], "text/plain");

    output(
        &cfg,
        Command::Delete {
            bucket: "demo-v".into(),
            path: "f.txt".into(),
            generation: 0,
        },
    )
    .await;
    let listed = output(
        &cfg,
        Command::List {
            bucket: "demo-v".into(),
            prefix: String::new(),
        },
    )
    .await;
    assert!(listed.is_empty());
}

#[tokio::test]
async fn serve_is_not_a_client_command() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = local_config(&dir);
    let mut out = Vec::new();
    assert!(run(&cfg, Command::Serve, &mut out).await.is_err());
}
